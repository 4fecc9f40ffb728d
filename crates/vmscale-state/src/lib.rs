//! vmscale-state — the record of what is provisioned right now.
//!
//! Backed by [redb](https://docs.rs/redb). Hosts, group membership, and
//! domain (VM) records are JSON-serialized into `&[u8]` value columns under
//! composite keys (`{group}/{host}`, `{group}:{domain}`) so related records
//! can be found with prefix scans.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and every call runs in its own transaction, so executor workers can share
//! one handle without extra locking.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
