//! redb table definitions for the state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Host records keyed by `{host}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Group membership keyed by `{group}/{host}`; the value is empty.
pub const GROUP_MEMBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("group_members");

/// Domain records keyed by `{group}:{domain}`.
pub const DOMAINS: TableDefinition<&str, &[u8]> = TableDefinition::new("domains");
