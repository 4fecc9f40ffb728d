//! vmscale-metrics — host utilization time series.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── collect_at(now) → node_stats per host → MetricsStore::record
//!   └── run()           → periodic collection + retention pruning
//!
//! MetricsStore (redb)
//!   ├── record(subject, metric, sample)
//!   ├── trailing_window(subject, metric, n)
//!   └── prune_before(ts)
//!
//! aggregate(method, samples) → Option<f64>   ← used by the reconciler
//! ```

pub mod aggregate;
pub mod collector;
pub mod error;
pub mod store;

pub use aggregate::aggregate;
pub use collector::{CollectReport, METRIC_CPU, METRIC_MEMORY, MetricsCollector};
pub use error::{MetricsError, MetricsResult};
pub use store::{MetricsStore, Sample};
