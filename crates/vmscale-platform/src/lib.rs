//! vmscale-platform — reporting to the upstream platform.
//!
//! The executor publishes action results and the reconciler publishes
//! telemetry; neither waits on delivery. A single forwarder task drains the
//! buffer into a [`PlatformSink`].

pub mod bridge;
pub mod error;
pub mod message;

pub use bridge::{LogSink, MemorySink, PlatformBridge, PlatformSink, forward};
pub use error::{PlatformError, PlatformResult};
pub use message::{
    ActionReport, GroupStanding, HostSummary, Outcome, PlatformMessage, TelemetryReport,
};
