//! Process-wide tracing setup shared by the binaries.
//!
//! Libraries in this workspace never install a subscriber. Each long-lived
//! component owns its own span; this crate only decides where records go.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::{LogFormat, init_with};
