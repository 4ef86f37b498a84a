//! Application layer
//!
//! Turns a parsed configuration into a running tunnel side and hosts the
//! operational extras (metrics endpoint).

pub mod metrics;
pub mod runtime;

pub use runtime::Runtime;
