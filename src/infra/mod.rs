//! Infrastructure adapters and runtime bootstrap.

pub(crate) mod client;
pub mod error;
pub mod telemetry;
