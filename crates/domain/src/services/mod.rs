//! Shared service helpers: tracing and metrics wiring.

pub mod telemetry;

pub use telemetry::*;
