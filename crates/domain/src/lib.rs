//! Domain-level building blocks shared by the storage, engine and API crates.
//!
//! Everything here is free of I/O apart from environment loading and the
//! telemetry bootstrap: entities, pool arithmetic, verification-mode toggles,
//! proxy line parsing and the repository traits the engine consumes.

pub mod clock;
pub mod config;
pub mod model;
pub mod proxy_parse;
pub mod services;
pub mod storage;

pub use clock::*;
pub use config::*;
pub use model::*;
pub use proxy_parse::*;
pub use services::*;
pub use storage::*;
