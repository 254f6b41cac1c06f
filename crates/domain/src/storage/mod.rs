//! Repository contracts implemented by the storage crate and by in-memory
//! fakes in engine tests.

mod traits;

pub use traits::*;
