//! The `utils` module provides the error type shared by every layer of the
//! crate and the tracing setup used by the binary and the tests.

pub mod error;
pub mod logging;

pub use error::{Nt4Error, Result};
