//! The `persistence` module keeps persistent topics across server restarts.
//!
//! Topics whose `persistent` property is true are written to a `sled`
//! database whenever their value or properties change, and are loaded back
//! as ownerless topics when a server starts with the same path.

pub mod sled_store;

pub use sled_store::{Persistence, StoredTopic};
