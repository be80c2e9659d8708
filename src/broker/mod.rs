//! The `broker` module is the server side of the protocol: the topic
//! directory, per-connection bookkeeping, subscription matching and the
//! engine that ties them together.

pub mod connection;
pub mod directory;
pub mod engine;
pub mod matcher;
pub mod topic;

pub use engine::{Server, ServerEvent, SharedServer};
