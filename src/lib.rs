//! # nt4
//!
//! `nt4` implements the NetworkTables 4 publish/subscribe protocol over
//! WebSockets: a server that owns a directory of typed, named topics and
//! fans values out to subscribers, and a client that mirrors that directory.
//!
//! ## Core Modules
//!
//! - `broker`: topic directory, subscription matching, per-connection state
//!   and the server protocol engine.
//! - `client`: client protocol state and the reconnecting client handle.
//! - `config`: layered settings from defaults, files and environment.
//! - `persistence`: `sled` storage for topics marked persistent.
//! - `transport`: JSON control messages, MessagePack value frames, and the
//!   WebSocket server loop.
//! - `utils`: shared error type and tracing setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use broker::{Server, ServerEvent, SharedServer};
pub use client::{Client, ClientEvent};
pub use transport::{DataType, Value};
pub use utils::{Nt4Error, Result};
