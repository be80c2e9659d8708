//! NT4 client
//!
//! - `state`: connection-independent protocol state (publications,
//!   subscriptions and the announced topic mirror)
//! - `pubsub_client`: async handle that runs sessions against a server and
//!   reconnects when they drop

pub mod pubsub_client;
pub mod state;

pub use pubsub_client::Client;
pub use state::{ClientEvent, ClientState, TopicInfo};

#[cfg(test)]
mod tests;
