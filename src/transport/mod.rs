//! The `transport` module is the wire layer: typed values, the binary value
//! frame codec, the JSON control messages, and the WebSocket server that
//! feeds decoded traffic into the broker.

pub mod frame;
pub mod message;
pub mod value;
pub mod websocket;

pub use frame::{ValueFrame, decode_value_frame, encode_value_frame};
pub use message::{
    ClientMessage, Properties, ServerMessage, SubscribeOptions, decode_control_messages,
    encode_control_messages,
};
pub use value::{DataType, Value};
pub use websocket::start_websocket_server;

#[cfg(test)]
mod websocket_tests;
