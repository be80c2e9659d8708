//! Per-connection state
//!
//! `Connection` models one accepted WebSocket peer. It holds the sending
//! side of the per-connection channel drained by the transport's send loop,
//! plus the publications and subscriptions the peer created. `pubuid` and
//! `subuid` are chosen by the peer and are only unique within it.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::matcher;
use crate::transport::frame::ValueFrame;
use crate::transport::message::{
    encode_control_messages, Properties, ServerMessage, SubscribeOptions,
};

pub type ConnectionId = u64;
pub type PubUid = i64;
pub type SubUid = i64;

#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub pubuid: PubUid,
    pub name: String,
    pub type_str: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub subuid: SubUid,
    pub patterns: Vec<String>,
    pub options: SubscribeOptions,
}

impl Subscription {
    pub fn matches(&self, name: &str) -> bool {
        matcher::matches(name, &self.patterns, &self.options)
    }
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub name: String,
    pub address: String,
    pub sender: UnboundedSender<WsMessage>,
    publications: HashMap<PubUid, Publication>,
    subscriptions: HashMap<SubUid, Subscription>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        name: &str,
        address: &str,
        sender: UnboundedSender<WsMessage>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            address: address.to_string(),
            sender,
            publications: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn add_publication(&mut self, publication: Publication) {
        self.publications.insert(publication.pubuid, publication);
    }

    pub fn remove_publication(&mut self, pubuid: PubUid) -> Option<Publication> {
        self.publications.remove(&pubuid)
    }

    pub fn publication(&self, pubuid: PubUid) -> Option<&Publication> {
        self.publications.get(&pubuid)
    }

    pub fn publications(&self) -> impl Iterator<Item = &Publication> {
        self.publications.values()
    }

    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.insert(subscription.subuid, subscription);
    }

    pub fn remove_subscription(&mut self, subuid: SubUid) -> Option<Subscription> {
        self.subscriptions.remove(&subuid)
    }

    pub fn subscription(&self, subuid: SubUid) -> Option<&Subscription> {
        self.subscriptions.get(&subuid)
    }

    /// True when at least one value-carrying subscription selects `name`.
    pub fn wants_values(&self, name: &str) -> bool {
        self.subscriptions
            .values()
            .any(|s| !s.options.topics_only && s.matches(name))
    }

    pub fn send_control(&self, message: ServerMessage) {
        match encode_control_messages(&[message]) {
            Ok(text) => self.send(WsMessage::text(text)),
            Err(e) => warn!(conn = self.id, "Failed to encode control message: {e}"),
        }
    }

    pub fn send_frame(&self, frame: &ValueFrame) {
        match frame.encode() {
            Ok(bytes) => self.send_bytes(bytes),
            Err(e) => warn!(conn = self.id, "Failed to encode value frame: {e}"),
        }
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) {
        self.send(WsMessage::binary(bytes));
    }

    fn send(&self, msg: WsMessage) {
        if let Err(e) = self.sender.send(msg) {
            warn!(conn = self.id, "Failed to send to {}: {e}", self.name);
        }
    }
}
