//! Server protocol engine
//!
//! `Server` owns the topic directory and every connection's state, and turns
//! inbound control/value messages into directory mutations and fan-out.
//!
//! Concurrency and usage notes:
//! - The API is synchronous and meant to sit behind a lock
//!   (`SharedServer = Arc<Mutex<Server>>`). Each inbound message is handled
//!   to completion under that lock, so the directory is never mutated by two
//!   messages at once.
//! - Outbound traffic goes into per-connection unbounded channels while the
//!   lock is held. Every connection therefore observes directory events in
//!   the same relative order, and an announce always precedes the first value
//!   frame for that topic.
//! - Wire-level failures (malformed payloads, ownership violations, unknown
//!   ids) are logged and dropped; the connection stays open.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::connection::{
    Connection, ConnectionId, PubUid, Publication, SubUid, Subscription,
};
use crate::broker::directory::{PublishOutcome, Removal, TopicDirectory};
use crate::broker::topic::{SERVER_PUBLISHER, Topic};
use crate::persistence::Persistence;
use crate::transport::frame::{FrameReader, ValueFrame, now_micros};
use crate::transport::message::{
    ClientMessage, Properties, ServerMessage, SubscribeOptions, decode_control_messages,
};
use crate::transport::value::Value;
use crate::utils::error::{Nt4Error, Result};

pub type SharedServer = Arc<Mutex<Server>>;

/// Locks a shared server, recovering the guard if a handler panicked.
pub fn lock(server: &SharedServer) -> MutexGuard<'_, Server> {
    server.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Directory lifecycle notifications for code running next to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Announced {
        name: String,
        id: i64,
        type_str: String,
    },
    Unannounced {
        name: String,
        id: i64,
    },
    PropertiesChanged {
        name: String,
        update: Properties,
    },
    ValueChanged {
        name: String,
        value: Value,
        timestamp: i64,
    },
}

#[derive(Debug)]
pub struct Server {
    directory: TopicDirectory,
    connections: BTreeMap<ConnectionId, Connection>,
    last_connection_id: ConnectionId,
    persistence: Option<Persistence>,
    events: broadcast::Sender<ServerEvent>,
}

impl Server {
    /// Buffered notifications per `events()` receiver before it lags.
    pub const EVENT_CAPACITY: usize = 1024;
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Self {
            directory: TopicDirectory::new(),
            connections: BTreeMap::new(),
            last_connection_id: SERVER_PUBLISHER,
            persistence: None,
            events,
        }
    }

    /// Creates a server that stores persistent topics in `persistence` and
    /// restores the ones already stored there as ownerless topics.
    pub fn new_with_persistence(persistence: Persistence) -> Self {
        let mut server = Self::new();
        for record in persistence.load_all() {
            let value = record.topic_value();
            if let Some(topic) =
                server
                    .directory
                    .restore(&record.name, &record.type_str, record.properties, value)
            {
                info!(topic = %topic.name, id = topic.id, "Restored persistent topic");
            }
        }
        server.persistence = Some(persistence);
        server
    }

    /// Writes pending persistent-topic changes to disk. No-op without
    /// persistence.
    pub fn flush(&self) -> Result<()> {
        match &self.persistence {
            Some(p) => p.flush(),
            None => Ok(()),
        }
    }

    pub fn into_shared(self) -> SharedServer {
        Arc::new(Mutex::new(self))
    }

    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn directory(&self) -> &TopicDirectory {
        &self.directory
    }

    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.directory.get(name)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn emit(&self, event: ServerEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    // ----- connection lifecycle -------------------------------------------

    /// Registers a new peer and queues its initial directory snapshot: an
    /// announce for every topic, each followed by its current value.
    pub fn register_connection(
        &mut self,
        name: &str,
        address: &str,
        sender: UnboundedSender<WsMessage>,
    ) -> ConnectionId {
        self.last_connection_id += 1;
        let id = self.last_connection_id;
        let conn = Connection::new(id, name, address, sender);

        for topic in self.directory.iter() {
            conn.send_control(announce(topic, None));
            if let Some(v) = &topic.value {
                conn.send_frame(&ValueFrame::new(topic.id, v.timestamp, v.value.clone()));
            }
        }

        info!(conn = id, client = %name, %address, topics = self.directory.len(), "Client connected");
        self.connections.insert(id, conn);
        id
    }

    /// Drops a peer and releases every topic it published.
    pub fn remove_connection(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };
        let removals = self.directory.remove_by_connection(id);
        info!(conn = id, client = %conn.name, released = removals.len(), "Client disconnected");
        for removal in removals {
            self.apply_removal(removal);
        }
    }

    // ----- inbound dispatch -----------------------------------------------

    pub fn handle_text(&mut self, conn: ConnectionId, text: &str) {
        match decode_control_messages::<ClientMessage>(text) {
            Ok(messages) => {
                for message in messages {
                    self.handle_control(conn, message);
                }
            }
            Err(e) => warn!(
                conn,
                "Invalid control frame: {e} | {}",
                text.chars().take(100).collect::<String>()
            ),
        }
    }

    pub fn handle_binary(&mut self, conn: ConnectionId, bytes: &[u8]) {
        for res in FrameReader::new(bytes) {
            match res {
                Ok((frame, raw)) => self.handle_value(conn, frame, raw),
                Err(e) => warn!(conn, "Invalid value frame: {e}"),
            }
        }
    }

    pub fn handle_control(&mut self, conn: ConnectionId, message: ClientMessage) {
        if !self.connections.contains_key(&conn) {
            warn!(conn, "Control message from unknown connection");
            return;
        }
        match message {
            ClientMessage::Publish {
                name,
                type_str,
                pubuid,
                properties,
            } => self.handle_publish(conn, name, type_str, pubuid, properties),
            ClientMessage::Unpublish { pubuid } => self.handle_unpublish(conn, pubuid),
            ClientMessage::Subscribe {
                subuid,
                topics,
                options,
            } => self.handle_subscribe(conn, subuid, topics, options),
            ClientMessage::Unsubscribe { subuid } => self.handle_unsubscribe(conn, subuid),
            ClientMessage::SetProperties { name, update } => {
                if let Err(e) = self.apply_set_properties(&name, &update, conn) {
                    warn!(conn, topic = %name, "Dropped setproperties: {e}");
                }
            }
        }
    }

    fn handle_publish(
        &mut self,
        conn: ConnectionId,
        name: String,
        type_str: String,
        pubuid: PubUid,
        properties: Properties,
    ) {
        if name.is_empty() {
            warn!(conn, pubuid, "Dropped publish with an empty topic name");
            return;
        }
        if let Some(c) = self.connections.get_mut(&conn) {
            c.add_publication(Publication {
                pubuid,
                name: name.clone(),
                type_str: type_str.clone(),
                properties: properties.clone(),
            });
        }
        self.apply_publish(&name, &type_str, pubuid, &properties, conn);
    }

    fn handle_unpublish(&mut self, conn: ConnectionId, pubuid: PubUid) {
        let publication = self
            .connections
            .get_mut(&conn)
            .and_then(|c| c.remove_publication(pubuid));
        let Some(publication) = publication else {
            warn!(conn, pubuid, "Unpublish for unknown pubuid");
            return;
        };
        match self.directory.unpublish(&publication.name, Some(pubuid), conn) {
            Ok(removal) => self.apply_removal(removal),
            Err(e) => warn!(conn, pubuid, "Dropped unpublish: {e}"),
        }
    }

    fn handle_subscribe(
        &mut self,
        conn: ConnectionId,
        subuid: SubUid,
        patterns: Vec<String>,
        options: SubscribeOptions,
    ) {
        let Some(c) = self.connections.get_mut(&conn) else {
            return;
        };
        let subscription = Subscription {
            subuid,
            patterns,
            options,
        };
        debug!(conn, subuid, patterns = ?subscription.patterns, "Subscribed");

        if !subscription.options.topics_only {
            for topic in self.directory.iter() {
                if let Some(v) = &topic.value {
                    if subscription.matches(&topic.name) {
                        c.send_frame(&ValueFrame::new(topic.id, v.timestamp, v.value.clone()));
                    }
                }
            }
        }
        c.add_subscription(subscription);
    }

    fn handle_unsubscribe(&mut self, conn: ConnectionId, subuid: SubUid) {
        let removed = self
            .connections
            .get_mut(&conn)
            .and_then(|c| c.remove_subscription(subuid));
        if removed.is_none() {
            warn!(conn, subuid, "Unsubscribe for unknown subuid");
        }
    }

    fn handle_value(&mut self, conn: ConnectionId, frame: ValueFrame, raw: &[u8]) {
        if frame.is_rtt() {
            if let Some(c) = self.connections.get(&conn) {
                c.send_frame(&ValueFrame {
                    timestamp: now_micros(),
                    ..frame
                });
            }
            return;
        }

        let Some(name) = self
            .directory
            .get_by_id(frame.topic_id)
            .map(|t| t.name.clone())
        else {
            warn!(conn, id = frame.topic_id, "Value frame for unknown topic id");
            return;
        };
        match self
            .directory
            .set_value(&name, frame.value, frame.timestamp, conn)
        {
            Ok(update) => {
                self.fan_out(&name, Some(conn), raw);
                self.sync_persistent(&name, false);
                self.emit(ServerEvent::ValueChanged {
                    name,
                    value: update.value,
                    timestamp: update.timestamp,
                });
            }
            Err(e) => warn!(conn, topic = %name, "Dropped value frame: {e}"),
        }
    }

    // ----- local API (publisher sentinel 0) -------------------------------

    /// Publishes a topic owned by the host process; returns its id.
    pub fn publish(&mut self, name: &str, type_str: &str, properties: Properties) -> Result<i64> {
        if name.is_empty() {
            return Err(Nt4Error::InvalidTopicName(name.to_string()));
        }
        Ok(self.apply_publish(name, type_str, 0, &properties, SERVER_PUBLISHER))
    }

    pub fn set_value(&mut self, name: &str, value: Value) -> Result<()> {
        let timestamp = now_micros();
        let update = self
            .directory
            .set_value(name, value, timestamp, SERVER_PUBLISHER)?;
        if let Some(id) = self.directory.get(name).map(|t| t.id) {
            let bytes = ValueFrame::new(id, timestamp, update.value.clone()).encode()?;
            self.fan_out(name, None, &bytes);
        }
        self.sync_persistent(name, false);
        self.emit(ServerEvent::ValueChanged {
            name: name.to_string(),
            value: update.value,
            timestamp,
        });
        Ok(())
    }

    pub fn set_properties(&mut self, name: &str, update: Properties) -> Result<()> {
        self.apply_set_properties(name, &update, SERVER_PUBLISHER)
    }

    pub fn unpublish(&mut self, name: &str) -> Result<()> {
        let removal = self.directory.unpublish(name, None, SERVER_PUBLISHER)?;
        self.apply_removal(removal);
        Ok(())
    }

    // ----- shared mutation + broadcast helpers ----------------------------

    fn apply_publish(
        &mut self,
        name: &str,
        type_str: &str,
        pubuid: PubUid,
        properties: &Properties,
        owner: ConnectionId,
    ) -> i64 {
        match self
            .directory
            .publish(name, type_str, pubuid, properties, owner)
        {
            PublishOutcome::Created(topic) => {
                info!(topic = %topic.name, id = topic.id, type_str = %topic.type_str, owner, "Topic announced");
                for c in self.connections.values() {
                    let echo = topic.is_owned_by(c.id).then_some(pubuid);
                    c.send_control(announce(&topic, echo));
                }
                self.sync_persistent(name, true);
                self.emit(ServerEvent::Announced {
                    name: topic.name,
                    id: topic.id,
                    type_str: topic.type_str,
                });
                topic.id
            }
            PublishOutcome::Updated(topic) => {
                debug!(topic = %topic.name, id = topic.id, owner, "Topic republished");
                self.broadcast_properties(name, properties);
                self.sync_persistent(name, true);
                topic.id
            }
        }
    }

    fn apply_set_properties(
        &mut self,
        name: &str,
        update: &Properties,
        requester: ConnectionId,
    ) -> Result<()> {
        self.directory.set_properties(name, update, requester)?;
        self.broadcast_properties(name, update);
        self.sync_persistent(name, true);
        Ok(())
    }

    fn broadcast_properties(&self, name: &str, update: &Properties) {
        for c in self.connections.values() {
            c.send_control(ServerMessage::Properties {
                name: name.to_string(),
                properties: update.clone(),
            });
        }
        self.emit(ServerEvent::PropertiesChanged {
            name: name.to_string(),
            update: update.clone(),
        });
    }

    fn apply_removal(&mut self, removal: Removal) {
        match removal {
            Removal::Deleted(topic) => {
                info!(topic = %topic.name, id = topic.id, "Topic unannounced");
                for c in self.connections.values() {
                    c.send_control(ServerMessage::Unannounce {
                        name: topic.name.clone(),
                        id: Some(topic.id),
                    });
                }
                if let Some(p) = &self.persistence {
                    if let Err(e) = p.remove_topic(&topic.name) {
                        warn!(topic = %topic.name, "Failed to remove persistent topic: {e}");
                    }
                }
                self.emit(ServerEvent::Unannounced {
                    name: topic.name,
                    id: topic.id,
                });
            }
            Removal::Orphaned(topic) => {
                debug!(topic = %topic.name, id = topic.id, "Retained topic lost its publisher");
            }
        }
    }

    /// Sends a value frame to every connection except `exclude` holding a
    /// value subscription that selects `name`.
    fn fan_out(&self, name: &str, exclude: Option<ConnectionId>, bytes: &[u8]) {
        for c in self.connections.values() {
            if Some(c.id) != exclude && c.wants_values(name) {
                c.send_bytes(bytes.to_vec());
            }
        }
    }

    /// Mirrors a topic into persistent storage. Property changes may also
    /// clear `persistent`, which drops the stored record.
    fn sync_persistent(&self, name: &str, properties_changed: bool) {
        let (Some(p), Some(topic)) = (&self.persistence, self.directory.get(name)) else {
            return;
        };
        let res = if topic.is_persistent() {
            p.store_topic(topic)
        } else if properties_changed {
            p.remove_topic(name)
        } else {
            Ok(())
        };
        if let Err(e) = res {
            warn!(topic = %name, "Failed to update persistent storage: {e}");
        }
    }
}

fn announce(topic: &Topic, pubuid: Option<PubUid>) -> ServerMessage {
    ServerMessage::Announce {
        name: topic.name.clone(),
        id: topic.id,
        type_str: topic.type_str.clone(),
        properties: topic.properties.clone(),
        pubuid,
    }
}
