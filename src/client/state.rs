//! Client protocol state
//!
//! `ClientState` is the single-connection mirror of the server: the
//! publications and subscriptions this client created, and the topic
//! directory as announced by the server. It performs no I/O; callers send
//! the messages and frames it returns.
//!
//! Outgoing value frames always carry the server-assigned topic id learned
//! from announces, never the local pubuid. A value set before that id is
//! known is held on the publication (latest wins) and released by the
//! announce.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::broker::connection::{PubUid, SubUid};
use crate::broker::topic::merge_properties;
use crate::transport::frame::ValueFrame;
use crate::transport::message::{ClientMessage, Properties, ServerMessage, SubscribeOptions};
use crate::transport::value::Value;
use crate::utils::error::{Nt4Error, Result};

/// Notifications raised while ingesting server traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Announced {
        name: String,
        id: i64,
        type_str: String,
        properties: Properties,
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

#[derive(Debug, Clone, PartialEq)]
pub struct TopicInfo {
    pub id: i64,
    pub type_str: String,
    pub properties: Properties,
    pub value: Option<Value>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub pubuid: PubUid,
    pub name: String,
    pub type_str: String,
    pub properties: Properties,
    /// Server id for `name`, once announced.
    pub topic_id: Option<i64>,
    pending: Option<(i64, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub subuid: SubUid,
    pub patterns: Vec<String>,
    pub options: SubscribeOptions,
}

#[derive(Debug, Default)]
pub struct ClientState {
    last_pubuid: PubUid,
    last_subuid: SubUid,
    publications: HashMap<PubUid, Publication>,
    subscriptions: HashMap<SubUid, Subscription>,
    topics: HashMap<String, TopicInfo>,
    names_by_id: HashMap<i64, String>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(&self, name: &str) -> Option<&TopicInfo> {
        self.topics.get(name)
    }

    pub fn topics(&self) -> &HashMap<String, TopicInfo> {
        &self.topics
    }

    pub fn publication(&self, pubuid: PubUid) -> Option<&Publication> {
        self.publications.get(&pubuid)
    }

    pub fn subscription(&self, subuid: SubUid) -> Option<&Subscription> {
        self.subscriptions.get(&subuid)
    }

    /// Forgets everything tied to the previous connection. Pubuid/subuid
    /// counters keep counting so stale handles never alias new ones.
    pub fn reset(&mut self) {
        self.publications.clear();
        self.subscriptions.clear();
        self.topics.clear();
        self.names_by_id.clear();
    }

    pub fn publish(
        &mut self,
        name: &str,
        type_str: &str,
        properties: Properties,
    ) -> (PubUid, ClientMessage) {
        self.last_pubuid += 1;
        let pubuid = self.last_pubuid;
        let publication = Publication {
            pubuid,
            name: name.to_string(),
            type_str: type_str.to_string(),
            properties: properties.clone(),
            topic_id: self.topics.get(name).map(|t| t.id),
            pending: None,
        };
        self.publications.insert(pubuid, publication);
        let message = ClientMessage::Publish {
            name: name.to_string(),
            type_str: type_str.to_string(),
            pubuid,
            properties,
        };
        (pubuid, message)
    }

    pub fn unpublish(&mut self, pubuid: PubUid) -> Result<ClientMessage> {
        self.publications
            .remove(&pubuid)
            .ok_or(Nt4Error::NotPublished(pubuid))?;
        Ok(ClientMessage::Unpublish { pubuid })
    }

    pub fn subscribe(
        &mut self,
        patterns: Vec<String>,
        options: SubscribeOptions,
    ) -> (SubUid, ClientMessage) {
        self.last_subuid += 1;
        let subuid = self.last_subuid;
        self.subscriptions.insert(
            subuid,
            Subscription {
                subuid,
                patterns: patterns.clone(),
                options: options.clone(),
            },
        );
        let message = ClientMessage::Subscribe {
            subuid,
            topics: patterns,
            options,
        };
        (subuid, message)
    }

    pub fn unsubscribe(&mut self, subuid: SubUid) -> Result<ClientMessage> {
        self.subscriptions
            .remove(&subuid)
            .ok_or_else(|| Nt4Error::NotFound(format!("subuid {subuid}")))?;
        Ok(ClientMessage::Unsubscribe { subuid })
    }

    pub fn set_properties(&mut self, name: &str, update: Properties) -> ClientMessage {
        ClientMessage::SetProperties {
            name: name.to_string(),
            update,
        }
    }

    /// Returns the frame to send, or `None` while the topic id is still
    /// unknown (the value then goes out with the announce).
    pub fn set_value(
        &mut self,
        pubuid: PubUid,
        value: Value,
        timestamp: i64,
    ) -> Result<Option<ValueFrame>> {
        let publication = self
            .publications
            .get_mut(&pubuid)
            .ok_or(Nt4Error::NotPublished(pubuid))?;

        // Mirror already knows the topic even if our own announce is pending.
        if publication.topic_id.is_none() {
            publication.topic_id = self.topics.get(&publication.name).map(|t| t.id);
        }
        match publication.topic_id {
            Some(id) => Ok(Some(ValueFrame::new(id, timestamp, value))),
            None => {
                debug!(pubuid, topic = %publication.name, "Holding value until announce");
                publication.pending = Some((timestamp, value));
                Ok(None)
            }
        }
    }

    /// Applies a server control message. Returns the notifications to raise
    /// and any held value frames the message released.
    pub fn handle_server_message(
        &mut self,
        message: ServerMessage,
    ) -> (Vec<ClientEvent>, Vec<ValueFrame>) {
        match message {
            ServerMessage::Announce {
                name,
                id,
                type_str,
                properties,
                pubuid,
            } => {
                let frames = self.bind_publications(&name, id, pubuid);
                if let Some(old) = self.topics.get(&name) {
                    if old.id != id {
                        self.names_by_id.remove(&old.id);
                    }
                }
                self.names_by_id.insert(id, name.clone());
                self.topics.insert(
                    name.clone(),
                    TopicInfo {
                        id,
                        type_str: type_str.clone(),
                        properties: properties.clone(),
                        value: None,
                        timestamp: None,
                    },
                );
                let event = ClientEvent::Announced {
                    name,
                    id,
                    type_str,
                    properties,
                };
                (vec![event], frames)
            }
            ServerMessage::Unannounce { name, id } => {
                let Some(topic) = self.topics.remove(&name) else {
                    warn!(topic = %name, "Unannounce for unknown topic");
                    return (Vec::new(), Vec::new());
                };
                self.names_by_id.remove(&topic.id);
                for publication in self.publications.values_mut() {
                    if publication.name == name {
                        publication.topic_id = None;
                    }
                }
                let event = ClientEvent::Unannounced {
                    name,
                    id: id.unwrap_or(topic.id),
                };
                (vec![event], Vec::new())
            }
            ServerMessage::Properties { name, properties } => {
                let Some(topic) = self.topics.get_mut(&name) else {
                    warn!(topic = %name, "Properties for unknown topic");
                    return (Vec::new(), Vec::new());
                };
                merge_properties(&mut topic.properties, &properties);
                let event = ClientEvent::PropertiesChanged {
                    name,
                    update: properties,
                };
                (vec![event], Vec::new())
            }
        }
    }

    /// Records the server id on matching publications and releases their
    /// held values. An announce echoing a pubuid binds exactly that
    /// publication; otherwise every unbound publication of `name` binds.
    fn bind_publications(&mut self, name: &str, id: i64, pubuid: Option<PubUid>) -> Vec<ValueFrame> {
        let mut frames = Vec::new();
        for publication in self.publications.values_mut() {
            let selected = match pubuid {
                Some(p) => publication.pubuid == p,
                None => publication.name == name && publication.topic_id.is_none(),
            };
            if !selected || publication.name != name {
                continue;
            }
            publication.topic_id = Some(id);
            if let Some((timestamp, value)) = publication.pending.take() {
                frames.push(ValueFrame::new(id, timestamp, value));
            }
        }
        frames
    }

    /// Applies an incoming value frame to the mirror.
    pub fn handle_value_frame(&mut self, frame: ValueFrame) -> Option<ClientEvent> {
        if frame.is_rtt() {
            return None;
        }
        let Some(name) = self.names_by_id.get(&frame.topic_id).cloned() else {
            warn!(id = frame.topic_id, "Value frame for unannounced topic id");
            return None;
        };
        let topic = self.topics.get_mut(&name)?;
        topic.value = Some(frame.value.clone());
        topic.timestamp = Some(frame.timestamp);
        Some(ClientEvent::ValueChanged {
            name,
            value: frame.value,
            timestamp: frame.timestamp,
        })
    }
}
