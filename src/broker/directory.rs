//! Topic directory
//!
//! The authoritative name -> topic map. Ids come from a monotonic counter
//! starting at 1 and are never reused, even after a topic is deleted.
//! Every mutating operation checks ownership by connection id; the host
//! process uses `SERVER_PUBLISHER`. Callers turn the returned outcomes into
//! broadcasts; the directory itself never talks to the network.

use std::collections::{BTreeMap, HashMap};

use crate::broker::connection::{ConnectionId, PubUid};
use crate::broker::topic::{merge_properties, Topic, TopicValue};
use crate::transport::message::Properties;
use crate::transport::value::Value;
use crate::utils::error::{Nt4Error, Result};

#[derive(Debug, Clone)]
pub enum PublishOutcome {
    /// New topic; callers broadcast an announce.
    Created(Topic),
    /// Existing topic whose type/properties changed in place.
    Updated(Topic),
}

#[derive(Debug, Clone)]
pub enum Removal {
    /// Name no longer exists; callers broadcast an unannounce.
    Deleted(Topic),
    /// Retained topic kept alive without a publisher.
    Orphaned(Topic),
}

#[derive(Debug, Default)]
pub struct TopicDirectory {
    topics: HashMap<String, Topic>,
    ids: BTreeMap<i64, String>,
    last_id: i64,
}

impl TopicDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }

    pub fn get_by_id(&self, id: i64) -> Option<&Topic> {
        self.ids.get(&id).and_then(|name| self.topics.get(name))
    }

    /// Topics in id (creation) order.
    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.ids.values().filter_map(|name| self.topics.get(name))
    }

    fn allocate_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    pub fn publish(
        &mut self,
        name: &str,
        type_str: &str,
        pubuid: PubUid,
        properties: &Properties,
        owner: ConnectionId,
    ) -> PublishOutcome {
        if let Some(topic) = self.topics.get_mut(name) {
            topic.type_str = type_str.to_string();
            topic.merge_properties(properties);
            if topic.publisher.is_none() {
                topic.publisher = Some(owner);
                topic.pubuid = Some(pubuid);
            }
            return PublishOutcome::Updated(topic.clone());
        }

        let id = self.allocate_id();
        let mut initial = Properties::new();
        merge_properties(&mut initial, properties);
        let mut topic = Topic::new(name, id, type_str, initial);
        topic.publisher = Some(owner);
        topic.pubuid = Some(pubuid);

        self.ids.insert(id, name.to_string());
        self.topics.insert(name.to_string(), topic.clone());
        PublishOutcome::Created(topic)
    }

    /// Inserts an ownerless topic, e.g. one loaded from persistent storage.
    pub fn restore(
        &mut self,
        name: &str,
        type_str: &str,
        properties: Properties,
        value: Option<TopicValue>,
    ) -> Option<Topic> {
        if self.topics.contains_key(name) {
            return None;
        }
        let id = self.allocate_id();
        let mut topic = Topic::new(name, id, type_str, properties);
        topic.value = value;
        self.ids.insert(id, name.to_string());
        self.topics.insert(name.to_string(), topic.clone());
        Some(topic)
    }

    fn owned_mut(&mut self, name: &str, requester: ConnectionId) -> Result<&mut Topic> {
        let topic = self
            .topics
            .get_mut(name)
            .ok_or_else(|| Nt4Error::NotFound(format!("topic '{name}'")))?;
        if !topic.is_owned_by(requester) {
            return Err(Nt4Error::Ownership {
                name: name.to_string(),
                requester,
            });
        }
        Ok(topic)
    }

    /// Releases `name`. `pubuid` must also match for connection-owned
    /// topics, since one connection may publish a name under several pubuids.
    pub fn unpublish(
        &mut self,
        name: &str,
        pubuid: Option<PubUid>,
        requester: ConnectionId,
    ) -> Result<Removal> {
        let topic = self.owned_mut(name, requester)?;
        if pubuid.is_some() && topic.pubuid != pubuid {
            return Err(Nt4Error::Ownership {
                name: name.to_string(),
                requester,
            });
        }
        self.release(name)
            .ok_or_else(|| Nt4Error::NotFound(format!("topic '{name}'")))
    }

    pub fn set_value(
        &mut self,
        name: &str,
        value: Value,
        timestamp: i64,
        requester: ConnectionId,
    ) -> Result<TopicValue> {
        let topic = self.owned_mut(name, requester)?;
        let update = TopicValue { value, timestamp };
        if topic.is_cached() {
            topic.value = Some(update.clone());
        }
        Ok(update)
    }

    pub fn set_properties(
        &mut self,
        name: &str,
        update: &Properties,
        requester: ConnectionId,
    ) -> Result<Topic> {
        let topic = self.owned_mut(name, requester)?;
        topic.merge_properties(update);
        if !topic.is_cached() {
            topic.value = None;
        }
        Ok(topic.clone())
    }

    /// Releases every topic owned by `conn`.
    pub fn remove_by_connection(&mut self, conn: ConnectionId) -> Vec<Removal> {
        let owned: Vec<String> = self
            .iter()
            .filter(|t| t.is_owned_by(conn))
            .map(|t| t.name.clone())
            .collect();
        owned
            .into_iter()
            .filter_map(|name| self.release(&name))
            .collect()
    }

    fn release(&mut self, name: &str) -> Option<Removal> {
        let topic = self.topics.get_mut(name)?;
        if topic.is_retained() {
            topic.publisher = None;
            topic.pubuid = None;
            return Some(Removal::Orphaned(topic.clone()));
        }
        let topic = self.topics.remove(name)?;
        self.ids.remove(&topic.id);
        Some(Removal::Deleted(topic))
    }
}
