//! Topic records held by the directory.
//!
//! A `Topic` carries its server-assigned id, the declared type string, its
//! property map, the latest value (if any) and the connection that owns
//! write access. `publisher == None` marks a retained topic whose owner is
//! gone; the next publish of that name claims it.

use crate::broker::connection::{ConnectionId, PubUid};
use crate::transport::message::Properties;
use crate::transport::value::Value;

/// Publisher sentinel for topics owned by the host process.
pub const SERVER_PUBLISHER: ConnectionId = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct TopicValue {
    pub value: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct Topic {
    pub name: String,
    pub id: i64,
    pub type_str: String,
    pub properties: Properties,
    pub value: Option<TopicValue>,
    pub publisher: Option<ConnectionId>,
    pub pubuid: Option<PubUid>,
}

impl Topic {
    pub fn new(name: &str, id: i64, type_str: &str, properties: Properties) -> Self {
        Self {
            name: name.to_string(),
            id,
            type_str: type_str.to_string(),
            properties,
            value: None,
            publisher: None,
            pubuid: None,
        }
    }

    pub fn is_owned_by(&self, conn: ConnectionId) -> bool {
        self.publisher == Some(conn)
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.properties.get(key).and_then(|v| v.as_bool())
    }

    pub fn is_persistent(&self) -> bool {
        self.flag("persistent").unwrap_or(false)
    }

    /// Persistent topics are implicitly retained.
    pub fn is_retained(&self) -> bool {
        self.flag("retained").unwrap_or(false) || self.is_persistent()
    }

    /// `cached: false` topics forward values without storing them.
    pub fn is_cached(&self) -> bool {
        self.flag("cached").unwrap_or(true)
    }

    /// Shallow-merges `update` into the properties; `null` removes a key.
    pub fn merge_properties(&mut self, update: &Properties) {
        merge_properties(&mut self.properties, update);
    }
}

pub fn merge_properties(target: &mut Properties, update: &Properties) {
    for (key, value) in update {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}
