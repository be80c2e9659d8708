//! Persistence layer backed by `sled`
//!
//! One JSON record per topic name in a dedicated tree. The value is kept in
//! its wire form (an encoded value frame) so the record carries its type id.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::warn;

use crate::broker::topic::{Topic, TopicValue};
use crate::transport::frame::{decode_value_frame, ValueFrame};
use crate::transport::message::Properties;
use crate::utils::error::{Nt4Error, Result};

const TOPICS_TREE: &str = "persistent_topics";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredTopic {
    pub name: String,
    #[serde(rename = "type")]
    pub type_str: String,
    pub properties: Properties,
    /// Encoded `[0, timestamp, type, value]` frame, if the topic had a value.
    pub value: Option<Vec<u8>>,
}

impl StoredTopic {
    pub fn from_topic(topic: &Topic) -> Result<Self> {
        let value = match &topic.value {
            Some(v) => Some(ValueFrame::new(0, v.timestamp, v.value.clone()).encode()?),
            None => None,
        };
        Ok(Self {
            name: topic.name.clone(),
            type_str: topic.type_str.clone(),
            properties: topic.properties.clone(),
            value,
        })
    }

    pub fn topic_value(&self) -> Option<TopicValue> {
        let bytes = self.value.as_ref()?;
        match decode_value_frame(bytes) {
            Ok(frame) => Some(TopicValue {
                value: frame.value,
                timestamp: frame.timestamp,
            }),
            Err(e) => {
                warn!(topic = %self.name, "Discarding unreadable stored value: {e}");
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
    topics: Tree,
}

impl Persistence {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        let topics = db.open_tree(TOPICS_TREE)?;
        Ok(Self { db, topics })
    }

    pub fn store_topic(&self, topic: &Topic) -> Result<()> {
        let record = StoredTopic::from_topic(topic)?;
        let serialized =
            serde_json::to_vec(&record).map_err(|e| Nt4Error::Serialization(e.to_string()))?;
        self.topics.insert(topic.name.as_bytes(), serialized)?;
        Ok(())
    }

    pub fn remove_topic(&self, name: &str) -> Result<()> {
        self.topics.remove(name.as_bytes())?;
        Ok(())
    }

    pub fn load_topic(&self, name: &str) -> Result<Option<StoredTopic>> {
        match self.topics.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All stored topics in name order. Unreadable records are skipped.
    pub fn load_all(&self) -> Vec<StoredTopic> {
        self.topics
            .iter()
            .filter_map(|res| match res {
                Ok((_, val)) => Some(val),
                Err(e) => {
                    warn!("Failed to read persistent topic record: {e}");
                    None
                }
            })
            .filter_map(|val| match serde_json::from_slice::<StoredTopic>(&val) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping malformed persistent topic record: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .field("topics", &self.topics.len())
            .finish()
    }
}
