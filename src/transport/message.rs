//! JSON control messages
//!
//! Every text frame carries a JSON array of `{"method": ..., "params": {...}}`
//! objects. `ClientMessage` covers the client -> server vocabulary and
//! `ServerMessage` the server -> client one.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::broker::connection::{PubUid, SubUid};
use crate::utils::error::{Nt4Error, Result};

/// Open-ended topic property map. A `null` value in an update removes the key.
pub type Properties = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum ClientMessage {
    Publish {
        name: String,
        #[serde(rename = "type")]
        type_str: String,
        pubuid: PubUid,
        #[serde(default)]
        properties: Properties,
    },
    Unpublish {
        pubuid: PubUid,
    },
    Subscribe {
        subuid: SubUid,
        topics: Vec<String>,
        #[serde(default)]
        options: SubscribeOptions,
    },
    Unsubscribe {
        subuid: SubUid,
    },
    SetProperties {
        name: String,
        update: Properties,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum ServerMessage {
    Announce {
        name: String,
        id: i64,
        #[serde(rename = "type")]
        type_str: String,
        #[serde(default)]
        properties: Properties,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pubuid: Option<PubUid>,
    },
    Unannounce {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
    },
    Properties {
        name: String,
        #[serde(alias = "update")]
        properties: Properties,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeOptions {
    #[serde(rename = "prefixMatch", alias = "prefix")]
    pub prefix_match: bool,
    /// Announcements only; value frames are never delivered.
    #[serde(rename = "topicsonly", skip_serializing_if = "std::ops::Not::not")]
    pub topics_only: bool,
    /// Requested update period in seconds. Accepted, not enforced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periodic: Option<f64>,
}

impl SubscribeOptions {
    pub fn prefix() -> Self {
        Self {
            prefix_match: true,
            ..Self::default()
        }
    }
}

/// Serializes a batch of control messages. The payload is always a JSON
/// array, even for a single message.
pub fn encode_control_messages<M: Serialize>(messages: &[M]) -> Result<String> {
    serde_json::to_string(messages).map_err(|e| Nt4Error::Serialization(e.to_string()))
}

/// Parses a text frame. A non-array payload fails the whole frame; an element
/// that is not a well-formed message is logged and skipped.
pub fn decode_control_messages<M: DeserializeOwned>(text: &str) -> Result<Vec<M>> {
    let parsed: serde_json::Value = serde_json::from_str(text)?;
    let serde_json::Value::Array(elements) = parsed else {
        return Err(Nt4Error::Decode(
            "control payload is not a JSON array".to_string(),
        ));
    };

    let mut messages = Vec::with_capacity(elements.len());
    for element in elements {
        let method = element
            .get("method")
            .and_then(|m| m.as_str())
            .map(str::to_string);
        let Some(method) = method else {
            warn!("Skipping control message without a method: {element}");
            continue;
        };
        match serde_json::from_value::<M>(element) {
            Ok(msg) => messages.push(msg),
            Err(e) => warn!(method = %method, "Skipping malformed control message: {e}"),
        }
    }
    Ok(messages)
}
