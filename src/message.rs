use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::value::PropertyValue;

pub const SYNC_FEATURES: &str = "sync_proton_features";
pub const PERFORM_COMPONENT: &str = "perform_component";
pub const DATA_UPDATED: &str = "data_updated";

/// One named event exchanged with the server, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    name: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

impl ServerMessage {
    pub fn new(name: impl Into<String>, properties: Map<String, Value>) -> Self {
        Self { name: name.into(), properties }
    }

    /// Outbound `sync_proton_features` with the client's ready list.
    pub fn ready_list(ready: &BTreeMap<String, String>) -> Self {
        let list: Map<String, Value> = ready
            .iter()
            .map(|(feature, version)| (feature.clone(), Value::String(version.clone())))
            .collect();
        let mut properties = Map::new();
        properties.insert("proton_ready_list".to_string(), Value::Object(list));
        Self::new(SYNC_FEATURES, properties)
    }

    /// Inbound `sync_proton_features` carrying the server's decision.
    pub fn active_features<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list = features.into_iter().map(|f| Value::String(f.into())).collect();
        let mut properties = Map::new();
        properties.insert("active_features".to_string(), Value::Array(list));
        Self::new(SYNC_FEATURES, properties)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Decode the properties into one of the typed event shapes below.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        serde_json::from_value(Value::Object(self.properties.clone())).map_err(|e| MessageError::Malformed {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

/// `perform_component`, inbound from the server or sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformComponentEvent {
    #[serde(rename = "featurename")]
    pub feature_name: String,
    #[serde(rename = "component_keyname")]
    pub component_key: String,
    #[serde(rename = "payload_data", default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub sample_flow: bool,
}

impl PerformComponentEvent {
    /// Build an outbound event. Map payloads are sent field by field, any
    /// other payload shape is wrapped under `value`. DataObject references are
    /// rewritten to their `{keyName}` placeholder on the way.
    pub fn outbound(
        feature_name: impl Into<String>,
        component_key: impl Into<String>,
        payload: &PropertyValue,
        sample_flow: bool,
    ) -> Self {
        let payload = match payload.to_json() {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            feature_name: feature_name.into(),
            component_key: component_key.into(),
            payload,
            sample_flow,
        }
    }

    pub fn payload_value(&self) -> PropertyValue {
        PropertyValue::from(Value::Object(self.payload.clone()))
    }

    pub fn into_message(self) -> ServerMessage {
        let properties = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        ServerMessage::new(PERFORM_COMPONENT, properties)
    }
}

/// `data_updated`, inbound only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUpdatedEvent {
    #[serde(rename = "featurename")]
    pub feature_name: String,
    #[serde(rename = "keyname")]
    pub key_name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Inbound half of `sync_proton_features`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveFeaturesPush {
    #[serde(default)]
    pub active_features: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MessageError {
    #[error("malformed `{name}` message: {reason}")]
    Malformed { name: String, reason: String },
}
