//! Node types and providers that ship with the engine.
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::feature::config::SERVER_DELEGATE;
use crate::feature::provider::{ComponentProvider, ServerDataProvider};
use crate::link::ServerLink;
use crate::message::PerformComponentEvent;
use crate::node::{Component, DataObject, NodeError, NodeSeed, Outputs, RuntimeNode};
use crate::registry::TypeCatalogue;
use crate::value::PropertyValue;

pub const RELAY_COMPONENT: &str = "RelayComponent";
pub const VALUE_DATA_OBJECT: &str = "ValueDataObject";

const DEFAULT_PORT: &str = "next";

pub fn register_builtins(catalogue: TypeCatalogue) -> TypeCatalogue {
    catalogue
        .with_node(SERVER_DELEGATE, |seed| {
            Some(RuntimeNode::Component(Box::new(ServerDelegateComponent::new(seed))))
        })
        .with_node(RELAY_COMPONENT, |seed| {
            Some(RuntimeNode::Component(Box::new(RelayComponent::new(seed))))
        })
        .with_node(VALUE_DATA_OBJECT, |seed| {
            Some(RuntimeNode::DataObject(Box::new(ValueDataObject::new(seed))))
        })
        .with_provider(Arc::new(ComponentProvider))
        .with_provider(Arc::new(ServerDataProvider))
}

/// Stand-in for a step the server executes: forwards the payload as an
/// outbound `perform_component` event and emits nothing locally.
#[derive(Debug)]
pub struct ServerDelegateComponent {
    key_name: String,
    feature_name: String,
    properties: PropertyValue,
    link: Option<Arc<dyn ServerLink>>,
}

impl ServerDelegateComponent {
    pub fn new(seed: NodeSeed) -> Self {
        let feature_name = seed
            .properties
            .get("featureName")
            .and_then(PropertyValue::as_str)
            .map(str::to_string)
            .unwrap_or(seed.feature_name);
        Self {
            key_name: seed.key_name,
            feature_name,
            properties: seed.properties,
            link: seed.link,
        }
    }
}

impl Component for ServerDelegateComponent {
    fn key_name(&self) -> &str {
        &self.key_name
    }

    fn feature_name(&self) -> &str {
        &self.feature_name
    }

    fn properties(&self) -> &PropertyValue {
        &self.properties
    }

    fn perform(&mut self, payload: &PropertyValue, should_log: bool) -> Result<Outputs, NodeError> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| NodeError::ConnectionFailed("no server link configured".to_string()))?;
        let event = PerformComponentEvent::outbound(&self.feature_name, &self.key_name, payload, should_log);
        link.send(event.into_message())
            .map_err(|e| NodeError::ConnectionFailed(e.to_string()))?;
        if should_log {
            info!(feature = %self.feature_name, key = %self.key_name, "delegated step to server");
        }
        Ok(Vec::new())
    }
}

/// Emits either its resolved `output` property or the incoming payload on
/// every port listed in `ports` (`port` for a single one, default `next`).
#[derive(Debug)]
pub struct RelayComponent {
    key_name: String,
    feature_name: String,
    properties: PropertyValue,
    ports: Vec<String>,
}

impl RelayComponent {
    pub fn new(seed: NodeSeed) -> Self {
        let mut ports: Vec<String> = match seed.properties.get("ports") {
            Some(PropertyValue::List(list)) => list
                .iter()
                .filter_map(PropertyValue::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        if let Some(port) = seed.properties.get("port").and_then(PropertyValue::as_str) {
            ports.push(port.to_string());
        }
        if ports.is_empty() {
            ports.push(DEFAULT_PORT.to_string());
        }
        Self {
            key_name: seed.key_name,
            feature_name: seed.feature_name,
            properties: seed.properties,
            ports,
        }
    }
}

impl Component for RelayComponent {
    fn key_name(&self) -> &str {
        &self.key_name
    }

    fn feature_name(&self) -> &str {
        &self.feature_name
    }

    fn properties(&self) -> &PropertyValue {
        &self.properties
    }

    fn perform(&mut self, payload: &PropertyValue, should_log: bool) -> Result<Outputs, NodeError> {
        let value = self.properties.get("output").unwrap_or(payload);
        if should_log {
            debug!(key = %self.key_name, ports = ?self.ports, "relaying");
        }
        Ok(self.ports.iter().map(|port| (port.clone(), value.clone())).collect())
    }
}

/// JSON value holder. Initialised from its `value` property, then updated
/// by `data_updated` pushes; object updates merge field by field.
#[derive(Debug)]
pub struct ValueDataObject {
    key_name: String,
    value: Value,
}

impl ValueDataObject {
    pub fn new(seed: NodeSeed) -> Self {
        let value = seed
            .properties
            .get("value")
            .map(PropertyValue::to_json)
            .unwrap_or_else(|| Value::Object(Map::new()));
        Self {
            key_name: seed.key_name,
            value,
        }
    }
}

impl DataObject for ValueDataObject {
    fn key_name(&self) -> &str {
        &self.key_name
    }

    fn update_value(&mut self, value: Value) {
        match (&mut self.value, value) {
            (Value::Object(current), Value::Object(update)) => {
                for (field, v) in update {
                    current.insert(field, v);
                }
            }
            (current, other) => *current = other,
        }
    }

    fn try_replace_string(&self, field: &str) -> Option<String> {
        match self.value.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => Some(String::new()),
            other => Some(other.to_string()),
        }
    }

    fn value(&self) -> PropertyValue {
        PropertyValue::from(self.value.clone())
    }
}
