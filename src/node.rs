use std::fmt::{self, Debug};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::link::ServerLink;
use crate::value::PropertyValue;

/// Named outputs of one `perform` call: output port → payload for the
/// components routed from that port.
pub type Outputs = Vec<(String, PropertyValue)>;

/// A runtime step of a feature graph.
pub trait Component: Send + Sync + Debug {
    fn key_name(&self) -> &str;
    fn feature_name(&self) -> &str;
    /// The resolved property tree this instance was constructed with.
    fn properties(&self) -> &PropertyValue;
    fn perform(&mut self, payload: &PropertyValue, should_log: bool) -> Result<Outputs, NodeError>;
}

/// A live value holder referenced by expression tokens and updated by the
/// server.
pub trait DataObject: Send + Sync + Debug {
    fn key_name(&self) -> &str;
    fn update_value(&mut self, value: Value);
    /// Display string for one field, `None` when the field is unknown.
    fn try_replace_string(&self, field: &str) -> Option<String>;
    fn value(&self) -> PropertyValue;
}

/// What a node factory produces.
#[derive(Debug)]
pub enum RuntimeNode {
    Component(Box<dyn Component>),
    DataObject(Box<dyn DataObject>),
}

impl RuntimeNode {
    pub fn key_name(&self) -> &str {
        match self {
            RuntimeNode::Component(c) => c.key_name(),
            RuntimeNode::DataObject(d) => d.key_name(),
        }
    }

    pub fn into_component(self) -> Option<Box<dyn Component>> {
        match self {
            RuntimeNode::Component(c) => Some(c),
            RuntimeNode::DataObject(_) => None,
        }
    }

    pub fn into_data_object(self) -> Option<Box<dyn DataObject>> {
        match self {
            RuntimeNode::DataObject(d) => Some(d),
            RuntimeNode::Component(_) => None,
        }
    }
}

/// Shared handle to a materialised DataObject.
#[derive(Clone)]
pub struct DataObjectHandle(Arc<RwLock<Box<dyn DataObject>>>);

impl DataObjectHandle {
    pub fn new(data: Box<dyn DataObject>) -> Self {
        Self(Arc::new(RwLock::new(data)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<dyn DataObject>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<dyn DataObject>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn same_instance(&self, other: &DataObjectHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for DataObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(guard) => f.debug_tuple("DataObjectHandle").field(&*guard).finish(),
            Err(_) => f.write_str("DataObjectHandle(<locked>)"),
        }
    }
}

/// Everything a node factory gets to build one instance.
#[derive(Clone)]
pub struct NodeSeed {
    pub key_name: String,
    pub type_name: String,
    pub feature_name: String,
    /// Already expression-resolved properties.
    pub properties: PropertyValue,
    /// Outbound server transport, for node types that talk to the server.
    pub link: Option<Arc<dyn ServerLink>>,
}

impl NodeSeed {
    pub fn new(
        key_name: impl Into<String>,
        type_name: impl Into<String>,
        feature_name: impl Into<String>,
        properties: PropertyValue,
    ) -> Self {
        Self {
            key_name: key_name.into(),
            type_name: type_name.into(),
            feature_name: feature_name.into(),
            properties,
            link: None,
        }
    }

    pub fn with_link(mut self, link: Option<Arc<dyn ServerLink>>) -> Self {
        self.link = link;
        self
    }
}

impl Debug for NodeSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSeed")
            .field("key_name", &self.key_name)
            .field("type_name", &self.type_name)
            .field("feature_name", &self.feature_name)
            .field("properties", &self.properties)
            .field("link", &self.link.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Error, PartialEq)]
pub enum NodeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Processing error: {0}")]
    ExecutionFailed(String),
    #[error("Failed to reach the server: {0}")]
    ConnectionFailed(String),
}
