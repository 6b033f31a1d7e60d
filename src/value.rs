use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

use crate::node::DataObjectHandle;

/// The property tree attached to every manifest node and every payload
/// flowing between components.
///
/// Manifest authors can attach any JSON shape; `Node` only appears after
/// expression resolution, when a `{dataObjectKey}` token is replaced by the
/// live DataObject instance.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PropertyValue {
    String(String),
    Number(Number),
    Boolean(bool),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
    Node(NodeRef),
    #[default]
    Null,
}

/// A reference to a materialised DataObject inside a property tree.
///
/// Serialises as the `{keyName}` placeholder, which is what the server gets
/// to see when such a payload is sent back out.
#[derive(Clone)]
pub struct NodeRef {
    key_name: String,
    handle: DataObjectHandle,
}

impl NodeRef {
    pub fn new(key_name: impl Into<String>, handle: DataObjectHandle) -> Self {
        Self { key_name: key_name.into(), handle }
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn handle(&self) -> &DataObjectHandle {
        &self.handle
    }

    pub fn placeholder(&self) -> String {
        format!("{{{}}}", self.key_name)
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.key_name).finish()
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.key_name == other.key_name && self.handle.same_instance(&other.handle)
    }
}

impl PropertyValue {
    pub fn empty_map() -> Self {
        PropertyValue::Map(BTreeMap::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        if let PropertyValue::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        if let PropertyValue::Number(n) = self {
            n.as_f64()
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let PropertyValue::Boolean(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_list(&self) -> Option<&Vec<PropertyValue>> {
        if let PropertyValue::List(l) = self {
            Some(l)
        } else {
            None
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, PropertyValue>> {
        if let PropertyValue::Map(m) = self {
            Some(m)
        } else {
            None
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, PropertyValue>> {
        if let PropertyValue::Map(m) = self {
            Some(m)
        } else {
            None
        }
    }

    pub fn as_node(&self) -> Option<&NodeRef> {
        if let PropertyValue::Node(n) = self {
            Some(n)
        } else {
            None
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// Field lookup on a map value.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Insert into a map value, turning `Null` into an empty map first.
    /// Returns `false` if `self` is some other scalar or a list.
    pub fn insert(&mut self, key: impl Into<String>, value: PropertyValue) -> bool {
        if self.is_null() {
            *self = PropertyValue::empty_map();
        }
        match self.as_map_mut() {
            Some(map) => {
                map.insert(key.into(), value);
                true
            }
            None => false,
        }
    }

    /// Text used when a value is spliced into a surrounding string.
    pub fn display_string(&self) -> String {
        match self {
            PropertyValue::String(s) => s.clone(),
            PropertyValue::Number(n) => n.to_string(),
            PropertyValue::Boolean(b) => b.to_string(),
            PropertyValue::Null => String::new(),
            PropertyValue::Node(n) => n.placeholder(),
            other => other.to_json().to_string(),
        }
    }

    /// Plain JSON view. DataObject references collapse to their `{keyName}`
    /// placeholder.
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::String(s) => Value::String(s.clone()),
            PropertyValue::Number(n) => Value::Number(n.clone()),
            PropertyValue::Boolean(b) => Value::Bool(*b),
            PropertyValue::List(l) => Value::Array(l.iter().map(|v| v.to_json()).collect()),
            PropertyValue::Map(m) => Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
            PropertyValue::Node(n) => Value::String(n.placeholder()),
            PropertyValue::Null => Value::Null,
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => PropertyValue::String(s),
            Value::Number(n) => PropertyValue::Number(n),
            Value::Bool(b) => PropertyValue::Boolean(b),
            Value::Array(a) => PropertyValue::List(a.into_iter().map(PropertyValue::from).collect()),
            Value::Object(o) => PropertyValue::Map(
                o.into_iter()
                    .map(|(k, v)| (k, PropertyValue::from(v)))
                    .collect(),
            ),
            Value::Null => PropertyValue::Null,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

impl Serialize for PropertyValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(PropertyValue::from)
    }
}
