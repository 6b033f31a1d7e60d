use std::collections::{BTreeMap, HashMap};
use std::fmt;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::feature::provider::{COMPONENT_PROVIDER, SERVER_DATA_PROVIDER};
use crate::value::PropertyValue;

/// Type that every `owner: "server"` component is rewritten to.
pub const SERVER_DELEGATE: &str = "ServerDelegateComponent";

const COMPONENT_CONFIGS: &str = "componentConfigs";
const DATA_OBJECT_CONFIGS: &str = "dataObjectConfigs";
const PROVIDER_CONFIGS: &str = "providerConfigs";

/// Fields shared by every manifest node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    pub key_name: String,
    #[serde(default)]
    pub type_name: String,
    /// Arbitrary property tree, `{...}` tokens allowed in string values.
    #[serde(default, rename = "props", skip_serializing_if = "PropertyValue::is_null")]
    #[schemars(with = "Option<Value>")]
    pub properties: PropertyValue,
    /// `"client"` (default) or `"server"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl NodeDefinition {
    pub fn is_server_owned(&self) -> bool {
        self.owner.as_deref() == Some("server")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinition {
    #[serde(flatten)]
    pub node: NodeDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_key: Option<String>,
    /// output port → component keys executed next, in order
    #[serde(default)]
    pub outputs: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub dev_panel_visible: bool,
}

impl ComponentDefinition {
    pub fn key_name(&self) -> &str {
        &self.node.key_name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataObjectDefinition {
    #[serde(flatten)]
    pub node: NodeDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_key: Option<String>,
}

impl DataObjectDefinition {
    pub fn key_name(&self) -> &str {
        &self.node.key_name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDefinition {
    #[serde(flatten)]
    pub node: NodeDefinition,
}

impl ProviderDefinition {
    pub fn key_name(&self) -> &str {
        &self.node.key_name
    }

    pub fn type_name(&self) -> &str {
        &self.node.type_name
    }
}

/// On-disk shape of a feature manifest. Only used for schema generation;
/// parsing goes node by node so one bad node does not sink the feature.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_configs: Option<Vec<ComponentDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_object_configs: Option<Vec<DataObjectDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_configs: Option<Vec<ProviderDefinition>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Component,
    DataObject,
    Provider,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Component => write!(f, "component"),
            NodeKind::DataObject => write!(f, "data object"),
            NodeKind::Provider => write!(f, "provider"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest for `{feature}` is not valid JSON: {source}")]
    Json {
        feature: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest for `{feature}` must be a JSON object")]
    NotAnObject { feature: String },
}

/// Something odd about a manifest that does not stop it from loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    DuplicateKey { kind: NodeKind, key: String },
    DanglingTarget { source: String, port: String, target: String },
    DanglingProvider { node: String, provider_key: String },
    RoutingCycle { components: Vec<String> },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::DuplicateKey { kind, key } => {
                write!(f, "duplicate {} key `{}`, the last definition wins", kind, key)
            }
            Diagnostic::DanglingTarget { source, port, target } => {
                write!(f, "`{}` routes port `{}` to unknown component `{}`", source, port, target)
            }
            Diagnostic::DanglingProvider { node, provider_key } => {
                write!(f, "`{}` names unknown provider `{}`", node, provider_key)
            }
            Diagnostic::RoutingCycle { components } => {
                write!(f, "routing cycle through {}", components.join(" -> "))
            }
        }
    }
}

/// Parsed, queryable manifest of one feature.
///
/// The three collections stay `None` when the manifest had no such array;
/// lookups treat that the same as an empty collection.
#[derive(Debug, Clone, Default)]
pub struct FeatureConfig {
    feature_name: String,
    components: Option<HashMap<String, ComponentDefinition>>,
    data_objects: Option<HashMap<String, DataObjectDefinition>>,
    providers: Option<HashMap<String, ProviderDefinition>>,
    provider_order: Vec<String>,
    duplicates: Vec<(NodeKind, String)>,
}

impl FeatureConfig {
    pub fn new(feature_name: impl Into<String>) -> Self {
        Self {
            feature_name: feature_name.into(),
            ..Self::default()
        }
    }

    pub fn parse(feature_name: &str, text: &str) -> Result<Self, ManifestError> {
        let root: Value = serde_json::from_str(text).map_err(|source| ManifestError::Json {
            feature: feature_name.to_string(),
            source,
        })?;
        Self::from_value(feature_name, root)
    }

    pub fn from_value(feature_name: &str, root: Value) -> Result<Self, ManifestError> {
        let Value::Object(mut root) = root else {
            return Err(ManifestError::NotAnObject {
                feature: feature_name.to_string(),
            });
        };

        let mut config = FeatureConfig::new(feature_name);

        if let Some(nodes) = node_array::<ComponentDefinition>(feature_name, COMPONENT_CONFIGS, root.remove(COMPONENT_CONFIGS)) {
            let mut map = HashMap::new();
            for mut def in nodes {
                if def.node.is_server_owned() {
                    delegate_to_server(feature_name, &mut def.node);
                }
                let key = def.key_name().to_string();
                if map.insert(key.clone(), def).is_some() {
                    config.note_duplicate(NodeKind::Component, key);
                }
            }
            config.components = Some(map);
        }

        if let Some(nodes) = node_array::<DataObjectDefinition>(feature_name, DATA_OBJECT_CONFIGS, root.remove(DATA_OBJECT_CONFIGS)) {
            let mut map = HashMap::new();
            for def in nodes {
                let key = def.key_name().to_string();
                if map.insert(key.clone(), def).is_some() {
                    config.note_duplicate(NodeKind::DataObject, key);
                }
            }
            config.data_objects = Some(map);
        }

        if let Some(nodes) = node_array::<ProviderDefinition>(feature_name, PROVIDER_CONFIGS, root.remove(PROVIDER_CONFIGS)) {
            let mut map = HashMap::new();
            for def in nodes {
                let key = def.key_name().to_string();
                if map.insert(key.clone(), def).is_some() {
                    config.note_duplicate(NodeKind::Provider, key);
                } else {
                    config.provider_order.push(key);
                }
            }
            config.providers = Some(map);
        }

        debug!(
            feature = feature_name,
            components = config.components.as_ref().map_or(0, HashMap::len),
            data_objects = config.data_objects.as_ref().map_or(0, HashMap::len),
            providers = config.provider_order.len(),
            "manifest parsed"
        );
        Ok(config)
    }

    fn note_duplicate(&mut self, kind: NodeKind, key: String) {
        warn!(feature = %self.feature_name, %kind, %key, "duplicate key in manifest, keeping the last definition");
        self.duplicates.push((kind, key));
    }

    pub fn feature_name(&self) -> &str {
        &self.feature_name
    }

    pub fn get_component_config_for_key(&self, key: &str) -> Option<&ComponentDefinition> {
        self.components.as_ref()?.get(key)
    }

    pub fn get_data_object_config_for_key(&self, key: &str) -> Option<&DataObjectDefinition> {
        self.data_objects.as_ref()?.get(key)
    }

    /// Targets routed from `port` of component `source`.
    pub fn get_outputs_for_component(&self, source: &str, port: &str) -> Option<&[String]> {
        self.get_component_config_for_key(source)?
            .outputs
            .get(port)
            .map(Vec::as_slice)
    }

    pub fn provider(&self, key: &str) -> Option<&ProviderDefinition> {
        self.providers.as_ref()?.get(key)
    }

    /// First `ComponentProvider` in manifest order.
    pub fn get_component_provider(&self) -> Option<&ProviderDefinition> {
        self.first_provider_of_type(COMPONENT_PROVIDER)
    }

    /// First `ServerDataProvider` in manifest order.
    pub fn get_server_data_provider(&self) -> Option<&ProviderDefinition> {
        self.first_provider_of_type(SERVER_DATA_PROVIDER)
    }

    fn first_provider_of_type(&self, type_name: &str) -> Option<&ProviderDefinition> {
        self.provider_order
            .iter()
            .filter_map(|key| self.provider(key))
            .find(|p| p.type_name() == type_name)
    }

    /// Provider for a component: its declared `providerKey`, else the first
    /// component provider.
    pub fn provider_for_component(&self, def: &ComponentDefinition) -> Option<&ProviderDefinition> {
        self.declared_provider(def.key_name(), def.provider_key.as_deref())
            .or_else(|| self.get_component_provider())
    }

    /// Provider for a DataObject: its declared `providerKey`, else the first
    /// server data provider.
    pub fn provider_for_data_object(&self, def: &DataObjectDefinition) -> Option<&ProviderDefinition> {
        self.declared_provider(def.key_name(), def.provider_key.as_deref())
            .or_else(|| self.get_server_data_provider())
    }

    fn declared_provider(&self, node: &str, provider_key: Option<&str>) -> Option<&ProviderDefinition> {
        let key = provider_key?;
        let found = self.provider(key);
        if found.is_none() {
            debug!(feature = %self.feature_name, node, provider_key = key, "declared provider not found, falling back to first match");
        }
        found
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentDefinition> {
        self.components.iter().flat_map(|m| m.values())
    }

    pub fn data_objects(&self) -> impl Iterator<Item = &DataObjectDefinition> {
        self.data_objects.iter().flat_map(|m| m.values())
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderDefinition> {
        self.provider_order.iter().filter_map(|key| self.provider(key))
    }

    pub fn has_components(&self) -> bool {
        self.components.is_some()
    }

    /// Everything suspicious about this manifest, sorted for stable output.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut out: Vec<Diagnostic> = self
            .duplicates
            .iter()
            .map(|(kind, key)| Diagnostic::DuplicateKey { kind: *kind, key: key.clone() })
            .collect();

        let mut dangling = Vec::new();
        for def in self.components() {
            for (port, targets) in &def.outputs {
                for target in targets {
                    if self.get_component_config_for_key(target).is_none() {
                        dangling.push(Diagnostic::DanglingTarget {
                            source: def.key_name().to_string(),
                            port: port.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
            if let Some(key) = &def.provider_key {
                if self.provider(key).is_none() {
                    dangling.push(Diagnostic::DanglingProvider {
                        node: def.key_name().to_string(),
                        provider_key: key.clone(),
                    });
                }
            }
        }
        for def in self.data_objects() {
            if let Some(key) = &def.provider_key {
                if self.provider(key).is_none() {
                    dangling.push(Diagnostic::DanglingProvider {
                        node: def.key_name().to_string(),
                        provider_key: key.clone(),
                    });
                }
            }
        }
        dangling.sort_by_key(|d| d.to_string());
        out.extend(dangling);
        out.extend(self.routing_cycles());
        out
    }

    fn routing_cycles(&self) -> Vec<Diagnostic> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
        let mut keys: Vec<&str> = self.components().map(|c| c.key_name()).collect();
        keys.sort_unstable();
        for key in keys {
            index_of.insert(key, graph.add_node(key.to_string()));
        }
        for def in self.components() {
            let Some(&from) = index_of.get(def.key_name()) else {
                continue;
            };
            for target in def.outputs.values().flatten() {
                if let Some(&to) = index_of.get(target.as_str()) {
                    graph.update_edge(from, to, ());
                }
            }
        }

        if !petgraph::algo::is_cyclic_directed(&graph) {
            return Vec::new();
        }

        let mut cycles: Vec<Diagnostic> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                let mut components: Vec<String> = scc.iter().map(|ix| graph[*ix].clone()).collect();
                components.sort();
                Diagnostic::RoutingCycle { components }
            })
            .collect();
        cycles.sort_by_key(|d| d.to_string());
        cycles
    }
}

/// Decode one node array. A missing or non-array value yields `None`;
/// individual nodes that fail to decode are logged and skipped.
fn node_array<T: DeserializeOwned>(feature: &str, field: &str, value: Option<Value>) -> Option<Vec<T>> {
    let entries = match value? {
        Value::Array(entries) => entries,
        Value::Null => return None,
        other => {
            warn!(feature, field, found = %other, "manifest field is not an array, ignoring it");
            return None;
        }
    };

    let mut nodes = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<T>(entry) {
            Ok(node) => nodes.push(node),
            Err(e) => warn!(feature, field, index, error = %e, "skipping malformed manifest node"),
        }
    }
    Some(nodes)
}

/// `owner: "server"` components run on the server: the client only needs a
/// delegate that knows which feature it belongs to.
fn delegate_to_server(feature: &str, node: &mut NodeDefinition) {
    node.type_name = SERVER_DELEGATE.to_string();
    let feature_name = PropertyValue::from(feature);
    if !node.properties.insert("featureName", feature_name.clone()) {
        warn!(feature, key = %node.key_name, "server component props are not a map, replacing them");
        node.properties = PropertyValue::empty_map();
        node.properties.insert("featureName", feature_name);
    }
}
