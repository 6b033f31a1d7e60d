use std::fmt::Debug;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::expression::{DataObjectSource, ExpressionParser};
use crate::feature::config::{NodeDefinition, ProviderDefinition};
use crate::link::ServerLink;
use crate::node::{NodeSeed, RuntimeNode};
use crate::registry::TypeRegistry;
use crate::value::PropertyValue;

pub const COMPONENT_PROVIDER: &str = "ComponentProvider";
pub const SERVER_DATA_PROVIDER: &str = "ServerDataProvider";

/// Which kind of runtime node a provider hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRole {
    Component,
    DataObject,
}

/// Everything a provider needs to build one node.
pub struct ProvideRequest<'a> {
    pub feature_name: &'a str,
    pub definition: &'a NodeDefinition,
    pub provider: &'a ProviderDefinition,
    pub payload: &'a PropertyValue,
    pub source: &'a dyn DataObjectSource,
    pub registry: &'a TypeRegistry,
    pub link: Option<Arc<dyn ServerLink>>,
}

/// Factory for runtime nodes of a declared type.
pub trait Provider: Send + Sync + Debug {
    fn type_name(&self) -> &str;
    fn role(&self) -> ProviderRole;
    fn provide(&self, request: ProvideRequest<'_>) -> Option<RuntimeNode>;
}

/// Resolve the node's properties against payload and DataObjects, then let
/// the registry construct it. Nodes of the wrong kind are discarded.
fn construct(request: ProvideRequest<'_>, role: ProviderRole) -> Option<RuntimeNode> {
    let def = request.definition;
    let mut properties = def.properties.clone();
    ExpressionParser::resolve(&mut properties, request.payload, request.source);

    let seed = NodeSeed::new(&def.key_name, &def.type_name, request.feature_name, properties)
        .with_link(request.link);
    let node = request.registry.create_instance(seed)?;

    let matches = match (&node, role) {
        (RuntimeNode::Component(_), ProviderRole::Component) => true,
        (RuntimeNode::DataObject(_), ProviderRole::DataObject) => true,
        _ => false,
    };
    if !matches {
        warn!(
            feature = request.feature_name,
            key = %def.key_name,
            type_name = %def.type_name,
            provider = request.provider.key_name(),
            expected = ?role,
            "provider produced a node of the wrong kind, discarding it"
        );
        return None;
    }
    debug!(feature = request.feature_name, key = %def.key_name, "node constructed");
    Some(node)
}

/// Builds components through the type registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentProvider;

impl Provider for ComponentProvider {
    fn type_name(&self) -> &str {
        COMPONENT_PROVIDER
    }

    fn role(&self) -> ProviderRole {
        ProviderRole::Component
    }

    fn provide(&self, request: ProvideRequest<'_>) -> Option<RuntimeNode> {
        construct(request, ProviderRole::Component)
    }
}

/// Builds DataObjects whose live value is pushed by the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerDataProvider;

impl Provider for ServerDataProvider {
    fn type_name(&self) -> &str {
        SERVER_DATA_PROVIDER
    }

    fn role(&self) -> ProviderRole {
        ProviderRole::DataObject
    }

    fn provide(&self, request: ProvideRequest<'_>) -> Option<RuntimeNode> {
        construct(request, ProviderRole::DataObject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::NoDataObjects;
    use crate::registry::TypeCatalogue;
    use serde_json::json;

    fn definition(value: serde_json::Value) -> NodeDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_component_provider_resolves_properties() {
        let registry = TypeRegistry::new();
        registry.build_mapping(TypeCatalogue::builtin());
        let def = definition(json!({
            "keyName": "greet",
            "typeName": "RelayComponent",
            "props": {"output": "Hello {payload.name}!"}
        }));
        let provider = definition(json!({"keyName": "p", "typeName": COMPONENT_PROVIDER}));
        let provider = ProviderDefinition { node: provider };

        let node = ComponentProvider
            .provide(ProvideRequest {
                feature_name: "f",
                definition: &def,
                provider: &provider,
                payload: &PropertyValue::from(json!({"name": "Ann"})),
                source: &NoDataObjects,
                registry: &registry,
                link: None,
            })
            .and_then(RuntimeNode::into_component)
            .expect("component");
        assert_eq!(node.properties().get("output"), Some(&PropertyValue::from("Hello Ann!")));
    }

    #[test]
    fn test_wrong_kind_is_discarded() {
        let registry = TypeRegistry::new();
        registry.build_mapping(TypeCatalogue::builtin());
        let def = definition(json!({"keyName": "v", "typeName": "ValueDataObject"}));
        let provider = ProviderDefinition {
            node: definition(json!({"keyName": "p", "typeName": COMPONENT_PROVIDER})),
        };
        let node = ComponentProvider.provide(ProvideRequest {
            feature_name: "f",
            definition: &def,
            provider: &provider,
            payload: &PropertyValue::Null,
            source: &NoDataObjects,
            registry: &registry,
            link: None,
        });
        assert!(node.is_none());
    }
}
