//! TypeRegistry: maps manifest type names to node factories and providers.
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::feature::provider::Provider;
use crate::node::{NodeSeed, RuntimeNode};

/// Self-construct factory of one node type.
pub type NodeFactory = Arc<dyn Fn(NodeSeed) -> Option<RuntimeNode> + Send + Sync>;

/// One node type known to the application.
#[derive(Clone)]
pub struct CatalogueEntry {
    type_name: String,
    factory: Option<NodeFactory>,
}

impl CatalogueEntry {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

impl fmt::Debug for CatalogueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogueEntry")
            .field("type_name", &self.type_name)
            .field("factory", &self.factory.is_some())
            .finish()
    }
}

/// The application's type catalogue, handed to [`TypeRegistry::build_mapping`]
/// once at startup.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalogue {
    nodes: Vec<CatalogueEntry>,
    providers: Vec<Arc<dyn Provider>>,
}

impl TypeCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The node types and providers shipped with this crate.
    pub fn builtin() -> Self {
        crate::components::register_builtins(Self::new())
    }

    pub fn with_node<F>(mut self, type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(NodeSeed) -> Option<RuntimeNode> + Send + Sync + 'static,
    {
        self.nodes.push(CatalogueEntry {
            type_name: type_name.into(),
            factory: Some(Arc::new(factory)),
        });
        self
    }

    /// A type that is known by name but cannot construct itself.
    pub fn with_declared(mut self, type_name: impl Into<String>) -> Self {
        self.nodes.push(CatalogueEntry {
            type_name: type_name.into(),
            factory: None,
        });
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn entries(&self) -> &[CatalogueEntry] {
        &self.nodes
    }
}

/// Process-wide type map. Built once; lookups are lock-free reads.
#[derive(Default)]
pub struct TypeRegistry {
    nodes: DashMap<String, Option<NodeFactory>>,
    providers: DashMap<String, Arc<dyn Provider>>,
    built: OnceCell<usize>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every catalogue type by its own name. Only the first call has an
    /// effect; later calls are logged and ignored. Returns whether this call
    /// built the mapping.
    pub fn build_mapping(&self, catalogue: TypeCatalogue) -> bool {
        let mut fresh = false;
        self.built.get_or_init(|| {
            fresh = true;
            for entry in catalogue.nodes {
                if self.nodes.insert(entry.type_name.clone(), entry.factory).is_some() {
                    warn!(type_name = %entry.type_name, "node type registered twice, keeping the last one");
                }
            }
            for provider in catalogue.providers {
                self.providers.insert(provider.type_name().to_string(), provider);
            }
            let count = self.nodes.len() + self.providers.len();
            info!(types = count, "type mapping built");
            count
        });
        if !fresh {
            info!("type mapping already built, ignoring second build request");
        }
        fresh
    }

    pub fn is_built(&self) -> bool {
        self.built.get().is_some()
    }

    /// Construct a node of `seed.type_name`.
    ///
    /// Unknown types yield `None`. A type registered without a factory is
    /// dropped from the map for good and also yields `None`.
    pub fn create_instance(&self, seed: NodeSeed) -> Option<RuntimeNode> {
        let factory = match self.nodes.get(&seed.type_name) {
            None => {
                debug!(type_name = %seed.type_name, key = %seed.key_name, "unknown node type");
                return None;
            }
            Some(entry) => entry.value().clone(),
        };

        let Some(factory) = factory else {
            warn!(
                type_name = %seed.type_name,
                "node type has no self-construct factory, removing it from the type map"
            );
            self.nodes.remove(&seed.type_name);
            return None;
        };

        let key = seed.key_name.clone();
        let type_name = seed.type_name.clone();
        let node = factory(seed);
        if node.is_none() {
            warn!(%type_name, %key, "node factory produced no instance");
        }
        node
    }

    pub fn provider(&self, type_name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(type_name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.nodes.contains_key(type_name)
    }

    /// Sorted list of known node type names.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("nodes", &self.type_names())
            .field("providers", &self.providers.len())
            .field("built", &self.is_built())
            .finish()
    }
}
