pub mod config;
pub mod provider;

pub use config::{
    ComponentDefinition, DataObjectDefinition, Diagnostic, FeatureConfig, ManifestDocument, ManifestError,
    NodeDefinition, ProviderDefinition,
};
pub use provider::{ComponentProvider, ProvideRequest, Provider, ProviderRole, ServerDataProvider};
