pub mod app;
pub mod components;
pub mod expression;
pub mod feature;
pub mod host;
pub mod link;
pub mod logger;
pub mod message;
pub mod node;
pub mod orchestrator;
pub mod registry;
pub mod schema;
pub mod settings;
pub mod sync;
pub mod value;

pub use app::Engine;
pub use expression::{DataObjectSource, ExpressionParser};
pub use feature::{FeatureConfig, ManifestDocument};
pub use link::{ChannelServerLink, IncomingHandler, ServerLink};
pub use message::ServerMessage;
pub use node::{Component, DataObject, NodeSeed, RuntimeNode};
pub use orchestrator::{CascadeReport, Orchestrator};
pub use registry::{TypeCatalogue, TypeRegistry};
pub use settings::ProtonSettings;
pub use sync::{ConfigManager, SyncPhase};
pub use value::PropertyValue;
