pub mod cache;
pub mod fetch;
pub mod manager;
pub mod state;

pub use cache::ManifestCache;
pub use fetch::{DirectoryManifestFetcher, FetchError, HttpManifestFetcher, ManifestFetcher};
pub use manager::{BarrierTiming, ConfigManager};
pub use state::{FeatureState, SyncPhase, SyncState};
