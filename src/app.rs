//! Engine: one explicit context holding the registry, the orchestrator and
//! the config manager, wired from settings.
use std::fs;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::host::{ExperimentSource, ScopedElementHost};
use crate::link::{IncomingHandler, ServerLink};
use crate::message::{DATA_UPDATED, PERFORM_COMPONENT, SYNC_FEATURES, ServerMessage};
use crate::orchestrator::Orchestrator;
use crate::registry::{TypeCatalogue, TypeRegistry};
use crate::settings::ProtonSettings;
use crate::sync::{ConfigManager, HttpManifestFetcher, ManifestCache, ManifestFetcher, SyncPhase};

pub struct Engine {
    settings: ProtonSettings,
    registry: Arc<TypeRegistry>,
    orchestrator: Arc<Orchestrator>,
    config_manager: Arc<ConfigManager>,
    experiments: Arc<dyn ExperimentSource>,
    barrier_task: Mutex<Option<JoinHandle<()>>>,
    listen_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Builds the type registry from `catalogue`, prepares the cache
    /// directory and wires the managers together.
    ///
    /// Without an explicit `fetcher` one is built from `settings.base_url`.
    pub fn bootstrap(
        settings: ProtonSettings,
        catalogue: TypeCatalogue,
        link: Arc<dyn ServerLink>,
        experiments: Arc<dyn ExperimentSource>,
        elements: Arc<dyn ScopedElementHost>,
        fetcher: Option<Arc<dyn ManifestFetcher>>,
    ) -> Result<Self> {
        let fetcher = match fetcher {
            Some(fetcher) => fetcher,
            None => http_fetcher(&settings)?,
        };

        fs::create_dir_all(&settings.cache_dir)
            .with_context(|| format!("could not create cache dir {}", settings.cache_dir.display()))?;

        let registry = Arc::new(TypeRegistry::new());
        registry.build_mapping(catalogue);

        let orchestrator = Arc::new(
            Orchestrator::new(Arc::clone(&registry))
                .with_link(Arc::clone(&link))
                .with_max_cascade_steps(settings.max_cascade_steps),
        );

        let config_manager = ConfigManager::new(
            ManifestCache::new(&settings.cache_dir),
            fetcher,
            Arc::clone(&orchestrator),
            link,
        )
        .with_elements(elements)
        .with_timing(settings.barrier_timing());

        info!(
            cache = %settings.cache_dir.display(),
            types = registry.type_names().len(),
            "proton engine ready"
        );

        Ok(Self {
            settings,
            registry,
            orchestrator,
            config_manager: Arc::new(config_manager),
            experiments,
            barrier_task: Mutex::new(None),
            listen_task: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &ProtonSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub fn phase(&self) -> SyncPhase {
        self.config_manager.phase()
    }

    /// Ask the experiment source for the current features and start a sync
    /// session. Returns false when there was nothing to wait for.
    pub fn start_sync(&self) -> bool {
        let toggles = self.experiments.features();
        let handle = self.config_manager.setup(&toggles);
        let started = handle.is_some();
        if let Some(previous) = std::mem::replace(&mut *self.lock(&self.barrier_task), handle) {
            previous.abort();
        }
        started
    }

    /// Wait until the ready list of the running session has been sent.
    pub async fn ready_reported(&self) -> Result<()> {
        let handle = self.lock(&self.barrier_task).take();
        match handle {
            Some(handle) => handle.await.map_err(|e| anyhow!("readiness barrier failed: {e}")),
            None => Ok(()),
        }
    }

    pub async fn wait_synced(&self) {
        self.config_manager.wait_synced().await
    }

    /// Feed everything arriving on `inbound` through [`IncomingHandler`].
    pub fn listen(self: &Arc<Self>, mut inbound: UnboundedReceiver<ServerMessage>) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                engine.handle_incoming(msg);
            }
            debug!("inbound server channel closed");
        });
        if let Some(previous) = self.lock(&self.listen_task).replace(handle) {
            previous.abort();
        }
    }

    /// Run the component named `trigger_key` in every active feature.
    pub fn perform_trigger(&self, trigger_key: &str) -> usize {
        self.orchestrator.perform_trigger(trigger_key).len()
    }

    pub fn shutdown(&self) {
        for slot in [&self.barrier_task, &self.listen_task] {
            if let Some(handle) = self.lock(slot).take() {
                handle.abort();
            }
        }
        info!("proton engine stopped");
    }

    fn lock<'a>(&self, slot: &'a Mutex<Option<JoinHandle<()>>>) -> std::sync::MutexGuard<'a, Option<JoinHandle<()>>> {
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IncomingHandler for Engine {
    fn handle_incoming(&self, msg: ServerMessage) {
        match msg.name() {
            SYNC_FEATURES => {
                self.config_manager.on_sync_message(&msg);
            }
            PERFORM_COMPONENT => {
                self.orchestrator.on_perform_component_event(&msg);
            }
            DATA_UPDATED => {
                self.orchestrator.on_data_updated_event(&msg);
            }
            other => debug!(name = other, "ignoring server message"),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for slot in [&self.barrier_task, &self.listen_task] {
            if let Some(handle) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                handle.abort();
            }
        }
    }
}

fn http_fetcher(settings: &ProtonSettings) -> Result<Arc<dyn ManifestFetcher>> {
    let base = settings
        .base_url
        .clone()
        .ok_or_else(|| anyhow!("no manifest host configured, set {}", crate::settings::BASE_URL))?;
    match HttpManifestFetcher::new(base) {
        Ok(fetcher) => Ok(Arc::new(fetcher)),
        Err(e) => {
            error!(error = %e, "could not build manifest fetcher");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FeatureToggle, InactiveElementRegistry, StaticExperiments};
    use crate::link::ChannelServerLink;
    use crate::sync::DirectoryManifestFetcher;
    use serde_json::{Map, json};
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> ProtonSettings {
        ProtonSettings {
            cache_dir: dir.path().join("cache"),
            ..ProtonSettings::default()
        }
    }

    #[tokio::test]
    async fn test_bootstrap_without_host_fails() {
        let dir = TempDir::new().unwrap();
        let (link, _rx) = ChannelServerLink::new();
        let result = Engine::bootstrap(
            settings(&dir),
            TypeCatalogue::builtin(),
            Arc::new(link),
            Arc::new(StaticExperiments::default()),
            Arc::new(InactiveElementRegistry::new()),
            None,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_with_http_host() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir);
        settings.base_url = Some("https://cdn.example.com/".parse().unwrap());
        let (link, _rx) = ChannelServerLink::new();
        let engine = Engine::bootstrap(
            settings,
            TypeCatalogue::builtin(),
            Arc::new(link),
            Arc::new(StaticExperiments::default()),
            Arc::new(InactiveElementRegistry::new()),
            None,
        )
        .unwrap();
        assert!(dir.path().join("cache").is_dir());
        assert!(engine.registry().is_built());
        assert_eq!(engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_zero_features_needs_no_barrier() {
        let dir = TempDir::new().unwrap();
        let (link, mut rx) = ChannelServerLink::new();
        let experiments = StaticExperiments::new(vec![FeatureToggle::disabled("promo", "1")]);
        let engine = Engine::bootstrap(
            settings(&dir),
            TypeCatalogue::builtin(),
            Arc::new(link),
            Arc::new(experiments),
            Arc::new(InactiveElementRegistry::new()),
            Some(Arc::new(DirectoryManifestFetcher::new(dir.path()))),
        )
        .unwrap();

        assert!(!engine.start_sync());
        engine.ready_reported().await.unwrap();
        assert_eq!(engine.phase(), SyncPhase::Synced);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_messages_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (link, _rx) = ChannelServerLink::new();
        let engine = Engine::bootstrap(
            settings(&dir),
            TypeCatalogue::builtin(),
            Arc::new(link),
            Arc::new(StaticExperiments::default()),
            Arc::new(InactiveElementRegistry::new()),
            Some(Arc::new(DirectoryManifestFetcher::new(dir.path()))),
        )
        .unwrap();

        engine.handle_incoming(ServerMessage::new("heartbeat", Map::new()));
        let mut props = Map::new();
        props.insert("featurename".into(), json!("ghost"));
        props.insert("component_keyname".into(), json!("start"));
        engine.handle_incoming(ServerMessage::new(PERFORM_COMPONENT, props));
        assert!(engine.orchestrator().active_features().is_empty());
    }
}
