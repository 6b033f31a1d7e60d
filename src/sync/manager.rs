//! ConfigManager: resolves enabled features to manifests (cache or remote),
//! runs the readiness barrier, and activates features on the server's push.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::feature::config::FeatureConfig;
use crate::host::{FeatureToggle, InactiveElementRegistry, ScopedElementHost, element_feature};
use crate::link::ServerLink;
use crate::message::{ActiveFeaturesPush, ServerMessage};
use crate::orchestrator::Orchestrator;
use crate::sync::cache::ManifestCache;
use crate::sync::fetch::ManifestFetcher;
use crate::sync::state::{SyncPhase, SyncState};

pub const DEFAULT_TICK: Duration = Duration::from_millis(16);
pub const DEFAULT_CEILING: Duration = Duration::from_millis(3000);

/// Poll interval and accumulated wait limit of the readiness barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierTiming {
    tick: Duration,
    ceiling: Duration,
}

impl BarrierTiming {
    /// A zero tick would never accumulate towards the ceiling; it is raised
    /// to one millisecond.
    pub fn new(tick: Duration, ceiling: Duration) -> Self {
        Self {
            tick: tick.max(Duration::from_millis(1)),
            ceiling,
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for BarrierTiming {
    fn default() -> Self {
        Self::new(DEFAULT_TICK, DEFAULT_CEILING)
    }
}

pub struct ConfigManager {
    cache: ManifestCache,
    fetcher: Arc<dyn ManifestFetcher>,
    orchestrator: Arc<Orchestrator>,
    link: Arc<dyn ServerLink>,
    elements: Arc<dyn ScopedElementHost>,
    timing: BarrierTiming,
    session: Mutex<Option<Arc<SyncState>>>,
    phase: watch::Sender<SyncPhase>,
}

impl ConfigManager {
    pub fn new(
        cache: ManifestCache,
        fetcher: Arc<dyn ManifestFetcher>,
        orchestrator: Arc<Orchestrator>,
        link: Arc<dyn ServerLink>,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            cache,
            fetcher,
            orchestrator,
            link,
            elements: Arc::new(InactiveElementRegistry::new()),
            timing: BarrierTiming::default(),
            session: Mutex::new(None),
            phase,
        }
    }

    pub fn with_elements(mut self, elements: Arc<dyn ScopedElementHost>) -> Self {
        self.elements = elements;
        self
    }

    pub fn with_timing(mut self, timing: BarrierTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn cache(&self) -> &ManifestCache {
        &self.cache
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Resolves once the current session is synced.
    pub async fn wait_synced(&self) {
        let mut rx = self.phase.subscribe();
        // the sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|phase| *phase == SyncPhase::Synced).await;
    }

    /// The running sync session, if any.
    pub fn session(&self) -> Option<Arc<SyncState>> {
        self.lock_session().clone()
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Arc<SyncState>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a sync session for `toggles`. Cached manifests are taken as
    /// ready right away, the rest are fetched in the background. Returns the
    /// readiness barrier task, `None` when there was nothing to resolve.
    #[tracing::instrument(skip_all, fields(features = toggles.len()))]
    pub fn setup(self: &Arc<Self>, toggles: &[FeatureToggle]) -> Option<JoinHandle<()>> {
        let enabled: Vec<&FeatureToggle> = toggles.iter().filter(|t| t.in_experiment).collect();
        let state = Arc::new(SyncState::new(enabled.len()));
        if let Some(previous) = self.lock_session().replace(Arc::clone(&state)) {
            debug!(session = %previous.id(), "previous sync session discarded");
        }
        self.phase.send_replace(SyncPhase::Resolving);

        if enabled.is_empty() {
            info!("no enabled features, nothing to sync");
            self.finish_session(&state);
            return None;
        }

        for toggle in enabled {
            let (feature, version) = (toggle.name.as_str(), toggle.version.as_str());
            if let Some(body) = self.cache.read(feature, version) {
                state.mark_cached(feature, version, body);
                continue;
            }

            state.mark_fetching(feature, version);
            let cache = self.cache.clone();
            let (stale_feature, keep) = (feature.to_string(), version.to_string());
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                cache.remove_stale(&stale_feature, &keep);
            });
            tokio::spawn(Arc::clone(self).fetch_feature(
                Arc::clone(&state),
                feature.to_string(),
                version.to_string(),
            ));
        }

        self.phase.send_replace(SyncPhase::PendingSync);
        Some(tokio::spawn(Arc::clone(self).await_readiness(state)))
    }

    async fn fetch_feature(self: Arc<Self>, state: Arc<SyncState>, feature: String, version: String) {
        match self.fetcher.fetch(&feature, &version).await {
            Ok(body) => {
                if let Err(e) = self.cache.write(&feature, &version, &body) {
                    warn!(%feature, %version, error = %e, "could not persist manifest");
                }
                state.mark_fetched(&feature, &version, body);
                if state.is_reported() {
                    info!(%feature, %version, "manifest arrived after the ready report");
                }
            }
            Err(e) => {
                error!(%feature, %version, error = %e, "manifest fetch failed, feature stays off this session");
                state.mark_failed(&feature, &version, e.to_string());
            }
        }
    }

    /// Poll once per tick until every feature is processed or the
    /// accumulated wait reaches the ceiling, then report what is ready.
    async fn await_readiness(self: Arc<Self>, state: Arc<SyncState>) {
        let mut waited = Duration::ZERO;
        while !state.is_complete() {
            if waited >= self.timing.ceiling {
                let (processed, expected) = state.progress();
                warn!(processed, expected, "readiness ceiling reached, reporting what is ready");
                break;
            }
            let tick = self.timing.tick.min(self.timing.ceiling - waited);
            tokio::time::sleep(tick).await;
            waited += tick;
        }

        let ready = state.ready_features();
        state.mark_reported();
        info!(ready = ready.len(), session = %state.id(), "reporting ready features");
        if let Err(e) = self.link.send(ServerMessage::ready_list(&ready)) {
            error!(error = %e, "could not send ready list");
        }
        if ready.is_empty() {
            self.finish_session(&state);
        }
    }

    /// Inbound `sync_proton_features`.
    pub fn on_sync_message(&self, msg: &ServerMessage) -> Vec<String> {
        match msg.parse::<ActiveFeaturesPush>() {
            Ok(push) => self.on_sync_features(&push.active_features),
            Err(e) => {
                warn!(error = %e, "ignoring sync push");
                Vec::new()
            }
        }
    }

    /// Register every listed feature whose manifest this session holds.
    /// Returns the features that were activated.
    #[tracing::instrument(skip(self))]
    pub fn on_sync_features(&self, active: &[String]) -> Vec<String> {
        let state = self.session();
        let mut activated = Vec::new();

        for feature in active {
            let Some((version, body)) = state.as_ref().and_then(|s| s.manifest(feature)) else {
                error!(%feature, "server activated a feature this client never materialised, skipping it");
                continue;
            };
            match FeatureConfig::parse(feature, &body) {
                Ok(config) => {
                    self.orchestrator.register(config);
                    info!(%feature, %version, "feature activated");
                    activated.push(feature.clone());
                }
                Err(e) => error!(%feature, %version, error = %e, "manifest does not parse, skipping feature"),
            }
        }

        self.reactivate_elements(&activated);
        match state {
            Some(state) => self.finish_session(&state),
            None => {
                self.phase.send_replace(SyncPhase::Synced);
            }
        }
        activated
    }

    fn reactivate_elements(&self, activated: &[String]) {
        for element in self.elements.inactive_elements() {
            let wanted = element_feature(&element).is_some_and(|feature| activated.iter().any(|a| a == feature));
            if wanted {
                self.elements.reactivate(&element);
            }
        }
    }

    /// Mark synced and drop the session, unless a newer setup replaced it.
    fn finish_session(&self, state: &SyncState) {
        let mut session = self.lock_session();
        if session.as_ref().is_some_and(|s| s.id() == state.id()) {
            *session = None;
            drop(session);
            self.phase.send_replace(SyncPhase::Synced);
            debug!(session = %state.id(), "sync session finished");
        }
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("cache", &self.cache.dir())
            .field("timing", &self.timing)
            .field("phase", &self.phase())
            .finish()
    }
}
