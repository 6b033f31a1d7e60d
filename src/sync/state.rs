use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where the session is in the cache/sync handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Resolving,
    /// Ready report sent or about to be, waiting for the server's push.
    PendingSync,
    Synced,
}

/// Per-feature outcome within one sync session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeatureState {
    Fetching { version: String },
    Cached { version: String },
    Fetched { version: String, late: bool },
    Failed { version: String, reason: String },
}

impl FeatureState {
    pub fn is_ready(&self) -> bool {
        matches!(self, FeatureState::Cached { .. } | FeatureState::Fetched { .. })
    }
}

#[derive(Debug, Clone)]
struct ManifestEntry {
    version: String,
    body: String,
}

#[derive(Debug, Default)]
struct SyncProgress {
    expected: usize,
    processed: usize,
    reported: bool,
    ready: BTreeMap<String, String>,
    manifests: HashMap<String, ManifestEntry>,
    features: BTreeMap<String, FeatureState>,
}

/// Scratch state of one `setup` call, dropped once the server's push has
/// been handled.
#[derive(Debug)]
pub struct SyncState {
    id: Uuid,
    progress: Mutex<SyncProgress>,
}

impl SyncState {
    pub fn new(expected: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            progress: Mutex::new(SyncProgress {
                expected,
                ..SyncProgress::default()
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, SyncProgress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_fetching(&self, feature: &str, version: &str) {
        self.lock().features.insert(
            feature.to_string(),
            FeatureState::Fetching { version: version.to_string() },
        );
    }

    /// Manifest found in the local cache.
    pub fn mark_cached(&self, feature: &str, version: &str, body: String) {
        let state = FeatureState::Cached { version: version.to_string() };
        self.mark_ready(feature, version, body, state);
    }

    /// Manifest arrived from the server. Late arrivals (after the ready
    /// report went out) are kept for a later push but flagged.
    pub fn mark_fetched(&self, feature: &str, version: &str, body: String) {
        let late = self.lock().reported;
        let state = FeatureState::Fetched { version: version.to_string(), late };
        self.mark_ready(feature, version, body, state);
    }

    fn mark_ready(&self, feature: &str, version: &str, body: String, state: FeatureState) {
        let mut progress = self.lock();
        progress.processed += 1;
        progress.ready.insert(feature.to_string(), version.to_string());
        progress.manifests.insert(
            feature.to_string(),
            ManifestEntry { version: version.to_string(), body },
        );
        progress.features.insert(feature.to_string(), state);
    }

    /// Counts as processed so the barrier is not starved, but never as ready.
    pub fn mark_failed(&self, feature: &str, version: &str, reason: impl Into<String>) {
        let mut progress = self.lock();
        progress.processed += 1;
        progress.features.insert(
            feature.to_string(),
            FeatureState::Failed { version: version.to_string(), reason: reason.into() },
        );
    }

    pub fn mark_reported(&self) {
        self.lock().reported = true;
    }

    pub fn is_reported(&self) -> bool {
        self.lock().reported
    }

    /// `(processed, expected)`
    pub fn progress(&self) -> (usize, usize) {
        let progress = self.lock();
        (progress.processed, progress.expected)
    }

    pub fn is_complete(&self) -> bool {
        let progress = self.lock();
        progress.expected == 0 || progress.processed >= progress.expected
    }

    /// feature → version of every materialised manifest.
    pub fn ready_features(&self) -> BTreeMap<String, String> {
        self.lock().ready.clone()
    }

    /// `(version, body)` of a materialised manifest.
    pub fn manifest(&self, feature: &str) -> Option<(String, String)> {
        self.lock()
            .manifests
            .get(feature)
            .map(|entry| (entry.version.clone(), entry.body.clone()))
    }

    pub fn feature_state(&self, feature: &str) -> Option<FeatureState> {
        self.lock().features.get(feature).cloned()
    }

    pub fn feature_states(&self) -> BTreeMap<String, FeatureState> {
        self.lock().features.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_advance_progress_but_not_ready() {
        let state = SyncState::new(2);
        state.mark_cached("a", "1", "{}".to_string());
        assert!(!state.is_complete());
        state.mark_failed("b", "4", "404");
        assert!(state.is_complete());
        assert_eq!(state.progress(), (2, 2));
        assert_eq!(state.ready_features().into_iter().collect::<Vec<_>>(), vec![("a".to_string(), "1".to_string())]);
        assert!(state.manifest("b").is_none());
        assert!(!state.feature_state("b").unwrap().is_ready());
    }

    #[test]
    fn test_zero_expected_is_complete() {
        assert!(SyncState::new(0).is_complete());
    }

    #[test]
    fn test_late_fetch_is_flagged() {
        let state = SyncState::new(1);
        state.mark_fetching("a", "2");
        state.mark_reported();
        state.mark_fetched("a", "2", "{}".to_string());
        assert_eq!(
            state.feature_state("a"),
            Some(FeatureState::Fetched { version: "2".to_string(), late: true })
        );
        assert_eq!(state.manifest("a"), Some(("2".to_string(), "{}".to_string())));
    }
}
