use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::orchestrator::DEFAULT_MAX_CASCADE_STEPS;
use crate::sync::manager::{BarrierTiming, DEFAULT_CEILING, DEFAULT_TICK};

pub const BASE_URL: &str = "PROTON_BASE_URL";
pub const CACHE_DIR: &str = "PROTON_CACHE_DIR";
pub const SYNC_TIMEOUT_MS: &str = "PROTON_SYNC_TIMEOUT_MS";
pub const TICK_MS: &str = "PROTON_TICK_MS";
pub const MAX_CASCADE_STEPS: &str = "PROTON_MAX_CASCADE_STEPS";
pub const LOG_LEVEL: &str = "PROTON_LOG_LEVEL";
pub const LOG_DIR: &str = "PROTON_LOG_DIR";
pub const OTEL_ENDPOINT: &str = "PROTON_OTEL_ENDPOINT";

/// A key/value source of settings.
#[async_trait]
#[typetag::serde]
pub trait SettingsManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn keys(&self) -> Vec<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;
    fn clone_box(&self) -> Box<dyn SettingsManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct SettingsManager(pub Box<dyn SettingsManagerType>);

impl SettingsManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl Clone for SettingsManager {
    fn clone(&self) -> Self {
        SettingsManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for SettingsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SettingsError {
    #[error("setting {key}=`{value}` is invalid: {reason}")]
    Invalid { key: String, value: String, reason: String },
    #[error("settings source is read-only")]
    ReadOnly,
}

/// Process environment, optionally primed from a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvSettingsManager {
    env_file: Option<PathBuf>,
}

impl EnvSettingsManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        if let Some(path) = &env_file {
            match dotenvy::from_path(path) {
                Ok(()) => info!("Loaded .env from {}", path.display()),
                Err(e) => warn!("could not load .env from {}: {}", path.display(), e),
            }
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl SettingsManagerType for EnvSettingsManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).filter(|k| k.starts_with("PROTON_")).collect()
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), SettingsError> {
        Err(SettingsError::ReadOnly)
    }

    fn clone_box(&self) -> Box<dyn SettingsManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(path) => format!("EnvSettingsManager({})", path.display()),
            None => "EnvSettingsManager".to_string(),
        }
    }
}

/// In-memory settings, used by tests and embedding hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapSettingsManager {
    map: DashMap<String, String>,
}

impl MapSettingsManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[typetag::serde]
#[async_trait]
impl SettingsManagerType for MapSettingsManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn SettingsManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapSettingsManager({} entries)", self.map.len())
    }
}

/// Engine settings resolved from a [`SettingsManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtonSettings {
    /// Manifest host; without it manifests can only come from the cache.
    pub base_url: Option<Url>,
    pub cache_dir: PathBuf,
    pub sync_timeout_ms: u64,
    pub tick_ms: u64,
    pub max_cascade_steps: usize,
    pub log_level: String,
    pub log_dir: PathBuf,
    pub otel_endpoint: Option<String>,
}

impl Default for ProtonSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            cache_dir: PathBuf::from("./proton-cache"),
            sync_timeout_ms: DEFAULT_CEILING.as_millis() as u64,
            tick_ms: DEFAULT_TICK.as_millis() as u64,
            max_cascade_steps: DEFAULT_MAX_CASCADE_STEPS,
            log_level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            otel_endpoint: None,
        }
    }
}

impl ProtonSettings {
    pub async fn from_manager(settings: &SettingsManager) -> Result<Self, SettingsError> {
        let defaults = Self::default();
        let base_url = match settings.get(BASE_URL).await {
            Some(raw) => Some(Url::parse(&raw).map_err(|e| invalid(BASE_URL, &raw, e))?),
            None => None,
        };
        Ok(Self {
            base_url,
            cache_dir: settings.get(CACHE_DIR).await.map(PathBuf::from).unwrap_or(defaults.cache_dir),
            sync_timeout_ms: number(settings, SYNC_TIMEOUT_MS, defaults.sync_timeout_ms).await?,
            tick_ms: number(settings, TICK_MS, defaults.tick_ms).await?,
            max_cascade_steps: number(settings, MAX_CASCADE_STEPS, defaults.max_cascade_steps).await?,
            log_level: settings.get(LOG_LEVEL).await.unwrap_or(defaults.log_level),
            log_dir: settings.get(LOG_DIR).await.map(PathBuf::from).unwrap_or(defaults.log_dir),
            otel_endpoint: settings.get(OTEL_ENDPOINT).await.filter(|e| !e.is_empty()),
        })
    }

    pub fn barrier_timing(&self) -> BarrierTiming {
        BarrierTiming::new(
            Duration::from_millis(self.tick_ms),
            Duration::from_millis(self.sync_timeout_ms),
        )
    }
}

fn invalid(key: &str, value: &str, reason: impl ToString) -> SettingsError {
    SettingsError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

async fn number<T>(settings: &SettingsManager, key: &str, default: T) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: ToString,
{
    match settings.get(key).await {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| invalid(key, &raw, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_defaults_when_unset() {
        let settings = SettingsManager(MapSettingsManager::new());
        let resolved = ProtonSettings::from_manager(&settings).await.unwrap();
        assert_eq!(resolved, ProtonSettings::default());
        assert_eq!(resolved.barrier_timing(), BarrierTiming::default());
    }

    #[tokio::test]
    async fn test_values_are_parsed() {
        let settings = SettingsManager(
            MapSettingsManager::new()
                .with(BASE_URL, "https://cdn.example.com/")
                .with(SYNC_TIMEOUT_MS, "500")
                .with(MAX_CASCADE_STEPS, " 12 ")
                .with(CACHE_DIR, "/tmp/proton"),
        );
        let resolved = ProtonSettings::from_manager(&settings).await.unwrap();
        assert_eq!(resolved.base_url.unwrap().as_str(), "https://cdn.example.com/");
        assert_eq!(resolved.sync_timeout_ms, 500);
        assert_eq!(resolved.max_cascade_steps, 12);
        assert_eq!(resolved.cache_dir, PathBuf::from("/tmp/proton"));
    }

    #[tokio::test]
    async fn test_invalid_number_is_reported() {
        let settings = SettingsManager(MapSettingsManager::new().with(TICK_MS, "fast"));
        let err = ProtonSettings::from_manager(&settings).await.unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { ref key, .. } if key == TICK_MS));
    }

    #[tokio::test]
    async fn test_env_manager_reads_env_file() {
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "PROTON_TEST_ONLY_CACHE=/var/cache/proton\n").unwrap();

        let mgr = EnvSettingsManager::new(Some(env_path));
        assert_eq!(mgr.get("PROTON_TEST_ONLY_CACHE").await, Some("/var/cache/proton".to_string()));
        assert!(mgr.keys().await.contains(&"PROTON_TEST_ONLY_CACHE".to_string()));
        assert_eq!(mgr.set("PROTON_TEST_ONLY_CACHE", "x").await, Err(SettingsError::ReadOnly));
    }

    #[tokio::test]
    async fn test_map_manager_set_and_clone() {
        let mgr = SettingsManager(MapSettingsManager::new());
        mgr.0.set("k", "v").await.unwrap();
        let copy = mgr.clone();
        assert_eq!(copy.get("k").await, Some("v".to_string()));
        assert_eq!(format!("{:?}", copy), "MapSettingsManager(1 entries)");
    }
}
