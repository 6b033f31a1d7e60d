//! Contracts of the host application the engine is embedded in: the
//! experiment system and the UI layer's feature-scoped elements.
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One feature as the experiment system sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureToggle {
    pub name: String,
    pub in_experiment: bool,
    /// Manifest version this client must run.
    pub version: String,
}

impl FeatureToggle {
    pub fn enabled(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_experiment: true,
            version: version.into(),
        }
    }

    pub fn disabled(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            in_experiment: false,
            ..Self::enabled(name, version)
        }
    }
}

/// `name=version`, enabled.
impl FromStr for FeatureToggle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Ok(FeatureToggle::enabled(name.trim(), version.trim()))
            }
            _ => Err(format!("expected `name=version`, got `{}`", s)),
        }
    }
}

pub trait ExperimentSource: Send + Sync {
    fn features(&self) -> Vec<FeatureToggle>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticExperiments(Vec<FeatureToggle>);

impl StaticExperiments {
    pub fn new(features: Vec<FeatureToggle>) -> Self {
        Self(features)
    }
}

impl ExperimentSource for StaticExperiments {
    fn features(&self) -> Vec<FeatureToggle> {
        self.0.clone()
    }
}

/// UI elements that wait for their feature, keyed `"{action}:{feature}"`.
pub trait ScopedElementHost: Send + Sync {
    fn inactive_elements(&self) -> Vec<String>;
    fn reactivate(&self, element: &str);
}

pub fn element_key(action: &str, feature: &str) -> String {
    format!("{}:{}", action, feature)
}

/// Feature name part of an element key.
pub fn element_feature(element: &str) -> Option<&str> {
    element.rsplit_once(':').map(|(_, feature)| feature)
}

/// In-memory set of parked elements.
#[derive(Debug, Default)]
pub struct InactiveElementRegistry {
    inactive: Mutex<BTreeSet<String>>,
}

impl InactiveElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self, action: &str, feature: &str) {
        self.inactive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(element_key(action, feature));
    }

    pub fn is_inactive(&self, action: &str, feature: &str) -> bool {
        self.inactive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&element_key(action, feature))
    }
}

impl ScopedElementHost for InactiveElementRegistry {
    fn inactive_elements(&self) -> Vec<String> {
        self.inactive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn reactivate(&self, element: &str) {
        if self.inactive.lock().unwrap_or_else(PoisonError::into_inner).remove(element) {
            debug!(element, "element reactivated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_from_str() {
        assert_eq!("checkout=3".parse::<FeatureToggle>(), Ok(FeatureToggle::enabled("checkout", "3")));
        assert!("checkout".parse::<FeatureToggle>().is_err());
        assert!("=3".parse::<FeatureToggle>().is_err());
    }

    #[test]
    fn test_element_registry() {
        let elements = InactiveElementRegistry::new();
        elements.park("open_banner", "promo");
        assert_eq!(elements.inactive_elements(), vec!["open_banner:promo".to_string()]);
        assert_eq!(element_feature("open_banner:promo"), Some("promo"));
        assert_eq!(element_feature("nav:open:promo"), Some("promo"));

        elements.reactivate("open_banner:promo");
        assert!(!elements.is_inactive("open_banner", "promo"));
    }
}
