//! Orchestrator: the registry of active features and the dataflow walk over
//! their component graphs.
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::expression::DataObjectSource;
use crate::feature::config::{ComponentDefinition, DataObjectDefinition, FeatureConfig, ProviderDefinition};
use crate::feature::provider::{ProvideRequest, Provider, ProviderRole};
use crate::link::ServerLink;
use crate::message::{DataUpdatedEvent, PerformComponentEvent, ServerMessage};
use crate::node::{Component, DataObject, DataObjectHandle, Outputs, RuntimeNode};
use crate::registry::TypeRegistry;
use crate::value::PropertyValue;

pub const DEFAULT_MAX_CASCADE_STEPS: usize = 1024;

/// One executed component within a cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepRecord {
    pub feature: String,
    pub component: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    /// Ports the component emitted on, in emission order.
    pub ports: Vec<String>,
    pub error: Option<String>,
}

/// Everything one top-level trigger caused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CascadeReport {
    pub feature: String,
    pub trigger: String,
    pub records: Vec<StepRecord>,
    /// The step budget ran out before the walk finished.
    pub truncated: bool,
    pub total_ms: i64,
}

impl CascadeReport {
    fn empty(feature: &str, trigger: &str) -> Self {
        Self {
            feature: feature.to_string(),
            trigger: trigger.to_string(),
            records: Vec::new(),
            truncated: false,
            total_ms: 0,
        }
    }

    /// Keys of executed components, in execution order.
    pub fn executed(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.component.as_str()).collect()
    }

    /// One JSON line on the `cascade` target.
    fn emit(&self) {
        let report = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "could not serialise cascade report");
                return;
            }
        };
        tracing::event!(
            target: "cascade",
            tracing::Level::INFO,
            feature = %self.feature,
            trigger = %self.trigger,
            steps = self.records.len(),
            truncated = self.truncated,
            report = %report,
            "cascade completed"
        );
    }
}

/// Per-trigger bookkeeping: step budget and records.
struct Cascade {
    remaining: usize,
    truncated: bool,
    records: Vec<StepRecord>,
}

impl Cascade {
    fn new(budget: usize) -> Self {
        Self {
            remaining: budget,
            truncated: false,
            records: Vec::new(),
        }
    }

    fn take_step(&mut self) -> bool {
        if self.remaining == 0 {
            self.truncated = true;
            return false;
        }
        self.remaining -= 1;
        true
    }

    fn into_report(self, feature: &str, trigger: &str, started: DateTime<Utc>) -> CascadeReport {
        CascadeReport {
            feature: feature.to_string(),
            trigger: trigger.to_string(),
            records: self.records,
            truncated: self.truncated,
            total_ms: (Utc::now() - started).num_milliseconds(),
        }
    }
}

/// A registered feature and the DataObjects materialised for it so far.
pub struct ActiveFeature {
    config: Arc<FeatureConfig>,
    data_objects: DashMap<String, DataObjectHandle>,
}

impl ActiveFeature {
    fn new(config: FeatureConfig) -> Self {
        Self {
            config: Arc::new(config),
            data_objects: DashMap::new(),
        }
    }

    pub fn config(&self) -> &Arc<FeatureConfig> {
        &self.config
    }
}

impl fmt::Debug for ActiveFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveFeature")
            .field("feature", &self.config.feature_name())
            .field("data_objects", &self.data_objects.len())
            .finish()
    }
}

/// DataObject lookup for one feature while a node is being constructed.
/// DataObjects are materialised on first use and shared afterwards.
struct FeatureScope<'a> {
    orchestrator: &'a Orchestrator,
    feature: &'a ActiveFeature,
    payload: &'a PropertyValue,
    resolving: RefCell<HashSet<String>>,
}

impl<'a> FeatureScope<'a> {
    fn new(orchestrator: &'a Orchestrator, feature: &'a ActiveFeature, payload: &'a PropertyValue) -> Self {
        Self {
            orchestrator,
            feature,
            payload,
            resolving: RefCell::new(HashSet::new()),
        }
    }
}

impl DataObjectSource for FeatureScope<'_> {
    fn data_object(&self, key_name: &str) -> Option<DataObjectHandle> {
        if let Some(handle) = self.feature.data_objects.get(key_name) {
            return Some(handle.clone());
        }
        let def = self.feature.config.get_data_object_config_for_key(key_name)?;

        if !self.resolving.borrow_mut().insert(key_name.to_string()) {
            warn!(feature = self.feature.config.feature_name(), key = key_name, "DataObject refers to itself, leaving token unresolved");
            return None;
        }
        let built = self.orchestrator.construct_data_object(self, def);
        self.resolving.borrow_mut().remove(key_name);

        let handle = DataObjectHandle::new(built?);
        Some(
            self.feature
                .data_objects
                .entry(key_name.to_string())
                .or_insert(handle)
                .clone(),
        )
    }
}

/// Process-wide registry of active features and the dataflow engine.
pub struct Orchestrator {
    features: DashMap<String, Arc<ActiveFeature>>,
    registry: Arc<TypeRegistry>,
    link: Option<Arc<dyn ServerLink>>,
    max_cascade_steps: usize,
}

impl Orchestrator {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            features: DashMap::new(),
            registry,
            link: None,
            max_cascade_steps: DEFAULT_MAX_CASCADE_STEPS,
        }
    }

    pub fn with_link(mut self, link: Arc<dyn ServerLink>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn with_max_cascade_steps(mut self, steps: usize) -> Self {
        self.max_cascade_steps = steps;
        self
    }

    /// Make `config` the active manifest for its feature, replacing any
    /// earlier one together with the DataObjects built from it.
    pub fn register(&self, config: FeatureConfig) {
        let name = config.feature_name().to_string();
        for diagnostic in config.diagnostics() {
            warn!(feature = %name, "{}", diagnostic);
        }
        if self.features.insert(name.clone(), Arc::new(ActiveFeature::new(config))).is_some() {
            info!(feature = %name, "feature config replaced");
        } else {
            info!(feature = %name, "feature registered");
        }
    }

    pub fn feature(&self, name: &str) -> Option<Arc<FeatureConfig>> {
        self.features.get(name).map(|f| Arc::clone(&f.config))
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.features.contains_key(name)
    }

    /// Sorted names of all registered features.
    pub fn active_features(&self) -> Vec<String> {
        let mut names: Vec<String> = self.features.iter().map(|f| f.key().clone()).collect();
        names.sort();
        names
    }

    /// An already materialised DataObject.
    pub fn data_object(&self, feature: &str, key: &str) -> Option<DataObjectHandle> {
        let active = self.active(feature)?;
        let handle = active.data_objects.get(key).map(|h| h.clone());
        handle
    }

    fn active(&self, feature: &str) -> Option<Arc<ActiveFeature>> {
        self.features.get(feature).map(|f| Arc::clone(f.value()))
    }

    /// Run `component_key` with `payload` and everything routed from it.
    /// Returns the constructed node, `None` when nothing could be built.
    pub fn perform_step(
        &self,
        feature: &str,
        payload: &PropertyValue,
        component_key: &str,
        should_log: bool,
    ) -> Option<Box<dyn Component>> {
        self.perform_step_with_report(feature, payload, component_key, should_log).0
    }

    #[tracing::instrument(skip(self, payload))]
    pub fn perform_step_with_report(
        &self,
        feature: &str,
        payload: &PropertyValue,
        component_key: &str,
        should_log: bool,
    ) -> (Option<Box<dyn Component>>, CascadeReport) {
        let Some(active) = self.active(feature) else {
            debug!("feature not active");
            return (None, CascadeReport::empty(feature, component_key));
        };
        let started = Utc::now();
        let mut cascade = Cascade::new(self.max_cascade_steps);
        let node = self.step(&active, payload, component_key, should_log, &mut cascade);
        (node, self.finish(cascade, feature, component_key, started))
    }

    /// Follow `outputs` of the already executed `source_key`.
    pub fn complete_perform(
        &self,
        feature: &str,
        outputs: Outputs,
        source_key: &str,
        should_log: bool,
    ) -> CascadeReport {
        let Some(active) = self.active(feature) else {
            return CascadeReport::empty(feature, source_key);
        };
        let started = Utc::now();
        let mut cascade = Cascade::new(self.max_cascade_steps);
        self.follow_outputs(&active, outputs, source_key, should_log, &mut cascade);
        self.finish(cascade, feature, source_key, started)
    }

    /// Run every active feature's component named `trigger_key`, each with
    /// its own declared properties as payload.
    #[tracing::instrument(skip(self))]
    pub fn perform_trigger(&self, trigger_key: &str) -> Vec<Box<dyn Component>> {
        let mut features: Vec<Arc<ActiveFeature>> = self.features.iter().map(|f| Arc::clone(f.value())).collect();
        features.sort_by(|a, b| a.config.feature_name().cmp(b.config.feature_name()));

        let mut nodes = Vec::new();
        for active in features {
            let Some(def) = active.config.get_component_config_for_key(trigger_key) else {
                continue;
            };
            let payload = def.node.properties.clone();
            let started = Utc::now();
            let mut cascade = Cascade::new(self.max_cascade_steps);
            if let Some(node) = self.step(&active, &payload, trigger_key, false, &mut cascade) {
                nodes.push(node);
            }
            self.finish(cascade, active.config.feature_name(), trigger_key, started);
        }
        nodes
    }

    /// Inbound `perform_component`.
    pub fn on_perform_component_event(&self, msg: &ServerMessage) -> Option<Box<dyn Component>> {
        let event: PerformComponentEvent = match msg.parse() {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "ignoring perform_component");
                return None;
            }
        };
        let payload = event.payload_value();
        self.perform_step(&event.feature_name, &payload, &event.component_key, event.sample_flow)
    }

    /// Inbound `data_updated`. Returns whether a DataObject took the update.
    pub fn on_data_updated_event(&self, msg: &ServerMessage) -> bool {
        let event: DataUpdatedEvent = match msg.parse() {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "ignoring data_updated");
                return false;
            }
        };
        let Some(active) = self.active(&event.feature_name) else {
            warn!(feature = %event.feature_name, "data_updated for inactive feature");
            return false;
        };
        let scope = FeatureScope::new(self, &active, &PropertyValue::Null);
        let Some(handle) = scope.data_object(&event.key_name) else {
            warn!(feature = %event.feature_name, key = %event.key_name, "data_updated for unknown DataObject");
            return false;
        };
        handle.write().update_value(Value::Object(event.data));
        debug!(feature = %event.feature_name, key = %event.key_name, "DataObject updated");
        true
    }

    fn finish(&self, cascade: Cascade, feature: &str, trigger: &str, started: DateTime<Utc>) -> CascadeReport {
        let report = cascade.into_report(feature, trigger, started);
        if report.truncated {
            warn!(feature, trigger, budget = self.max_cascade_steps, "cascade stopped, step budget exhausted");
        }
        report.emit();
        report
    }

    fn step(
        &self,
        active: &ActiveFeature,
        payload: &PropertyValue,
        component_key: &str,
        should_log: bool,
        cascade: &mut Cascade,
    ) -> Option<Box<dyn Component>> {
        let feature = active.config.feature_name();
        let def = active.config.get_component_config_for_key(component_key)?;
        if !cascade.take_step() {
            return None;
        }
        let mut component = self.construct_component(active, def, payload)?;

        let started = Utc::now();
        let result = component.perform(payload, should_log);
        let finished = Utc::now();

        match result {
            Ok(outputs) => {
                if should_log {
                    info!(feature, component = component_key, ports = outputs.len(), "component performed");
                }
                cascade.records.push(StepRecord {
                    feature: feature.to_string(),
                    component: component_key.to_string(),
                    started,
                    finished,
                    ports: outputs.iter().map(|(port, _)| port.clone()).collect(),
                    error: None,
                });
                self.follow_outputs(active, outputs, component.key_name(), should_log, cascade);
            }
            Err(e) => {
                warn!(feature, component = component_key, error = %e, "component failed");
                cascade.records.push(StepRecord {
                    feature: feature.to_string(),
                    component: component_key.to_string(),
                    started,
                    finished,
                    ports: Vec::new(),
                    error: Some(e.to_string()),
                });
            }
        }
        Some(component)
    }

    fn follow_outputs(
        &self,
        active: &ActiveFeature,
        outputs: Outputs,
        source_key: &str,
        should_log: bool,
        cascade: &mut Cascade,
    ) {
        for (port, output) in outputs {
            let Some(targets) = active.config.get_outputs_for_component(source_key, &port) else {
                continue;
            };
            for target in targets {
                if self.step(active, &output, target, should_log, cascade).is_none() {
                    debug!(source = source_key, %port, %target, "routed step produced no node");
                }
            }
        }
    }

    fn provider_impl(&self, feature: &str, def: &ProviderDefinition, role: ProviderRole) -> Option<Arc<dyn Provider>> {
        let Some(provider) = self.registry.provider(def.type_name()) else {
            warn!(feature, provider = def.key_name(), type_name = def.type_name(), "no provider implementation for type");
            return None;
        };
        if provider.role() != role {
            warn!(feature, provider = def.key_name(), expected = ?role, "provider has the wrong role");
            return None;
        }
        Some(provider)
    }

    fn construct_component(
        &self,
        active: &ActiveFeature,
        def: &ComponentDefinition,
        payload: &PropertyValue,
    ) -> Option<Box<dyn Component>> {
        let config = &active.config;
        let feature = config.feature_name();
        let Some(provider_def) = config.provider_for_component(def) else {
            warn!(feature, component = def.key_name(), "no component provider in manifest");
            return None;
        };
        let provider = self.provider_impl(feature, provider_def, ProviderRole::Component)?;
        let scope = FeatureScope::new(self, active, payload);
        provider
            .provide(ProvideRequest {
                feature_name: feature,
                definition: &def.node,
                provider: provider_def,
                payload,
                source: &scope,
                registry: &self.registry,
                link: self.link.clone(),
            })
            .and_then(RuntimeNode::into_component)
    }

    fn construct_data_object(
        &self,
        scope: &FeatureScope<'_>,
        def: &DataObjectDefinition,
    ) -> Option<Box<dyn DataObject>> {
        let config = &scope.feature.config;
        let feature = config.feature_name();
        let Some(provider_def) = config.provider_for_data_object(def) else {
            warn!(feature, data_object = def.key_name(), "no data provider in manifest");
            return None;
        };
        let provider = self.provider_impl(feature, provider_def, ProviderRole::DataObject)?;
        provider
            .provide(ProvideRequest {
                feature_name: feature,
                definition: &def.node,
                provider: provider_def,
                payload: scope.payload,
                source: scope,
                registry: &self.registry,
                link: self.link.clone(),
            })
            .and_then(RuntimeNode::into_data_object)
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("features", &self.active_features())
            .field("max_cascade_steps", &self.max_cascade_steps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ChannelServerLink;
    use crate::message::{DATA_UPDATED, PERFORM_COMPONENT};
    use crate::node::{NodeError, NodeSeed};
    use crate::registry::TypeCatalogue;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every payload it sees, emits the payload on `ok`.
    #[derive(Debug)]
    struct Probe {
        key: String,
        props: PropertyValue,
        seen: Arc<Mutex<Vec<(String, PropertyValue)>>>,
    }

    impl Component for Probe {
        fn key_name(&self) -> &str {
            &self.key
        }
        fn feature_name(&self) -> &str {
            "test"
        }
        fn properties(&self) -> &PropertyValue {
            &self.props
        }
        fn perform(&mut self, payload: &PropertyValue, _should_log: bool) -> Result<Outputs, NodeError> {
            self.seen.lock().unwrap().push((self.key.clone(), payload.clone()));
            if self.props.get("fail").is_some() {
                return Err(NodeError::ExecutionFailed("probe".to_string()));
            }
            Ok(vec![("ok".to_string(), payload.clone())])
        }
    }

    type Seen = Arc<Mutex<Vec<(String, PropertyValue)>>>;

    fn orchestrator() -> (Orchestrator, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let probe_seen = Arc::clone(&seen);
        let registry = TypeRegistry::new();
        registry.build_mapping(TypeCatalogue::builtin().with_node("Probe", move |seed: NodeSeed| {
            Some(RuntimeNode::Component(Box::new(Probe {
                key: seed.key_name,
                props: seed.properties,
                seen: Arc::clone(&probe_seen),
            })))
        }));
        (Orchestrator::new(Arc::new(registry)), seen)
    }

    fn manifest(components: Value) -> FeatureConfig {
        FeatureConfig::from_value(
            "f",
            json!({
                "componentConfigs": components,
                "dataObjectConfigs": [
                    {"keyName": "profile", "typeName": "ValueDataObject", "props": {"value": {"tier": "gold"}}}
                ],
                "providerConfigs": [
                    {"keyName": "components", "typeName": "ComponentProvider"},
                    {"keyName": "data", "typeName": "ServerDataProvider"}
                ]
            }),
        )
        .unwrap()
    }

    fn keys(seen: &Seen) -> Vec<String> {
        seen.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
    }

    #[test]
    fn test_routed_step_runs_once_with_output_payload() {
        let (orch, seen) = orchestrator();
        orch.register(manifest(json!([
            {"keyName": "C1", "typeName": "Probe", "outputs": {"ok": ["C2"]}},
            {"keyName": "C2", "typeName": "Probe"}
        ])));

        let payload = PropertyValue::from(json!({"n": 1}));
        let (node, report) = orch.perform_step_with_report("f", &payload, "C1", false);
        assert_eq!(node.unwrap().key_name(), "C1");
        assert_eq!(keys(&seen), vec!["C1", "C2"]);
        assert_eq!(seen.lock().unwrap()[1].1, payload);
        assert_eq!(report.executed(), vec!["C1", "C2"]);
        assert!(!report.truncated);
    }

    #[test]
    fn test_missing_target_does_not_affect_source() {
        let (orch, seen) = orchestrator();
        orch.register(manifest(json!([
            {"keyName": "C1", "typeName": "Probe", "outputs": {"ok": ["C2"]}}
        ])));
        let node = orch.perform_step("f", &PropertyValue::Null, "C1", false);
        assert!(node.is_some());
        assert_eq!(keys(&seen), vec!["C1"]);
    }

    #[test]
    fn test_unknown_component_has_no_side_effects() {
        let (orch, seen) = orchestrator();
        orch.register(manifest(json!([{"keyName": "C1", "typeName": "Probe"}])));
        assert!(orch.perform_step("f", &PropertyValue::Null, "nope", false).is_none());
        assert!(orch.perform_step("other", &PropertyValue::Null, "C1", false).is_none());
        assert!(seen.lock().unwrap().is_empty());
        assert!(orch.data_object("f", "profile").is_none());
    }

    #[test]
    fn test_cycle_is_cut_by_step_budget() {
        let (orch, seen) = orchestrator();
        let orch = orch.with_max_cascade_steps(5);
        orch.register(manifest(json!([
            {"keyName": "A", "typeName": "Probe", "outputs": {"ok": ["B"]}},
            {"keyName": "B", "typeName": "Probe", "outputs": {"ok": ["A"]}}
        ])));
        let (node, report) = orch.perform_step_with_report("f", &PropertyValue::Null, "A", false);
        assert!(node.is_some());
        assert_eq!(keys(&seen).len(), 5);
        assert!(report.truncated);
    }

    #[test]
    fn test_retrigger_repeats_same_invocations() {
        let (orch, seen) = orchestrator();
        orch.register(manifest(json!([
            {"keyName": "C1", "typeName": "Probe", "outputs": {"ok": ["C2", "C3"]}},
            {"keyName": "C2", "typeName": "Probe"},
            {"keyName": "C3", "typeName": "Probe"}
        ])));
        let payload = PropertyValue::from("x");
        orch.perform_step("f", &payload, "C1", false);
        let first = keys(&seen);
        seen.lock().unwrap().clear();
        orch.perform_step("f", &payload, "C1", false);
        assert_eq!(keys(&seen), first);
    }

    #[test]
    fn test_failed_component_stops_its_branch() {
        let (orch, seen) = orchestrator();
        orch.register(manifest(json!([
            {"keyName": "C1", "typeName": "Probe", "props": {"fail": true}, "outputs": {"ok": ["C2"]}},
            {"keyName": "C2", "typeName": "Probe"}
        ])));
        let (node, report) = orch.perform_step_with_report("f", &PropertyValue::Null, "C1", false);
        assert!(node.is_some());
        assert_eq!(keys(&seen), vec!["C1"]);
        assert!(report.records[0].error.is_some());
    }

    #[test]
    fn test_trigger_uses_declared_properties() {
        let (orch, seen) = orchestrator();
        orch.register(manifest(json!([
            {"keyName": "start", "typeName": "Probe", "props": {"greeting": "hi"}}
        ])));
        let nodes = orch.perform_trigger("start");
        assert_eq!(nodes.len(), 1);
        assert_eq!(
            seen.lock().unwrap()[0].1,
            PropertyValue::from(json!({"greeting": "hi"}))
        );
        assert!(orch.perform_trigger("absent").is_empty());
    }

    #[test]
    fn test_data_object_tokens_and_updates_share_one_instance() {
        let (orch, seen) = orchestrator();
        orch.register(manifest(json!([
            {"keyName": "C1", "typeName": "Probe", "props": {"label": "tier {profile.tier}"}, "outputs": {"ok": ["C2"]}},
            {"keyName": "C2", "typeName": "RelayComponent", "props": {"output": "{profile.tier}"}}
        ])));
        let node = orch.perform_step("f", &PropertyValue::Null, "C1", false).unwrap();
        assert_eq!(node.properties().get("label"), Some(&PropertyValue::from("tier gold")));
        let first = orch.data_object("f", "profile").unwrap();

        let update = ServerMessage::new(
            DATA_UPDATED,
            json!({"featurename": "f", "keyname": "profile", "data": {"tier": "platinum"}})
                .as_object()
                .unwrap()
                .clone(),
        );
        assert!(orch.on_data_updated_event(&update));
        assert!(orch.data_object("f", "profile").unwrap().same_instance(&first));

        let node = orch.perform_step("f", &PropertyValue::Null, "C1", false).unwrap();
        assert_eq!(node.properties().get("label"), Some(&PropertyValue::from("tier platinum")));
        assert_eq!(keys(&seen), vec!["C1", "C1"]);
    }

    #[test]
    fn test_re_register_resets_data_objects() {
        let (orch, _) = orchestrator();
        orch.register(manifest(json!([])));
        let update = ServerMessage::new(
            DATA_UPDATED,
            json!({"featurename": "f", "keyname": "profile", "data": {}}).as_object().unwrap().clone(),
        );
        assert!(orch.on_data_updated_event(&update));
        assert!(orch.data_object("f", "profile").is_some());
        orch.register(manifest(json!([])));
        assert!(orch.data_object("f", "profile").is_none());
    }

    #[test]
    fn test_perform_component_event_and_server_delegate() {
        let (link, mut rx) = ChannelServerLink::new();
        let (orch, seen) = orchestrator();
        let orch = orch.with_link(Arc::new(link));
        orch.register(manifest(json!([
            {"keyName": "C1", "typeName": "Probe", "outputs": {"ok": ["remote"]}},
            {"keyName": "remote", "owner": "server"}
        ])));

        let msg = ServerMessage::new(
            PERFORM_COMPONENT,
            json!({"featurename": "f", "component_keyname": "C1", "payload_data": {"n": 2}, "sample_flow": false})
                .as_object()
                .unwrap()
                .clone(),
        );
        assert!(orch.on_perform_component_event(&msg).is_some());
        assert_eq!(keys(&seen), vec!["C1"]);

        let outbound = rx.try_recv().unwrap();
        assert_eq!(outbound.name(), PERFORM_COMPONENT);
        assert_eq!(outbound.get("component_keyname"), Some(&json!("remote")));
        assert_eq!(outbound.get("payload_data"), Some(&json!({"n": 2})));
    }

    #[test]
    fn test_malformed_events_are_ignored() {
        let (orch, _) = orchestrator();
        let msg = ServerMessage::new(PERFORM_COMPONENT, serde_json::Map::new());
        assert!(orch.on_perform_component_event(&msg).is_none());
        let msg = ServerMessage::new(DATA_UPDATED, serde_json::Map::new());
        assert!(!orch.on_data_updated_event(&msg));
    }

    #[test]
    fn test_dangling_provider_key_still_builds() {
        let (orch, seen) = orchestrator();
        orch.register(manifest(json!([
            {"keyName": "C1", "typeName": "Probe", "providerKey": "ghost", "outputs": {"ok": ["C2"]}},
            {"keyName": "C2", "typeName": "Probe", "providerKey": "components"}
        ])));
        let node = orch.perform_step("f", &PropertyValue::Null, "C1", false);
        assert_eq!(node.unwrap().key_name(), "C1");
        assert_eq!(keys(&seen), vec!["C1", "C2"]);
    }

    #[test]
    fn test_no_provider_means_no_node() {
        let (orch, seen) = orchestrator();
        orch.register(
            FeatureConfig::from_value("f", json!({"componentConfigs": [{"keyName": "C1", "typeName": "Probe"}]}))
                .unwrap(),
        );
        assert!(orch.perform_step("f", &PropertyValue::Null, "C1", false).is_none());
        assert!(seen.lock().unwrap().is_empty());
    }
}
