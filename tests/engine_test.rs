use std::fs;
use std::sync::Arc;

use proton::host::{FeatureToggle, InactiveElementRegistry, StaticExperiments};
use proton::message::{DATA_UPDATED, PERFORM_COMPONENT, SYNC_FEATURES};
use proton::settings::ProtonSettings;
use proton::sync::DirectoryManifestFetcher;
use proton::{ChannelServerLink, Engine, IncomingHandler, ServerMessage, SyncPhase, TypeCatalogue};
use serde_json::{Map, Value, json};
use tempfile::TempDir;

const GREETING: &str = r#"{
    "componentConfigs": [
        {
            "keyName": "start",
            "typeName": "RelayComponent",
            "props": {"output": "Hi {payload.name} from {profile.city}"},
            "outputs": {"next": ["notify"]}
        },
        {"keyName": "notify", "owner": "server"}
    ],
    "dataObjectConfigs": [
        {"keyName": "profile", "typeName": "ValueDataObject", "props": {"value": {"city": "Bergen"}}}
    ],
    "providerConfigs": [
        {"keyName": "components", "typeName": "ComponentProvider"},
        {"keyName": "data", "typeName": "ServerDataProvider"}
    ]
}"#;

fn props(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_greeting_feature_syncs_and_delegates_to_server() {
    let dir = TempDir::new().unwrap();
    let manifests = dir.path().join("manifests");
    fs::create_dir_all(manifests.join("greeting")).unwrap();
    fs::write(manifests.join("greeting").join("2.json"), GREETING).unwrap();

    let settings = ProtonSettings {
        cache_dir: dir.path().join("cache"),
        ..ProtonSettings::default()
    };
    let (link, mut outbound) = ChannelServerLink::new();
    let elements = Arc::new(InactiveElementRegistry::new());
    elements.park("open", "greeting");

    let engine = Engine::bootstrap(
        settings,
        TypeCatalogue::builtin(),
        Arc::new(link),
        Arc::new(StaticExperiments::new(vec![
            FeatureToggle::enabled("greeting", "2"),
            FeatureToggle::disabled("legacy", "1"),
        ])),
        elements.clone(),
        Some(Arc::new(DirectoryManifestFetcher::new(&manifests))),
    )
    .unwrap();

    assert!(engine.start_sync());
    engine.ready_reported().await.unwrap();
    assert_eq!(engine.phase(), SyncPhase::PendingSync);

    let ready = outbound.try_recv().unwrap();
    assert_eq!(ready.name(), SYNC_FEATURES);
    assert_eq!(ready.get("proton_ready_list"), Some(&json!({"greeting": "2"})));
    assert!(dir.path().join("cache").join("greeting_2.json").exists());

    engine.handle_incoming(ServerMessage::active_features(["greeting"]));
    assert_eq!(engine.phase(), SyncPhase::Synced);
    assert_eq!(engine.orchestrator().active_features(), vec!["greeting"]);
    assert!(!elements.is_inactive("open", "greeting"));

    engine.handle_incoming(ServerMessage::new(
        DATA_UPDATED,
        props(json!({"featurename": "greeting", "keyname": "profile", "data": {"city": "Oslo"}})),
    ));

    engine.handle_incoming(ServerMessage::new(
        PERFORM_COMPONENT,
        props(json!({
            "featurename": "greeting",
            "component_keyname": "start",
            "payload_data": {"name": "Ann"}
        })),
    ));

    let delegated = outbound.try_recv().unwrap();
    assert_eq!(delegated.name(), PERFORM_COMPONENT);
    assert_eq!(delegated.get("featurename"), Some(&json!("greeting")));
    assert_eq!(delegated.get("component_keyname"), Some(&json!("notify")));
    assert_eq!(delegated.get("payload_data"), Some(&json!({"value": "Hi Ann from Oslo"})));
    assert!(outbound.try_recv().is_err());

    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_second_start_uses_the_cache() {
    let dir = TempDir::new().unwrap();
    let manifests = dir.path().join("manifests");
    fs::create_dir_all(manifests.join("greeting")).unwrap();
    fs::write(manifests.join("greeting").join("2.json"), GREETING).unwrap();

    let settings = ProtonSettings {
        cache_dir: dir.path().join("cache"),
        ..ProtonSettings::default()
    };
    let experiments = Arc::new(StaticExperiments::new(vec![FeatureToggle::enabled("greeting", "2")]));

    for round in 0..2 {
        let (link, mut outbound) = ChannelServerLink::new();
        let engine = Engine::bootstrap(
            settings.clone(),
            TypeCatalogue::builtin(),
            Arc::new(link),
            experiments.clone(),
            Arc::new(InactiveElementRegistry::new()),
            Some(Arc::new(DirectoryManifestFetcher::new(&manifests))),
        )
        .unwrap();
        assert!(engine.start_sync());
        engine.ready_reported().await.unwrap();
        assert_eq!(
            outbound.try_recv().unwrap().get("proton_ready_list"),
            Some(&json!({"greeting": "2"}))
        );

        if round == 0 {
            // the second engine must not need the manifest server
            fs::remove_dir_all(&manifests).unwrap();
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_listen_routes_inbound_messages() {
    let dir = TempDir::new().unwrap();
    let manifests = dir.path().join("manifests");
    fs::create_dir_all(manifests.join("greeting")).unwrap();
    fs::write(manifests.join("greeting").join("2.json"), GREETING).unwrap();

    let (link, mut outbound) = ChannelServerLink::new();
    let engine = Arc::new(
        Engine::bootstrap(
            ProtonSettings {
                cache_dir: dir.path().join("cache"),
                ..ProtonSettings::default()
            },
            TypeCatalogue::builtin(),
            Arc::new(link),
            Arc::new(StaticExperiments::new(vec![FeatureToggle::enabled("greeting", "2")])),
            Arc::new(InactiveElementRegistry::new()),
            Some(Arc::new(DirectoryManifestFetcher::new(&manifests))),
        )
        .unwrap(),
    );
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel();
    engine.listen(inbound_rx);

    assert!(engine.start_sync());
    engine.ready_reported().await.unwrap();
    assert_eq!(outbound.try_recv().unwrap().name(), SYNC_FEATURES);

    inbound_tx.send(ServerMessage::active_features(["greeting"])).unwrap();
    engine.wait_synced().await;
    assert!(engine.orchestrator().is_active("greeting"));
    engine.shutdown();
}
