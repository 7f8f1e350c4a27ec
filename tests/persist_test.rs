//! State persistence round-trips through the JSON file store

use std::sync::Arc;

use image_dispatch::{
    Channel, ChannelKind, DispatchEngine, EngineConfig, JsonFileStore, StateStore, Threshold,
};

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.first_party.enabled = false;
    config
}

fn chat_channel(name: &str) -> Channel {
    Channel {
        name: name.to_string(),
        kind: ChannelKind::ChatCompletions,
        endpoint: "https://api.example.com/v1/chat/completions".to_string(),
        model: Some("image-model".to_string()),
        enabled: true,
        streaming: true,
    }
}

#[tokio::test]
async fn state_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&state_path));

    {
        let engine = DispatchEngine::with_store(config(), store.clone()).unwrap();
        engine.add_channel(chat_channel("proxy")).await.unwrap();
        engine
            .add_credentials(
                "proxy",
                &["sk-first".to_string(), "sk-second".to_string()],
            )
            .await
            .unwrap();
        engine
            .set_threshold("proxy", 1, Threshold::Unlimited)
            .await
            .unwrap();
        engine.set_channel_enabled("proxy", false).await.unwrap();
        engine.add_prompt("fox", "a red fox in the snow").await;
    }

    let restored = DispatchEngine::load(config(), store).await.unwrap();

    let channels = restored.list_channels();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].name, "proxy");
    assert!(!channels[0].enabled);
    assert!(channels[0].streaming);
    assert_eq!(channels[0].model.as_deref(), Some("image-model"));

    let creds = restored.list_credentials("proxy");
    assert_eq!(creds.len(), 2);
    assert_eq!(creds[1].threshold, Threshold::Unlimited);

    let prompts = restored.prompts();
    assert_eq!(prompts.get("fox").map(String::as_str), Some("a red fox in the snow"));
}

#[tokio::test]
async fn unlimited_threshold_persists_as_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&state_path));

    let engine = DispatchEngine::with_store(config(), store).unwrap();
    engine.add_channel(chat_channel("proxy")).await.unwrap();
    engine
        .add_credentials("proxy", &["sk-one".to_string()])
        .await
        .unwrap();
    engine
        .set_threshold("proxy", 0, Threshold::Unlimited)
        .await
        .unwrap();

    let raw = tokio::fs::read_to_string(&state_path).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        value["channels"][0]["credentials"][0]["max_errors"],
        serde_json::json!(-1)
    );
    // Secrets are stored in full; masking only applies to listings.
    assert_eq!(
        value["channels"][0]["credentials"][0]["value"],
        serde_json::json!("sk-one")
    );
}

#[tokio::test]
async fn standalone_first_party_credentials_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&state_path));

    let mut cfg = EngineConfig::default();
    cfg.first_party.endpoint =
        Some("https://g.example.com/v1beta/models/img:generateContent".to_string());

    {
        let engine = DispatchEngine::with_store(cfg.clone(), store.clone()).unwrap();
        engine
            .add_credentials("google", &["AIzaKeyOne".to_string()])
            .await
            .unwrap();
    }

    let restored = DispatchEngine::load(cfg, store).await.unwrap();
    // Builtin channel has no registry record but its pool survives.
    assert!(restored.list_channels().is_empty());
    let creds = restored.list_credentials("google");
    assert_eq!(creds.len(), 1);
    assert_eq!(creds[0].masked, "AIzaKeyO...");
}

#[tokio::test]
async fn missing_state_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> =
        Arc::new(JsonFileStore::new(dir.path().join("never-written.json")));
    let engine = DispatchEngine::load(config(), store).await.unwrap();
    assert!(engine.list_channels().is_empty());
}

#[tokio::test]
async fn disabled_state_is_rederived_not_trusted() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    tokio::fs::write(
        &state_path,
        serde_json::json!({
            "channels": [{
                "name": "proxy",
                "kind": "chat_completions",
                "endpoint": "https://api.example.com/v1/chat/completions",
                "model": "image-model",
                "credentials": [
                    {"value": "sk-dead", "error_count": 5, "max_errors": 5},
                    {"value": "sk-live", "error_count": 2, "max_errors": 5}
                ]
            }]
        })
        .to_string(),
    )
    .await
    .unwrap();

    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&state_path));
    let restored = DispatchEngine::load(config(), store).await.unwrap();
    let creds = restored.list_credentials("proxy");
    assert!(!creds[0].active);
    assert!(creds[1].active);
}
