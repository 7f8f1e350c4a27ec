//! Persisted dynamic state - channels, credentials and prompt presets
//!
//! The engine owns the schema; synchronizing it to durable storage is the
//! embedder's concern, exercised through the [`StateStore`] seam after every
//! registry or pool mutation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

use crate::error::Result;
use crate::pool::CredentialRecord;
use crate::registry::ChannelKind;

/// Full serialized engine state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,

    /// Credential pools without a matching channel record, such as the
    /// builtin first-party channel whose definition lives in static config
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub standalone_credentials: BTreeMap<String, Vec<CredentialRecord>>,

    /// Named prompt presets, opaque to the engine
    #[serde(default)]
    pub prompts: BTreeMap<String, String>,
}

/// One channel with its ordered credential list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub name: String,
    pub kind: ChannelKind,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub credentials: Vec<CredentialRecord>,
}

fn default_true() -> bool {
    true
}

/// Storage seam for the persisted state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved snapshot; `None` if nothing was persisted yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Persist a snapshot, replacing any previous one.
    async fn save(&self, snapshot: &StateSnapshot) -> Result<()>;
}

/// Pretty-printed JSON file store
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = serde_json::from_str(&raw)?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let raw = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&self.path, raw).await?;
        debug!(path = %self.path.display(), channels = snapshot.channels.len(), "Saved state");
        Ok(())
    }
}

/// Store that persists nothing, for embedders handling persistence themselves
pub struct NullStore;

#[async_trait]
impl StateStore for NullStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        Ok(None)
    }

    async fn save(&self, _snapshot: &StateSnapshot) -> Result<()> {
        Ok(())
    }
}
