//! Dispatch engine - channel/credential failover orchestration
//!
//! For each logical request the engine resolves a candidate channel order,
//! rotates through each channel's active credentials, performs the wire call,
//! reports the outcome back to the pool and decides between retrying,
//! failing over and surfacing a terminal error.

use base64::{engine::general_purpose::STANDARD, Engine};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{
    self,
    sse::{SseEvent, SseParser},
    GenerateRequest, GeneratedImage, ImageRef, WireRequest,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::persist::{ChannelRecord, NullStore, StateSnapshot, StateStore};
use crate::pool::{
    CredentialInfo, CredentialKind, CredentialLease, CredentialPool, Threshold,
};
use crate::registry::{Channel, ChannelKind, ChannelRegistry};

/// The orchestrator owning channel registry, credential pools and HTTP client
pub struct DispatchEngine {
    config: EngineConfig,
    registry: Arc<ChannelRegistry>,
    pool: Arc<CredentialPool>,
    store: Arc<dyn StateStore>,
    client: reqwest::Client,
    prompts: RwLock<BTreeMap<String, String>>,
}

impl DispatchEngine {
    /// Create an engine that persists nothing.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(NullStore))
    }

    /// Create an engine backed by the given state store.
    pub fn with_store(config: EngineConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        config.validate()?;
        let overall = config
            .dispatch
            .request_timeout_ms
            .max(config.dispatch.stream_timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(overall))
            .build()
            .map_err(|e| {
                EngineError::Validation(format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            config,
            registry: Arc::new(ChannelRegistry::new()),
            pool: Arc::new(CredentialPool::new()),
            store,
            client,
            prompts: RwLock::new(BTreeMap::new()),
        })
    }

    /// Create an engine from a store and restore its last saved state.
    pub async fn load(config: EngineConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        let engine = Self::with_store(config, store)?;
        engine.restore_state().await?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    /// Generate an image for a logical request.
    ///
    /// Two-level bounded failover: within a channel, at most as many
    /// credential draws as the channel had active credentials when the loop
    /// started; across channels, each candidate is visited once. A
    /// non-retryable failure short-circuits everything, since it indicates
    /// the request itself is the problem.
    pub async fn generate(&self, request: GenerateRequest) -> Result<GeneratedImage> {
        if request.prompt.trim().is_empty() {
            return Err(EngineError::Validation("prompt cannot be empty".to_string()));
        }

        let request_id = Uuid::new_v4();
        let candidates = self.candidate_channels(request.channel.as_deref())?;
        info!(
            request_id = %request_id,
            candidates = candidates.len(),
            pinned = request.channel.is_some(),
            "Dispatching generation request"
        );

        let mut attempts = 0usize;
        let mut last_failure: Option<EngineError> = None;
        let mut state_dirty = false;

        for channel in &candidates {
            // Bound draws by the count observed now, so credentials flapping
            // between active and disabled cannot keep this loop alive.
            let draws = self.pool.active_count(&channel.name);
            if draws == 0 {
                debug!(
                    request_id = %request_id,
                    channel = %channel.name,
                    "No active credentials, failing over to next channel"
                );
                last_failure
                    .get_or_insert_with(|| EngineError::NoAvailableCredential(channel.name.clone()));
                continue;
            }

            for _ in 0..draws {
                let lease = match self.pool.acquire(&channel.name) {
                    Ok(lease) => lease,
                    Err(_) => break,
                };
                attempts += 1;
                debug!(
                    request_id = %request_id,
                    channel = %channel.name,
                    credential = %lease.masked(),
                    attempt = attempts,
                    "Attempting backend call"
                );

                match self.attempt(channel, &lease, &request).await {
                    Ok(bytes) => {
                        self.pool.report_outcome(&lease, true);
                        self.persist().await;
                        info!(
                            request_id = %request_id,
                            channel = %channel.name,
                            attempts = attempts,
                            size = bytes.len(),
                            "Generation succeeded"
                        );
                        return Ok(GeneratedImage {
                            bytes,
                            channel: channel.name.clone(),
                        });
                    }
                    Err(err) if err.is_retryable() => {
                        self.pool.report_outcome(&lease, false);
                        state_dirty = true;
                        warn!(
                            request_id = %request_id,
                            channel = %channel.name,
                            credential = %lease.masked(),
                            error = %err,
                            "Attempt failed, rotating"
                        );
                        last_failure = Some(err);
                        tokio::time::sleep(Duration::from_millis(
                            self.config.dispatch.retry_delay_ms,
                        ))
                        .await;
                    }
                    Err(err) => {
                        self.pool.report_outcome(&lease, false);
                        self.persist().await;
                        warn!(
                            request_id = %request_id,
                            channel = %channel.name,
                            error = %err,
                            "Non-retryable failure, surfacing to caller"
                        );
                        return Err(err);
                    }
                }
            }
        }

        if state_dirty {
            self.persist().await;
        }
        Err(EngineError::AllChannelsExhausted {
            attempts,
            channels: candidates.len(),
            last: last_failure
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no enabled channel had an available credential".to_string()),
        })
    }

    /// Candidate channel order for a request.
    ///
    /// An explicit channel name pins the order to that single channel, even
    /// when it is administratively disabled. Automatic selection yields the
    /// builtin first-party channel followed by enabled custom channels in
    /// registration order.
    fn candidate_channels(&self, hint: Option<&str>) -> Result<Vec<Channel>> {
        if let Some(name) = hint {
            if let Some(channel) = self.registry.get(name) {
                return Ok(vec![channel]);
            }
            if name == self.config.first_party.channel {
                if let Some(builtin) = self.builtin_channel() {
                    return Ok(vec![builtin]);
                }
            }
            return Err(EngineError::ChannelNotFound(name.to_string()));
        }

        let mut candidates = Vec::new();
        if let Some(builtin) = self.builtin_channel() {
            if self.config.first_party.enabled
                && self.registry.get(&builtin.name).is_none()
            {
                candidates.push(builtin);
            }
        }
        candidates.extend(self.registry.enabled_channels());
        Ok(candidates)
    }

    /// The builtin first-party channel synthesized from static config.
    fn builtin_channel(&self) -> Option<Channel> {
        let endpoint = self.config.first_party.endpoint.clone()?;
        Some(Channel {
            name: self.config.first_party.channel.clone(),
            kind: ChannelKind::NativeGenerate,
            endpoint,
            model: None,
            enabled: self.config.first_party.enabled,
            streaming: false,
        })
    }

    /// Default channel for a credential per prefix classification.
    pub fn default_channel_for(&self, secret: &str) -> Option<String> {
        match CredentialKind::classify(secret) {
            CredentialKind::FirstParty if self.config.first_party.enabled => {
                Some(self.config.first_party.channel.clone())
            }
            CredentialKind::FirstParty => None,
            CredentialKind::ThirdPartyCompatible => self.config.compatible_channel.clone(),
        }
    }

    /// One encode-send-decode attempt against a single channel/credential,
    /// bounded by the format-appropriate timeout. Dropping the in-flight
    /// future on timeout also drops the network response, releasing the
    /// connection.
    async fn attempt(
        &self,
        channel: &Channel,
        lease: &CredentialLease,
        request: &GenerateRequest,
    ) -> Result<Vec<u8>> {
        let wire = adapter::encode(channel, lease.secret(), request)?;
        let timeout = Duration::from_millis(if wire.streaming {
            self.config.dispatch.stream_timeout_ms
        } else {
            self.config.dispatch.request_timeout_ms
        });

        let call = async {
            match self.call(channel, wire).await? {
                ImageRef::Base64(b64) => decode_base64(&channel.name, &b64),
                ImageRef::Url(url) => self.download(&channel.name, &url).await,
            }
        };

        tokio::time::timeout(timeout, call).await.map_err(|_| {
            EngineError::retryable(
                &channel.name,
                format!("request timed out after {}ms", timeout.as_millis()),
            )
        })?
    }

    async fn call(&self, channel: &Channel, wire: WireRequest) -> Result<ImageRef> {
        let mut builder = self.client.post(&wire.url).json(&wire.body);
        if let Some(token) = &wire.bearer {
            builder = builder.bearer_auth(token);
        }
        let streaming = wire.streaming;

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::retryable(&channel.name, format!("transport error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(adapter::classify_status(&channel.name, status, &body));
        }

        if streaming {
            self.consume_stream(channel, response).await
        } else {
            let body: serde_json::Value = response.json().await.map_err(|e| {
                EngineError::retryable(&channel.name, format!("malformed response body: {}", e))
            })?;
            adapter::decode(channel, &body)
        }
    }

    /// Consume SSE chunks until the first image payload or the terminal
    /// marker.
    async fn consume_stream(
        &self,
        channel: &Channel,
        response: reqwest::Response,
    ) -> Result<ImageRef> {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                EngineError::retryable(&channel.name, format!("stream error: {}", e))
            })?;
            for event in parser.push(&chunk) {
                match event {
                    SseEvent::Done => {
                        return Err(EngineError::retryable(
                            &channel.name,
                            "stream ended without image payload",
                        ))
                    }
                    SseEvent::Data(payload) => {
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&payload) {
                            if let Some(found) = adapter::try_decode(channel, &value) {
                                debug!(channel = %channel.name, "Extracted image from stream");
                                return Ok(found);
                            }
                        }
                    }
                }
            }
        }

        Err(EngineError::retryable(
            &channel.name,
            "stream closed without image payload",
        ))
    }

    /// Fetch an image the backend returned by URL.
    async fn download(&self, channel: &str, url: &str) -> Result<Vec<u8>> {
        debug!(channel = %channel, url = %adapter::truncate(url, 100), "Downloading image payload");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::retryable(channel, format!("image download failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::retryable(
                channel,
                format!("image download returned {}", status),
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::retryable(channel, format!("image download failed: {}", e)))?;
        Ok(bytes.to_vec())
    }

    // ------------------------------------------------------------------
    // Administrative surface
    // ------------------------------------------------------------------

    pub async fn add_channel(&self, channel: Channel) -> Result<()> {
        self.registry.add_channel(channel)?;
        self.persist().await;
        Ok(())
    }

    /// Remove a channel and its credential pool. In-flight requests that
    /// already resolved the channel complete against their cloned copy.
    pub async fn remove_channel(&self, name: &str) -> Result<()> {
        self.registry.remove_channel(name)?;
        self.pool.remove_channel(name);
        self.persist().await;
        Ok(())
    }

    pub async fn set_channel_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.registry.set_enabled(name, enabled)?;
        self.persist().await;
        Ok(())
    }

    pub async fn set_channel_streaming(&self, name: &str, streaming: bool) -> Result<()> {
        self.registry.set_streaming(name, streaming)?;
        self.persist().await;
        Ok(())
    }

    pub async fn update_channel_model(&self, name: &str, model: &str) -> Result<()> {
        self.registry.update_model(name, model)?;
        self.persist().await;
        Ok(())
    }

    pub fn list_channels(&self) -> Vec<Channel> {
        self.registry.list()
    }

    /// Add credentials to a channel's pool. The channel must be registered or
    /// be the builtin first-party channel.
    pub async fn add_credentials(&self, channel: &str, values: &[String]) -> Result<usize> {
        if self.registry.get(channel).is_none() && channel != self.config.first_party.channel {
            return Err(EngineError::ChannelNotFound(channel.to_string()));
        }
        let added = self.pool.add_credentials(channel, values);
        if added > 0 {
            self.persist().await;
        }
        Ok(added)
    }

    pub fn list_credentials(&self, channel: &str) -> Vec<CredentialInfo> {
        self.pool.list(channel)
    }

    pub async fn remove_credential(&self, channel: &str, index: usize) -> Result<()> {
        self.pool.remove_credential(channel, index)?;
        self.persist().await;
        Ok(())
    }

    pub async fn set_threshold(
        &self,
        channel: &str,
        index: usize,
        threshold: Threshold,
    ) -> Result<()> {
        self.pool.set_threshold(channel, index, threshold)?;
        self.persist().await;
        Ok(())
    }

    /// Reset one credential, or every credential in the channel.
    pub async fn reset_failures(&self, channel: &str, index: Option<usize>) -> Result<usize> {
        let changed = self.pool.reset_failures(channel, index)?;
        if changed > 0 {
            self.persist().await;
        }
        Ok(changed)
    }

    /// Reset failure counters across every channel.
    pub async fn reset_all_failures(&self) -> usize {
        let changed = self.pool.reset_all();
        if changed > 0 {
            self.persist().await;
        }
        changed
    }

    // ------------------------------------------------------------------
    // Prompt presets (opaque passthrough)
    // ------------------------------------------------------------------

    pub fn prompts(&self) -> BTreeMap<String, String> {
        self.prompts.read().clone()
    }

    pub async fn add_prompt(&self, name: &str, prompt: &str) {
        self.prompts
            .write()
            .insert(name.to_string(), prompt.to_string());
        self.persist().await;
    }

    pub async fn delete_prompt(&self, name: &str) -> bool {
        let removed = self.prompts.write().remove(name).is_some();
        if removed {
            self.persist().await;
        }
        removed
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Serialize the full dynamic state.
    pub fn snapshot(&self) -> StateSnapshot {
        let channels: Vec<ChannelRecord> = self
            .registry
            .list()
            .into_iter()
            .map(|c| ChannelRecord {
                credentials: self.pool.export(&c.name),
                name: c.name,
                kind: c.kind,
                endpoint: c.endpoint,
                model: c.model,
                enabled: c.enabled,
                streaming: c.streaming,
            })
            .collect();

        let registered: std::collections::HashSet<String> =
            channels.iter().map(|c| c.name.clone()).collect();
        let standalone_credentials = self
            .pool
            .channels()
            .into_iter()
            .filter(|name| !registered.contains(name))
            .map(|name| {
                let records = self.pool.export(&name);
                (name, records)
            })
            .filter(|(_, records)| !records.is_empty())
            .collect();

        StateSnapshot {
            channels,
            standalone_credentials,
            prompts: self.prompts.read().clone(),
        }
    }

    /// Apply a previously saved snapshot.
    pub async fn restore_state(&self) -> Result<()> {
        let Some(snapshot) = self.store.load().await? else {
            return Ok(());
        };
        for record in snapshot.channels {
            let channel = Channel {
                name: record.name.clone(),
                kind: record.kind,
                endpoint: record.endpoint,
                model: record.model,
                enabled: record.enabled,
                streaming: record.streaming,
            };
            if let Err(e) = self.registry.add_channel(channel) {
                warn!(channel = %record.name, error = %e, "Skipping invalid persisted channel");
                continue;
            }
            self.pool.restore(&record.name, record.credentials);
        }
        for (name, records) in snapshot.standalone_credentials {
            self.pool.restore(&name, records);
        }
        *self.prompts.write() = snapshot.prompts;
        info!(channels = self.registry.list().len(), "Restored persisted state");
        Ok(())
    }

    /// Best-effort save after a state mutation.
    async fn persist(&self) {
        let snapshot = self.snapshot();
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(error = %e, "Failed to persist engine state");
        }
    }
}

/// Decode a base64 image payload, tolerating embedded whitespace.
fn decode_base64(channel: &str, b64: &str) -> Result<Vec<u8>> {
    let cleaned: String = b64.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| EngineError::retryable(channel, format!("unparseable base64 payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_with_newlines() {
        let decoded = decode_base64("c", "aGVs\nbG8=").unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn test_decode_base64_invalid() {
        let err = decode_base64("c", "!!!not-base64!!!").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_default_channel_for() {
        let mut config = EngineConfig::default();
        config.compatible_channel = Some("proxy".to_string());
        let engine = DispatchEngine::new(config).unwrap();

        assert_eq!(
            engine.default_channel_for("sk-abc").as_deref(),
            Some("proxy")
        );
        assert_eq!(
            engine.default_channel_for("AIzaXyz").as_deref(),
            Some("google")
        );
    }

    #[test]
    fn test_default_channel_respects_disabled_first_party() {
        let mut config = EngineConfig::default();
        config.first_party.enabled = false;
        let engine = DispatchEngine::new(config).unwrap();
        assert_eq!(engine.default_channel_for("AIzaXyz"), None);
    }
}
