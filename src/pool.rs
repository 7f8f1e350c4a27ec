//! Per-channel credential pools with failure tracking and round-robin rotation

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Prefix marking a third-party-compatible credential
pub const COMPATIBLE_PREFIX: &str = "sk-";

/// Coarse credential classification by prefix convention.
///
/// Selects the default channel when a request does not pin one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    FirstParty,
    ThirdPartyCompatible,
}

impl CredentialKind {
    pub fn classify(secret: &str) -> Self {
        if secret.starts_with(COMPATIBLE_PREFIX) {
            CredentialKind::ThirdPartyCompatible
        } else {
            CredentialKind::FirstParty
        }
    }
}

/// Consecutive-failure budget before a credential is auto-disabled.
///
/// Persisted as a plain integer with `-1` meaning unlimited, matching the
/// legacy on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    Limit(u32),
    Unlimited,
}

impl Threshold {
    pub const DEFAULT: Threshold = Threshold::Limit(5);

    /// Whether `failures` consecutive failures exhaust this budget.
    pub fn reached(&self, failures: u32) -> bool {
        match self {
            Threshold::Limit(limit) => failures >= *limit,
            Threshold::Unlimited => false,
        }
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Threshold::DEFAULT
    }
}

impl std::fmt::Display for Threshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Threshold::Limit(limit) => write!(f, "{}", limit),
            Threshold::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for Threshold {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Threshold::Limit(limit) => serializer.serialize_i64(*limit as i64),
            Threshold::Unlimited => serializer.serialize_i64(-1),
        }
    }
}

impl<'de> Deserialize<'de> for Threshold {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        if raw < 0 {
            Ok(Threshold::Unlimited)
        } else {
            Ok(Threshold::Limit(raw as u32))
        }
    }
}

/// One credential as held inside a channel pool
#[derive(Debug, Clone)]
struct Credential {
    value: String,
    failures: u32,
    threshold: Threshold,
    disabled: bool,
    last_used: Option<DateTime<Utc>>,
}

impl Credential {
    fn new(value: String) -> Self {
        Self {
            value,
            failures: 0,
            threshold: Threshold::DEFAULT,
            disabled: false,
            last_used: None,
        }
    }

    /// Re-derive the disabled flag from the disabled-iff invariant.
    fn reclassify(&mut self) {
        self.disabled = self.threshold.reached(self.failures);
    }
}

/// Serialized form of a credential, used by the persisted-state schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub value: String,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub max_errors: Threshold,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

/// Observable credential state; the secret value is always masked
#[derive(Debug, Clone)]
pub struct CredentialInfo {
    pub masked: String,
    pub failures: u32,
    pub threshold: Threshold,
    pub active: bool,
    pub last_used: Option<DateTime<Utc>>,
}

/// Token returned by [`CredentialPool::acquire`], handed back when reporting
/// the outcome of the call made with it.
///
/// Acquisition is not exclusive; the same credential may be leased to several
/// concurrent requests. The external API is the scarce resource, not the key.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    channel: String,
    secret: String,
}

impl CredentialLease {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn masked(&self) -> String {
        mask_secret(&self.secret)
    }
}

/// Mask a secret for listings and logs: first 8 characters only.
pub fn mask_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(8).collect();
    format!("{}...", prefix)
}

struct ChannelCredentials {
    entries: Vec<Credential>,
    /// Index the next acquisition starts scanning from
    next: usize,
}

impl ChannelCredentials {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            next: 0,
        }
    }
}

/// Per-channel credential pools.
///
/// Pools for different channels live in separate map entries and never
/// contend; mutations within one channel serialize on its entry.
#[derive(Default)]
pub struct CredentialPool {
    pools: DashMap<String, ChannelCredentials>,
}

impl CredentialPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add credentials to a channel's pool, skipping exact duplicates.
    /// Returns the number actually added.
    pub fn add_credentials(&self, channel: &str, values: &[String]) -> usize {
        let mut pool = self
            .pools
            .entry(channel.to_string())
            .or_insert_with(ChannelCredentials::new);
        let mut added = 0;
        for value in values {
            if value.trim().is_empty() {
                continue;
            }
            if pool.entries.iter().any(|c| &c.value == value) {
                continue;
            }
            pool.entries.push(Credential::new(value.clone()));
            added += 1;
        }
        if added > 0 {
            debug!(channel = %channel, added = added, "Added credentials");
        }
        added
    }

    /// Masked view of a channel's credentials, in pool order.
    pub fn list(&self, channel: &str) -> Vec<CredentialInfo> {
        self.pools
            .get(channel)
            .map(|pool| {
                pool.entries
                    .iter()
                    .map(|c| CredentialInfo {
                        masked: mask_secret(&c.value),
                        failures: c.failures,
                        threshold: c.threshold,
                        active: !c.disabled,
                        last_used: c.last_used,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove the credential at `index` (zero-based) from a channel's pool.
    pub fn remove_credential(&self, channel: &str, index: usize) -> Result<()> {
        let mut pool = self
            .pools
            .get_mut(channel)
            .ok_or_else(|| EngineError::ChannelNotFound(channel.to_string()))?;
        if index >= pool.entries.len() {
            return Err(EngineError::CredentialNotFound {
                channel: channel.to_string(),
                index,
            });
        }
        let removed = pool.entries.remove(index);
        if pool.next > index {
            pool.next -= 1;
        }
        debug!(channel = %channel, credential = %mask_secret(&removed.value), "Removed credential");
        Ok(())
    }

    /// Set the disable threshold of one credential and re-derive its state.
    pub fn set_threshold(&self, channel: &str, index: usize, threshold: Threshold) -> Result<()> {
        let mut pool = self
            .pools
            .get_mut(channel)
            .ok_or_else(|| EngineError::ChannelNotFound(channel.to_string()))?;
        let credential =
            pool.entries
                .get_mut(index)
                .ok_or_else(|| EngineError::CredentialNotFound {
                    channel: channel.to_string(),
                    index,
                })?;
        credential.threshold = threshold;
        credential.reclassify();
        Ok(())
    }

    /// Reset failure counters for one credential, or for every credential in
    /// the channel when `index` is `None`. Reactivates credentials that were
    /// disabled by threshold exhaustion. Returns how many credentials changed.
    pub fn reset_failures(&self, channel: &str, index: Option<usize>) -> Result<usize> {
        let mut pool = match self.pools.get_mut(channel) {
            Some(pool) => pool,
            None if index.is_none() => return Ok(0),
            None => return Err(EngineError::ChannelNotFound(channel.to_string())),
        };
        let range = match index {
            Some(i) if i >= pool.entries.len() => {
                return Err(EngineError::CredentialNotFound {
                    channel: channel.to_string(),
                    index: i,
                })
            }
            Some(i) => i..i + 1,
            None => 0..pool.entries.len(),
        };
        let mut changed = 0;
        for credential in &mut pool.entries[range] {
            if credential.failures != 0 || credential.disabled {
                credential.failures = 0;
                credential.disabled = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Reset failure counters across every channel in the system.
    pub fn reset_all(&self) -> usize {
        let mut changed = 0;
        for mut pool in self.pools.iter_mut() {
            for credential in &mut pool.entries {
                if credential.failures != 0 || credential.disabled {
                    credential.failures = 0;
                    credential.disabled = false;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Number of active (not disabled) credentials in a channel's pool.
    pub fn active_count(&self, channel: &str) -> usize {
        self.pools
            .get(channel)
            .map(|pool| pool.entries.iter().filter(|c| !c.disabled).count())
            .unwrap_or(0)
    }

    /// Acquire the next active credential in round-robin order.
    pub fn acquire(&self, channel: &str) -> Result<CredentialLease> {
        let mut pool = self
            .pools
            .get_mut(channel)
            .ok_or_else(|| EngineError::NoAvailableCredential(channel.to_string()))?;
        let len = pool.entries.len();
        if len == 0 {
            return Err(EngineError::NoAvailableCredential(channel.to_string()));
        }
        let start = pool.next % len;
        for offset in 0..len {
            let i = (start + offset) % len;
            if !pool.entries[i].disabled {
                pool.next = (i + 1) % len;
                return Ok(CredentialLease {
                    channel: channel.to_string(),
                    secret: pool.entries[i].value.clone(),
                });
            }
        }
        Err(EngineError::NoAvailableCredential(channel.to_string()))
    }

    /// Record the outcome of a call made with a leased credential.
    ///
    /// Success zeroes the failure counter (and reactivates, per the
    /// disabled-iff invariant). Failure increments the counter and disables
    /// the credential once its threshold is exhausted.
    pub fn report_outcome(&self, lease: &CredentialLease, success: bool) {
        let mut pool = match self.pools.get_mut(lease.channel()) {
            Some(pool) => pool,
            None => return,
        };
        let credential = match pool.entries.iter_mut().find(|c| c.value == lease.secret) {
            Some(credential) => credential,
            None => return,
        };
        credential.last_used = Some(Utc::now());
        if success {
            credential.failures = 0;
            credential.disabled = false;
        } else {
            credential.failures += 1;
            if !credential.disabled && credential.threshold.reached(credential.failures) {
                credential.disabled = true;
                warn!(
                    channel = %lease.channel,
                    credential = %lease.masked(),
                    failures = credential.failures,
                    threshold = %credential.threshold,
                    "Credential disabled after consecutive failures"
                );
            }
        }
    }

    /// Serialized view of a channel's credentials for persistence.
    pub fn export(&self, channel: &str) -> Vec<CredentialRecord> {
        self.pools
            .get(channel)
            .map(|pool| {
                pool.entries
                    .iter()
                    .map(|c| CredentialRecord {
                        value: c.value.clone(),
                        error_count: c.failures,
                        max_errors: c.threshold,
                        last_used: c.last_used,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace a channel's pool from persisted records. The disabled flag is
    /// re-derived from counter and threshold rather than trusted from disk.
    pub fn restore(&self, channel: &str, records: Vec<CredentialRecord>) {
        let entries = records
            .into_iter()
            .map(|r| {
                let mut credential = Credential::new(r.value);
                credential.failures = r.error_count;
                credential.threshold = r.max_errors;
                credential.last_used = r.last_used;
                credential.reclassify();
                credential
            })
            .collect();
        self.pools.insert(
            channel.to_string(),
            ChannelCredentials { entries, next: 0 },
        );
    }

    /// Drop a channel's pool entirely (when its channel is deleted).
    pub fn remove_channel(&self, channel: &str) {
        self.pools.remove(channel);
    }

    /// Names of every channel that currently has a pool, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(channel: &str, values: &[&str]) -> CredentialPool {
        let pool = CredentialPool::new();
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        pool.add_credentials(channel, &values);
        pool
    }

    #[test]
    fn test_add_deduplicates() {
        let pool = pool_with("g", &["k1", "k2"]);
        let added = pool.add_credentials("g", &["k2".to_string(), "k3".to_string()]);
        assert_eq!(added, 1);
        assert_eq!(pool.list("g").len(), 3);
    }

    #[test]
    fn test_round_robin_visits_each_once() {
        let pool = pool_with("g", &["k1", "k2", "k3"]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(pool.acquire("g").unwrap().secret().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["k1", "k2", "k3"]);
        // Rotation continues in the same stable order
        assert_eq!(pool.acquire("g").unwrap().secret(), "k1");
    }

    #[test]
    fn test_rotation_skips_disabled() {
        let pool = pool_with("g", &["k1", "k2"]);
        pool.set_threshold("g", 0, Threshold::Limit(1)).unwrap();
        let lease = pool.acquire("g").unwrap();
        assert_eq!(lease.secret(), "k1");
        pool.report_outcome(&lease, false);

        for _ in 0..3 {
            assert_eq!(pool.acquire("g").unwrap().secret(), "k2");
        }
    }

    #[test]
    fn test_disable_after_exact_threshold() {
        let pool = pool_with("g", &["k1"]);
        pool.set_threshold("g", 0, Threshold::Limit(3)).unwrap();
        for _ in 0..2 {
            let lease = pool.acquire("g").unwrap();
            pool.report_outcome(&lease, false);
        }
        assert!(pool.list("g")[0].active);

        let lease = pool.acquire("g").unwrap();
        pool.report_outcome(&lease, false);
        assert!(!pool.list("g")[0].active);
        assert!(pool.acquire("g").is_err());
    }

    #[test]
    fn test_success_resets_counter() {
        let pool = pool_with("g", &["k1"]);
        pool.set_threshold("g", 0, Threshold::Limit(3)).unwrap();
        for _ in 0..2 {
            let lease = pool.acquire("g").unwrap();
            pool.report_outcome(&lease, false);
        }
        let lease = pool.acquire("g").unwrap();
        pool.report_outcome(&lease, true);

        let info = &pool.list("g")[0];
        assert!(info.active);
        assert_eq!(info.failures, 0);
    }

    #[test]
    fn test_unlimited_threshold_never_disables() {
        let pool = pool_with("g", &["k1"]);
        pool.set_threshold("g", 0, Threshold::Unlimited).unwrap();
        for _ in 0..50 {
            let lease = pool.acquire("g").unwrap();
            pool.report_outcome(&lease, false);
        }
        assert!(pool.list("g")[0].active);
        assert_eq!(pool.list("g")[0].failures, 50);
    }

    #[test]
    fn test_reset_reactivates() {
        let pool = pool_with("g", &["k1"]);
        pool.set_threshold("g", 0, Threshold::Limit(1)).unwrap();
        let lease = pool.acquire("g").unwrap();
        pool.report_outcome(&lease, false);
        assert!(pool.acquire("g").is_err());

        let changed = pool.reset_failures("g", None).unwrap();
        assert_eq!(changed, 1);
        assert!(pool.acquire("g").is_ok());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let pool = pool_with("g", &["k1"]);
        assert_eq!(pool.reset_failures("g", Some(0)).unwrap(), 0);
        assert_eq!(pool.reset_failures("g", None).unwrap(), 0);
        assert_eq!(pool.reset_all(), 0);
    }

    #[test]
    fn test_raising_threshold_reactivates() {
        let pool = pool_with("g", &["k1"]);
        pool.set_threshold("g", 0, Threshold::Limit(1)).unwrap();
        let lease = pool.acquire("g").unwrap();
        pool.report_outcome(&lease, false);
        assert!(!pool.list("g")[0].active);

        pool.set_threshold("g", 0, Threshold::Limit(10)).unwrap();
        assert!(pool.list("g")[0].active);
    }

    #[test]
    fn test_listing_masks_secret() {
        let pool = pool_with("g", &["sk-abcdefghijklmnop"]);
        let info = &pool.list("g")[0];
        assert_eq!(info.masked, "sk-abcde...");
        assert!(!info.masked.contains("ijklmnop"));
    }

    #[test]
    fn test_classify_by_prefix() {
        assert_eq!(
            CredentialKind::classify("sk-abc123"),
            CredentialKind::ThirdPartyCompatible
        );
        assert_eq!(
            CredentialKind::classify("AIzaSyAbc"),
            CredentialKind::FirstParty
        );
    }

    #[test]
    fn test_threshold_serde_sentinel() {
        assert_eq!(serde_json::to_string(&Threshold::Unlimited).unwrap(), "-1");
        assert_eq!(serde_json::to_string(&Threshold::Limit(5)).unwrap(), "5");
        assert_eq!(
            serde_json::from_str::<Threshold>("-1").unwrap(),
            Threshold::Unlimited
        );
        assert_eq!(
            serde_json::from_str::<Threshold>("3").unwrap(),
            Threshold::Limit(3)
        );
    }

    #[test]
    fn test_restore_rederives_disabled() {
        let pool = CredentialPool::new();
        pool.restore(
            "g",
            vec![
                CredentialRecord {
                    value: "dead".to_string(),
                    error_count: 5,
                    max_errors: Threshold::Limit(5),
                    last_used: None,
                },
                CredentialRecord {
                    value: "alive".to_string(),
                    error_count: 4,
                    max_errors: Threshold::Limit(5),
                    last_used: None,
                },
            ],
        );
        let infos = pool.list("g");
        assert!(!infos[0].active);
        assert!(infos[1].active);
        assert_eq!(pool.active_count("g"), 1);
    }
}
