use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Requests allowed per key per rolling window when none is given.
pub const DEFAULT_RATE_LIMIT: u32 = 5;

/// Trailing interval over which usage counts against a key's limit.
const ROLLING_WINDOW_SECS: i64 = 60;

/// One API key plus the usage instants recorded against it. Stale instants
/// are purged lazily: `record_usage` is the only guaranteed purge point,
/// every read filters defensively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub secret: String,
    #[serde(default)]
    pub usage: Vec<DateTime<Utc>>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
}

fn default_rate_limit() -> u32 {
    DEFAULT_RATE_LIMIT
}

fn effective_rate_limit(rate_limit: Option<u32>) -> u32 {
    match rate_limit {
        Some(limit) if limit > 0 => limit,
        _ => DEFAULT_RATE_LIMIT,
    }
}

impl ApiKey {
    fn usage_within(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(ROLLING_WINDOW_SECS);
        self.usage.iter().filter(|ts| **ts > cutoff).count()
    }

    fn has_quota(&self, now: DateTime<Utc>) -> bool {
        self.usage_within(now) < self.rate_limit as usize
    }
}

/// The set of registered API keys with rolling-window rotation.
///
/// Selection is round-robin by recency: among keys with spare quota the one
/// whose most recent use is oldest wins, and a never-used key beats any used
/// one. All operations are synchronous and in-memory; the owning service
/// writes the serde snapshot through to storage after mutations without
/// making callers wait on that write.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyRing {
    keys: Vec<ApiKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key. Re-registering an existing secret is a no-op; the
    /// secret's validity with the remote service is not checked here.
    /// A zero or absent rate limit falls back to the default rather than
    /// registering a key that could never be selected.
    pub fn register(&mut self, secret: &str, rate_limit: Option<u32>) {
        if self.keys.iter().any(|key| key.secret == secret) {
            return;
        }
        self.keys.push(ApiKey {
            secret: secret.to_string(),
            usage: Vec::new(),
            rate_limit: effective_rate_limit(rate_limit),
        });
    }

    /// Drops a key and its usage history. Requests already dispatched with
    /// the secret are unaffected.
    pub fn unregister(&mut self, secret: &str) {
        self.keys.retain(|key| key.secret != secret);
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn secrets(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|key| key.secret.as_str())
    }

    pub fn rate_limit(&self, secret: &str) -> Option<u32> {
        self.find(secret).map(|key| key.rate_limit)
    }

    /// Usage within the trailing window right now; 0 for unknown secrets.
    pub fn current_usage(&self, secret: &str) -> usize {
        self.current_usage_at(secret, Utc::now())
    }

    /// The secret to use for the next request, or `None` when every key is
    /// at quota or none is registered.
    pub fn select_available(&self) -> Option<String> {
        self.select_available_at(Utc::now())
    }

    /// True only when at least one key is registered and all of them are at
    /// or over quota. An empty ring is "no keys", a different condition the
    /// caller surfaces separately.
    pub fn all_exhausted(&self) -> bool {
        self.all_exhausted_at(Utc::now())
    }

    /// Records a successful request against `secret`, purging that key's
    /// stale instants first. Unknown secrets are ignored.
    pub fn record_usage(&mut self, secret: &str) {
        self.record_usage_at(secret, Utc::now());
    }

    /// Changes a key's quota going forward; recorded usage stands. Zero
    /// falls back to the default, as in `register`.
    pub fn set_rate_limit(&mut self, secret: &str, rate_limit: u32) {
        if let Some(key) = self.keys.iter_mut().find(|key| key.secret == secret) {
            key.rate_limit = effective_rate_limit(Some(rate_limit));
        }
    }

    fn find(&self, secret: &str) -> Option<&ApiKey> {
        self.keys.iter().find(|key| key.secret == secret)
    }

    fn current_usage_at(&self, secret: &str, now: DateTime<Utc>) -> usize {
        self.find(secret)
            .map(|key| key.usage_within(now))
            .unwrap_or(0)
    }

    fn select_available_at(&self, now: DateTime<Utc>) -> Option<String> {
        self.keys
            .iter()
            .filter(|key| key.has_quota(now))
            .min_by_key(|key| {
                key.usage
                    .last()
                    .map(|ts| ts.timestamp_millis())
                    .unwrap_or(i64::MIN)
            })
            .map(|key| key.secret.clone())
    }

    fn all_exhausted_at(&self, now: DateTime<Utc>) -> bool {
        !self.keys.is_empty() && self.keys.iter().all(|key| !key.has_quota(now))
    }

    fn record_usage_at(&mut self, secret: &str, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(ROLLING_WINDOW_SECS);
        if let Some(key) = self.keys.iter_mut().find(|key| key.secret == secret) {
            key.usage.retain(|ts| *ts > cutoff);
            key.usage.push(now);
        }
    }
}
