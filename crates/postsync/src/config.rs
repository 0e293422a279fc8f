//! Cache lifecycle configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SyncError;

/// Default retention for entries nobody subscribes to.
pub const DEFAULT_KEEP_UNUSED_SECS: u64 = 60;

// Upper bound keeps a typo from pinning stale entries for days.
const MAX_KEEP_UNUSED_SECS: u64 = 24 * 60 * 60;

/// Whether a new subscription to an already settled entry triggers a refetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefetchOnSubscribe {
    /// Serve cached data as-is.
    #[default]
    Never,
    /// Always refetch.
    Always,
    /// Refetch when the last successful fetch is older than this.
    IfOlderThan(#[serde(with = "secs")] Duration),
}

/// Configuration for a [`SyncClient`](crate::SyncClient).
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use postsync::{RefetchOnSubscribe, SyncConfig};
///
/// let config = SyncConfig::builder()
///     .keep_unused_for(Duration::from_secs(30))
///     .refetch_on_subscribe(RefetchOnSubscribe::Always)
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Grace period before an entry with zero subscribers is evicted.
    #[serde(with = "secs", default = "default_keep_unused_for")]
    pub keep_unused_for: Duration,

    /// Refetch policy applied when a subscription attaches to a settled entry.
    #[serde(default)]
    pub refetch_on_subscribe: RefetchOnSubscribe,
}

fn default_keep_unused_for() -> Duration {
    Duration::from_secs(DEFAULT_KEEP_UNUSED_SECS)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            keep_unused_for: default_keep_unused_for(),
            refetch_on_subscribe: RefetchOnSubscribe::default(),
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// Check configured values are within supported limits.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.keep_unused_for > Duration::from_secs(MAX_KEEP_UNUSED_SECS) {
            return Err(SyncError::InvalidInput(format!(
                "keep_unused_for must be at most {MAX_KEEP_UNUSED_SECS}s (got {}s)",
                self.keep_unused_for.as_secs()
            )));
        }
        if self.refetch_on_subscribe == RefetchOnSubscribe::IfOlderThan(Duration::ZERO) {
            return Err(SyncError::InvalidInput(
                "refetch age must be non-zero; use `always` instead".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`SyncConfig`].
#[derive(Debug, Clone, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn keep_unused_for(mut self, duration: Duration) -> Self {
        self.config.keep_unused_for = duration;
        self
    }

    #[must_use]
    pub fn refetch_on_subscribe(mut self, policy: RefetchOnSubscribe) -> Self {
        self.config.refetch_on_subscribe = policy;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.keep_unused_for, Duration::from_secs(60));
        assert_eq!(config.refetch_on_subscribe, RefetchOnSubscribe::Never);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"refetch_on_subscribe": {"if_older_than": 30}}"#).unwrap();

        assert_eq!(config.keep_unused_for, Duration::from_secs(60));
        assert_eq!(
            config.refetch_on_subscribe,
            RefetchOnSubscribe::IfOlderThan(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_validate_rejects_excessive_retention() {
        let config = SyncConfig::builder()
            .keep_unused_for(Duration::from_secs(MAX_KEEP_UNUSED_SECS + 1))
            .build();
        assert!(matches!(config.validate(), Err(SyncError::InvalidInput(_))));
    }

    #[test]
    fn test_validate_rejects_zero_age() {
        let config = SyncConfig::builder()
            .refetch_on_subscribe(RefetchOnSubscribe::IfOlderThan(Duration::ZERO))
            .build();
        assert!(config.validate().is_err());
    }
}
