//! Configuration types for catalog-sync

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pipeline and synchronization behavior configuration
///
/// Every knob has a sensible default; `SyncConfig::default()` works out of
/// the box. Deserializes from any serde format with missing fields filled in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Capacity of the bounded channels between stages (default: 100)
    ///
    /// A producer blocks when the channel to the next stage holds this many
    /// units, bounding memory use across the whole pipeline.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Minimum batch size the batching iterator aims for (default: 50)
    ///
    /// Batches may be smaller when the upstream finishes, and larger when
    /// items are already waiting in the channel.
    #[serde(default = "default_batch_minsize")]
    pub batch_minsize: usize,

    /// Maximum number of content units the download stage handles
    /// simultaneously (default: 200)
    #[serde(default = "default_max_concurrent_content")]
    pub max_concurrent_content: usize,

    /// How long the runner waits for sibling stages to acknowledge
    /// cancellation after a stage fails (default: 60 seconds)
    #[serde(default = "default_shutdown_grace", with = "duration_serde")]
    pub shutdown_grace: Duration,

    /// Retry behavior for artifact downloads
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_minsize: default_batch_minsize(),
            max_concurrent_content: default_max_concurrent_content(),
            shutdown_grace: default_shutdown_grace(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient download failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

fn default_queue_capacity() -> usize {
    100
}

fn default_batch_minsize() -> usize {
    50
}

fn default_max_concurrent_content() -> usize {
    200
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

// Duration serialization as whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
