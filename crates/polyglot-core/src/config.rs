//! Process settings.
//!
//! `Settings` is parsed from flags with environment fallbacks and fans out into
//! the plain per-component configs, which also carry their own defaults.

use std::time::Duration;

use clap::Args;

use crate::app::{
    CleanupConfig, EditWeights, GateConfig, ManagerConfig, OrchestratorConfig, SupervisorConfig,
    WorkerConfig,
};
use crate::domain::{Language, RetryPolicy};
use crate::impls::{RedisLogConfig, RedisStoreConfig};

pub const DEFAULT_WER_THRESHOLD: f64 = 0.3;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_BATCH_SIZE: usize = 1;
pub const DEFAULT_SUPERVISOR_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MEMORY_FLOOR_MIB: u64 = 512;
pub const DEFAULT_SATURATION_BACKOFF_SECS: u64 = 10;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;
pub const DEFAULT_STT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TRANSLATION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TRANSLATION_ATTEMPTS: u32 = 3;
pub const DEFAULT_CLEANUP_MAX_AGE_HOURS: u64 = 24;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3_600;

#[derive(Debug, Clone, Args)]
pub struct Settings {
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[arg(long, env = "POLYGLOT_KEY_PREFIX", default_value = "polyglot")]
    pub key_prefix: String,

    #[arg(long, env = "STREAM_KEY", default_value = "translation_tasks")]
    pub stream_key: String,

    #[arg(long, env = "CONSUMER_GROUP", default_value = "translation_workers")]
    pub consumer_group: String,

    /// Comma separated language codes; empty accepts any.
    #[arg(long, env = "SUPPORTED_LANGUAGES", value_delimiter = ',')]
    pub supported_languages: Vec<String>,

    #[arg(long, env = "TASK_RETRY_LIMIT", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    #[arg(long, env = "WER_THRESHOLD", default_value_t = DEFAULT_WER_THRESHOLD)]
    pub wer_threshold: f64,

    #[arg(long, env = "WER_SUBSTITUTION_WEIGHT", default_value_t = 1.0)]
    pub substitution_weight: f64,

    #[arg(long, env = "WER_INSERTION_WEIGHT", default_value_t = 1.0)]
    pub insertion_weight: f64,

    #[arg(long, env = "WER_DELETION_WEIGHT", default_value_t = 1.0)]
    pub deletion_weight: f64,

    /// Lease timeout in seconds: entries idle this long are reclaimed.
    #[arg(long, env = "WORKER_TIMEOUT", default_value_t = DEFAULT_LEASE_TIMEOUT_SECS)]
    pub lease_timeout_secs: u64,

    #[arg(long, env = "READ_BLOCK_MS", default_value_t = DEFAULT_BLOCK_TIMEOUT_MS)]
    pub read_block_ms: u64,

    #[arg(long, env = "WORKER_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    #[arg(long, env = "WORKER_MEMORY_FLOOR_MB", default_value_t = DEFAULT_MEMORY_FLOOR_MIB)]
    pub memory_floor_mib: u64,

    #[arg(long, env = "WORKER_BACKOFF_SECS", default_value_t = DEFAULT_SATURATION_BACKOFF_SECS)]
    pub saturation_backoff_secs: u64,

    #[arg(long, env = "WORKER_HEARTBEAT_INTERVAL", default_value_t = DEFAULT_HEARTBEAT_INTERVAL_SECS)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "WORKER_MAX_IN_FLIGHT", default_value_t = DEFAULT_MAX_IN_FLIGHT)]
    pub max_in_flight: usize,

    #[arg(long, env = "STT_TIMEOUT_SECS", default_value_t = DEFAULT_STT_TIMEOUT_SECS)]
    pub stt_timeout_secs: u64,

    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = DEFAULT_FETCH_TIMEOUT_SECS)]
    pub fetch_timeout_secs: u64,

    #[arg(long, env = "TRANSLATION_TIMEOUT_SECS", default_value_t = DEFAULT_TRANSLATION_TIMEOUT_SECS)]
    pub translation_timeout_secs: u64,

    #[arg(long, env = "TRANSLATION_ATTEMPTS", default_value_t = DEFAULT_TRANSLATION_ATTEMPTS)]
    pub translation_attempts: u32,

    #[arg(long, env = "SUPERVISOR_INTERVAL_SECS", default_value_t = DEFAULT_SUPERVISOR_INTERVAL_SECS)]
    pub supervisor_interval_secs: u64,

    #[arg(long, env = "CLEANUP_MAX_AGE_HOURS", default_value_t = DEFAULT_CLEANUP_MAX_AGE_HOURS)]
    pub cleanup_max_age_hours: u64,

    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS)]
    pub cleanup_interval_secs: u64,

    /// Root directory for `audio_ref` lookups.
    #[arg(long, env = "UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: String,
}

impl Settings {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            max_retries: self.max_retries,
            supported_languages: self
                .supported_languages
                .iter()
                .map(|code| code.trim())
                .filter(|code| !code.is_empty())
                .map(Language::new)
                .collect(),
        }
    }

    pub fn gate(&self) -> GateConfig {
        GateConfig {
            threshold: self.wer_threshold,
            weights: EditWeights {
                substitution: self.substitution_weight,
                insertion: self.insertion_weight,
                deletion: self.deletion_weight,
            },
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_in_flight: self.max_in_flight,
            call_timeout: Duration::from_secs(self.translation_timeout_secs),
            call_attempts: self.translation_attempts,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.batch_size,
            block_timeout: Duration::from_millis(self.read_block_ms),
            memory_floor_mib: self.memory_floor_mib,
            saturation_backoff: Duration::from_secs(self.saturation_backoff_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            stt_timeout: Duration::from_secs(self.stt_timeout_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            interval: Duration::from_secs(self.supervisor_interval_secs),
            lease_timeout: self.lease_timeout(),
            ..SupervisorConfig::default()
        }
    }

    pub fn cleanup(&self) -> CleanupConfig {
        CleanupConfig {
            interval: Duration::from_secs(self.cleanup_interval_secs),
            max_age: hours(self.cleanup_max_age_hours),
        }
    }

    pub fn redis_store(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            key_prefix: self.key_prefix.clone(),
            // a worker that misses three heartbeats drops out of `workers`
            worker_ttl: Duration::from_secs(self.heartbeat_interval_secs.saturating_mul(3).max(1)),
        }
    }

    pub fn redis_log(&self) -> RedisLogConfig {
        RedisLogConfig {
            stream_key: self.stream_key.clone(),
            group_name: self.consumer_group.clone(),
            ..RedisLogConfig::default()
        }
    }
}

/// `n` hours, saturating instead of overflowing.
pub fn hours(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(3_600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        settings: Settings,
    }

    fn parse(args: &[&str]) -> Settings {
        TestCli::try_parse_from(std::iter::once("polyglot").chain(args.iter().copied()))
            .unwrap()
            .settings
    }

    #[test]
    fn defaults_match_component_defaults() {
        let settings = parse(&[]);

        assert_eq!(settings.worker(), WorkerConfig::default());
        assert_eq!(settings.supervisor(), SupervisorConfig::default());
        assert_eq!(settings.cleanup(), CleanupConfig::default());
        assert_eq!(settings.orchestrator(), OrchestratorConfig::default());
        assert_eq!(settings.gate(), GateConfig::default());
        assert_eq!(settings.manager(), ManagerConfig::default());
    }

    #[test]
    fn supported_languages_are_comma_separated() {
        let settings = parse(&["--supported-languages", "en,ja, fr,"]);

        assert_eq!(
            settings.manager().supported_languages,
            vec![Language::new("en"), Language::new("ja"), Language::new("fr")]
        );
    }

    #[test]
    fn flags_override_defaults() {
        let settings = parse(&["--wer-threshold", "0.5", "--lease-timeout-secs", "60"]);

        assert_eq!(settings.gate().threshold, 0.5);
        assert_eq!(settings.supervisor().lease_timeout, Duration::from_secs(60));
    }

    #[test]
    fn huge_cleanup_age_saturates() {
        let settings = parse(&["--cleanup-max-age-hours", &u64::MAX.to_string()]);

        assert_eq!(settings.cleanup().max_age, Duration::from_secs(u64::MAX));
        assert_eq!(hours(2), Duration::from_secs(7_200));
    }
}
