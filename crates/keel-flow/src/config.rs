//! Engine configuration.
//!
//! [`EngineConfig`] is plain serde data (durations are encoded as
//! milliseconds) and can be loaded from `KEEL_*` environment variables with
//! [`EngineConfig::from_env`]. Every loaded configuration must pass
//! [`EngineConfig::validate`] before the engine starts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Prefix under which every coordination key lives. Required.
    pub key_prefix: String,

    /// Identity of this process in leader election. A ULID when absent.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Dispatcher settings.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Worker registry settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Leader election and leader-loop settings.
    #[serde(default)]
    pub leader: LeaderConfig,

    /// Queue manager settings.
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of dispatches in flight at once.
    pub concurrency: usize,
    /// Delay between dispatch attempts.
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
    /// Upper bound of random jitter added to each retry delay.
    #[serde(with = "duration_ms")]
    pub retry_jitter: Duration,
    /// Consistent-hash ring parameters.
    pub ring: RingConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            retry_interval: Duration::from_secs(5),
            retry_jitter: Duration::from_secs(1),
            ring: RingConfig::default(),
        }
    }
}

/// Consistent-hash ring parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Number of partitions keys are hashed into. Prime numbers distribute best.
    pub partition_count: usize,
    /// Virtual nodes per member.
    pub replication_factor: usize,
    /// Bounded-load factor: a member may own at most `ceil(avg * load)` partitions.
    pub load: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            partition_count: 271,
            replication_factor: 20,
            load: 1.25,
        }
    }
}

/// Worker registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How often a worker writes its heartbeat.
    #[serde(with = "duration_ms")]
    pub heartbeat_report_interval: Duration,
    /// Missed heartbeats tolerated before a worker is considered dead.
    pub allowed_max_continue_lost_contact_times: u32,
    /// How long a candidate waits before promoting itself to official.
    #[serde(with = "duration_ms")]
    pub candidate_promotion_threshold: Duration,
    /// How often the leader probes worker heartbeats.
    #[serde(with = "duration_ms")]
    pub liveness_probe_interval: Duration,
    /// Backoff between retries of worker-side store operations.
    #[serde(with = "duration_ms")]
    pub store_retry_interval: Duration,
}

impl WorkerConfig {
    /// Time without a heartbeat after which a worker is dead.
    #[must_use]
    pub fn death_threshold(&self) -> Duration {
        self.heartbeat_report_interval * self.allowed_max_continue_lost_contact_times
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_report_interval: Duration::from_secs(5),
            allowed_max_continue_lost_contact_times: 5,
            candidate_promotion_threshold: Duration::from_secs(10),
            liveness_probe_interval: Duration::from_secs(5),
            store_retry_interval: Duration::from_secs(1),
        }
    }
}

/// Leader election and leader-loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// Election key name under `{prefix}/election/`.
    pub lock_key: String,
    /// Lease time-to-live.
    #[serde(with = "duration_ms")]
    pub lease_ttl: Duration,
    /// Lease renewal period. Must be shorter than the TTL.
    #[serde(with = "duration_ms")]
    pub renew_interval: Duration,
    /// Delay between campaign attempts while another process leads.
    #[serde(with = "duration_ms")]
    pub campaign_retry_interval: Duration,
    /// Period of the dangling-key cleanup sweep.
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Backoff between retries of leader-side listings.
    #[serde(with = "duration_ms")]
    pub listing_retry_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lock_key: "leader".to_string(),
            lease_ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            campaign_retry_interval: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(60),
            listing_retry_interval: Duration::from_secs(1),
        }
    }
}

/// Queue manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Key segment for queue mutation events.
    pub incoming_key_prefix: String,
    /// Key segment for release notices.
    pub release_key_prefix: String,
    /// How long after taking leadership running pipelines are re-dispatched.
    #[serde(with = "duration_ms")]
    pub reload_running_interval: Duration,
    /// Admission attempts before a pipeline is marked failed.
    pub max_admission_attempts: u32,
    /// Delay between admission attempts.
    #[serde(with = "duration_ms")]
    pub admission_retry_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            incoming_key_prefix: "queue-input".to_string(),
            release_key_prefix: "queue-release".to_string(),
            reload_running_interval: Duration::from_secs(10),
            max_admission_attempts: 3,
            admission_retry_interval: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults for everything but the prefix.
    #[must_use]
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            instance_id: None,
            dispatcher: DispatcherConfig::default(),
            worker: WorkerConfig::default(),
            leader: LeaderConfig::default(),
            queue: QueueConfig::default(),
        }
    }

    /// Loads configuration from `KEEL_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable cannot be parsed or the
    /// result fails validation.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable cannot be parsed or the
    /// result fails validation.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup: &lookup };

        let key_prefix = env
            .string("KEEL_KEY_PREFIX")
            .ok_or_else(|| Error::configuration("KEEL_KEY_PREFIX is required"))?;
        let mut config = Self::new(key_prefix);
        config.instance_id = env.string("KEEL_INSTANCE_ID");

        let dispatcher = &mut config.dispatcher;
        if let Some(v) = env.parse("KEEL_DISPATCH_CONCURRENCY")? {
            dispatcher.concurrency = v;
        }
        if let Some(v) = env.millis("KEEL_DISPATCH_RETRY_INTERVAL_MS")? {
            dispatcher.retry_interval = v;
        }
        if let Some(v) = env.millis("KEEL_DISPATCH_RETRY_JITTER_MS")? {
            dispatcher.retry_jitter = v;
        }
        if let Some(v) = env.parse("KEEL_RING_PARTITION_COUNT")? {
            dispatcher.ring.partition_count = v;
        }
        if let Some(v) = env.parse("KEEL_RING_REPLICATION_FACTOR")? {
            dispatcher.ring.replication_factor = v;
        }
        if let Some(v) = env.parse("KEEL_RING_LOAD")? {
            dispatcher.ring.load = v;
        }

        let worker = &mut config.worker;
        if let Some(v) = env.millis("KEEL_HEARTBEAT_REPORT_INTERVAL_MS")? {
            worker.heartbeat_report_interval = v;
        }
        if let Some(v) = env.parse("KEEL_ALLOWED_MAX_CONTINUE_LOST_CONTACT_TIMES")? {
            worker.allowed_max_continue_lost_contact_times = v;
        }
        if let Some(v) = env.millis("KEEL_CANDIDATE_PROMOTION_THRESHOLD_MS")? {
            worker.candidate_promotion_threshold = v;
        }
        if let Some(v) = env.millis("KEEL_LIVENESS_PROBE_INTERVAL_MS")? {
            worker.liveness_probe_interval = v;
        }

        let leader = &mut config.leader;
        if let Some(v) = env.string("KEEL_LEADER_LOCK_KEY") {
            leader.lock_key = v;
        }
        if let Some(v) = env.millis("KEEL_LEADER_LEASE_TTL_MS")? {
            leader.lease_ttl = v;
        }
        if let Some(v) = env.millis("KEEL_LEADER_RENEW_INTERVAL_MS")? {
            leader.renew_interval = v;
        }
        if let Some(v) = env.millis("KEEL_LEADER_CLEANUP_INTERVAL_MS")? {
            leader.cleanup_interval = v;
        }

        let queue = &mut config.queue;
        if let Some(v) = env.string("KEEL_QUEUE_INCOMING_KEY_PREFIX") {
            queue.incoming_key_prefix = v;
        }
        if let Some(v) = env.string("KEEL_QUEUE_RELEASE_KEY_PREFIX") {
            queue.release_key_prefix = v;
        }
        if let Some(v) = env.millis("KEEL_QUEUE_RELOAD_RUNNING_INTERVAL_MS")? {
            queue.reload_running_interval = v;
        }
        if let Some(v) = env.parse("KEEL_QUEUE_MAX_ADMISSION_ATTEMPTS")? {
            queue.max_admission_attempts = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.trim_end_matches('/').is_empty() {
            return Err(Error::configuration("key_prefix must not be empty"));
        }

        let ring = &self.dispatcher.ring;
        if ring.partition_count == 0 {
            return Err(Error::configuration("ring.partition_count must be >= 1"));
        }
        if ring.replication_factor == 0 {
            return Err(Error::configuration(
                "ring.replication_factor must be >= 1",
            ));
        }
        if ring.load.is_nan() || ring.load <= 1.0 {
            return Err(Error::configuration(format!(
                "ring.load must be greater than 1.0 (got {})",
                ring.load
            )));
        }
        if self.dispatcher.concurrency == 0 {
            return Err(Error::configuration("dispatcher.concurrency must be >= 1"));
        }
        if self.worker.allowed_max_continue_lost_contact_times == 0 {
            return Err(Error::configuration(
                "worker.allowed_max_continue_lost_contact_times must be >= 1",
            ));
        }
        if self.queue.max_admission_attempts == 0 {
            return Err(Error::configuration("queue.max_admission_attempts must be >= 1"));
        }

        let intervals = [
            ("dispatcher.retry_interval", self.dispatcher.retry_interval),
            (
                "worker.heartbeat_report_interval",
                self.worker.heartbeat_report_interval,
            ),
            (
                "worker.candidate_promotion_threshold",
                self.worker.candidate_promotion_threshold,
            ),
            (
                "worker.liveness_probe_interval",
                self.worker.liveness_probe_interval,
            ),
            ("worker.store_retry_interval", self.worker.store_retry_interval),
            ("leader.lease_ttl", self.leader.lease_ttl),
            ("leader.renew_interval", self.leader.renew_interval),
            (
                "leader.campaign_retry_interval",
                self.leader.campaign_retry_interval,
            ),
            ("leader.cleanup_interval", self.leader.cleanup_interval),
            (
                "leader.listing_retry_interval",
                self.leader.listing_retry_interval,
            ),
            (
                "queue.admission_retry_interval",
                self.queue.admission_retry_interval,
            ),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(Error::configuration(format!("{name} must be non-zero")));
            }
        }
        if self.leader.renew_interval >= self.leader.lease_ttl {
            return Err(Error::configuration(
                "leader.renew_interval must be shorter than leader.lease_ttl",
            ));
        }

        for (name, segment) in [
            ("queue.incoming_key_prefix", &self.queue.incoming_key_prefix),
            ("queue.release_key_prefix", &self.queue.release_key_prefix),
            ("leader.lock_key", &self.leader.lock_key),
        ] {
            if segment.is_empty() || segment.contains('/') {
                return Err(Error::configuration(format!(
                    "{name} must be a non-empty key segment without '/'"
                )));
            }
        }
        Ok(())
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<T>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} is invalid: {e}")))
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
