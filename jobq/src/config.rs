//! Environment-style settings for the store connection and queue defaults.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{QueueError, QueueResult};

/// Connection parameters for the backing Redis store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Namespace for every key the queue writes
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            key_prefix: "jobq".to_string(),
        }
    }
}

/// Process-wide queue settings, immutable once the service is built
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub redis: RedisSettings,
    /// Default slots per registered processor
    pub concurrency: usize,
    /// Default attempts per job
    pub max_attempts: u32,
    /// Base delay of the default exponential backoff
    pub backoff_delay: Duration,
    /// Completed jobs retained per queue (`None` keeps all)
    pub keep_completed: Option<usize>,
    /// Failed jobs retained per queue (`None` keeps all)
    pub keep_failed: Option<usize>,
    /// Lease length of a claimed job
    pub lock_duration: Duration,
    /// How often expired leases are swept
    pub stalled_interval: Duration,
    /// Stalls tolerated before a job is failed
    pub max_stalled_count: u32,
    /// How long an idle slot sleeps before checking the store again
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs per queue
    pub shutdown_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            concurrency: 5,
            max_attempts: 3,
            backoff_delay: Duration::from_millis(2000),
            keep_completed: Some(50),
            keep_failed: Some(50),
            lock_duration: Duration::from_secs(30),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl QueueSettings {
    /// Read settings from the process environment
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup. Unset keys take their
    /// defaults; a set key that does not parse is a config error.
    pub fn from_lookup<F>(lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = EnvReader { lookup };

        let settings = Self {
            redis: RedisSettings {
                host: env.string("REDIS_HOST").unwrap_or(defaults.redis.host),
                port: env.parse("REDIS_PORT")?.unwrap_or(defaults.redis.port),
                password: env.string("REDIS_PASSWORD").filter(|p| !p.is_empty()),
                db: env.parse("REDIS_DB")?.unwrap_or(defaults.redis.db),
                key_prefix: env.string("QUEUE_KEY_PREFIX").unwrap_or(defaults.redis.key_prefix),
            },
            concurrency: env.parse("QUEUE_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            max_attempts: env.parse("QUEUE_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            backoff_delay: env.millis("QUEUE_DELAY_MULTIPLIER")?.unwrap_or(defaults.backoff_delay),
            keep_completed: env.parse("QUEUE_KEEP_COMPLETED")?.or(defaults.keep_completed),
            keep_failed: env.parse("QUEUE_KEEP_FAILED")?.or(defaults.keep_failed),
            lock_duration: env.millis("QUEUE_LOCK_DURATION_MS")?.unwrap_or(defaults.lock_duration),
            stalled_interval: env
                .millis("QUEUE_STALLED_INTERVAL_MS")?
                .unwrap_or(defaults.stalled_interval),
            max_stalled_count: env
                .parse("QUEUE_MAX_STALLED_COUNT")?
                .unwrap_or(defaults.max_stalled_count),
            poll_interval: env.millis("QUEUE_POLL_INTERVAL_MS")?.unwrap_or(defaults.poll_interval),
            shutdown_timeout: env
                .millis("QUEUE_SHUTDOWN_TIMEOUT_MS")?
                .unwrap_or(defaults.shutdown_timeout),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Check the bounds every component relies on
    pub fn validate(&self) -> QueueResult<()> {
        if self.redis.host.trim().is_empty() {
            return Err(QueueError::Config("\"REDIS_HOST\" must not be empty".to_string()));
        }
        if self.redis.port == 0 {
            return Err(QueueError::Config("\"REDIS_PORT\" must be a valid port".to_string()));
        }
        if self.redis.db < 0 {
            return Err(QueueError::Config("\"REDIS_DB\" must not be negative".to_string()));
        }
        if self.redis.key_prefix.is_empty() || self.redis.key_prefix.contains(char::is_whitespace) {
            return Err(QueueError::Config(
                "\"QUEUE_KEY_PREFIX\" must be a non-empty word".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(QueueError::Config(
                "\"QUEUE_CONCURRENCY\" must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::Config(
                "\"QUEUE_MAX_ATTEMPTS\" must be at least 1".to_string(),
            ));
        }
        if self.lock_duration.is_zero() {
            return Err(QueueError::Config(
                "\"QUEUE_LOCK_DURATION_MS\" must be positive".to_string(),
            ));
        }
        if self.stalled_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(QueueError::Config(
                "stall sweep and poll intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn parse<T>(&self, key: &str) -> QueueResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                QueueError::Config(format!("\"{}\" has invalid value '{}': {}", key, raw, e))
            }),
        }
    }

    fn millis(&self, key: &str) -> QueueResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}
