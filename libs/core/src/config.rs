use std::time::Duration;

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Broker connection and queue naming.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub event_queue: String,
    pub interaction_queue: String,
    pub event_prefetch: usize,
    pub interaction_prefetch: usize,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_string("BROKER_URL", "nats://127.0.0.1:4222"),
            event_queue: env_string("EVENT_QUEUE", "guildsmith-events"),
            interaction_queue: env_string("INTERACTION_QUEUE", "guildsmith-interactions"),
            event_prefetch: env_parse("EVENT_PREFETCH", 10),
            interaction_prefetch: env_parse("INTERACTION_PREFETCH", 5),
        }
    }
}

/// Key/value state store location. Defaults to the broker URL since both live
/// on the same JetStream deployment in the standard topology.
#[derive(Debug, Clone)]
pub struct KvConfig {
    pub url: String,
    pub bucket: String,
}

impl KvConfig {
    pub fn from_env(broker: &BrokerConfig) -> Self {
        Self {
            url: env_string("KV_URL", &broker.url),
            bucket: env_string("KV_BUCKET", "guildsmith-state"),
        }
    }
}

/// Synthesis engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub concurrency: usize,
    /// Engine-local limit of outbound actions per second, across all workers.
    pub rate_limit_max: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub remove_on_complete_age: Duration,
    pub remove_on_fail_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit_max: 10,
            max_attempts: 3,
            backoff_base: Duration::from_millis(1000),
            remove_on_complete_age: Duration::from_secs(3600),
            remove_on_fail_age: Duration::from_secs(86_400),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: env_parse("ENGINE_CONCURRENCY", defaults.concurrency).max(1),
            rate_limit_max: env_parse("ENGINE_RATE_LIMIT_MAX", defaults.rate_limit_max).max(1),
            max_attempts: env_parse("ENGINE_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            backoff_base: Duration::from_millis(env_parse("ENGINE_BACKOFF_BASE_MS", 1000)),
            remove_on_complete_age: Duration::from_secs(env_parse(
                "ENGINE_REMOVE_ON_COMPLETE_AGE_SEC",
                3600,
            )),
            remove_on_fail_age: Duration::from_secs(env_parse(
                "ENGINE_REMOVE_ON_FAIL_AGE_SEC",
                86_400,
            )),
        }
    }
}

/// Process-wide token bucket shared across all job types and workers.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_rate: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 50.0,
            refill_rate: 50.0,
        }
    }
}

impl BucketConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            capacity: env_parse("GLOBAL_BUCKET_CAPACITY", defaults.capacity).max(1.0),
            refill_rate: env_parse("GLOBAL_BUCKET_REFILL_RATE", defaults.refill_rate).max(0.1),
        }
    }
}

/// Health listener tuning.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub port: u16,
    pub memory_threshold_mb: u64,
}

impl HealthConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("HEALTH_PORT", 8080),
            memory_threshold_mb: env_parse("HEALTH_MEMORY_THRESHOLD_MB", 512),
        }
    }
}

/// Credentials and base URL for the chat platform REST API.
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub api_base: String,
    pub bot_token: String,
    pub application_id: String,
}

impl DiscordConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: env_string("DISCORD_API_BASE", "https://discord.com/api/v10"),
            bot_token: env_string("DISCORD_BOT_TOKEN", ""),
            application_id: env_string("DISCORD_APPLICATION_ID", ""),
        }
    }
}

/// Aggregated configuration for the worker binary.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    pub kv: KvConfig,
    pub engine: EngineConfig,
    pub bucket: BucketConfig,
    pub health: HealthConfig,
    pub discord: DiscordConfig,
    pub idempotency_ttl: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let broker = BrokerConfig::from_env();
        let kv = KvConfig::from_env(&broker);
        Self {
            broker,
            kv,
            engine: EngineConfig::from_env(),
            bucket: BucketConfig::from_env(),
            health: HealthConfig::from_env(),
            discord: DiscordConfig::from_env(),
            idempotency_ttl: Duration::from_secs(env_parse("IDEMPOTENCY_TTL_SEC", 86_400)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn defaults_match_contract() {
        let _guard = env_lock().lock().unwrap();
        for name in [
            "BROKER_URL",
            "EVENT_PREFETCH",
            "ENGINE_CONCURRENCY",
            "GLOBAL_BUCKET_REFILL_RATE",
            "IDEMPOTENCY_TTL_SEC",
        ] {
            unsafe { std::env::remove_var(name) };
        }
        let cfg = WorkerConfig::from_env();
        assert_eq!(cfg.broker.event_prefetch, 10);
        assert_eq!(cfg.broker.interaction_prefetch, 5);
        assert_eq!(cfg.engine.concurrency, 5);
        assert_eq!(cfg.engine.rate_limit_max, 10);
        assert_eq!(cfg.engine.max_attempts, 3);
        assert_eq!(cfg.bucket.refill_rate, 50.0);
        assert_eq!(cfg.idempotency_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn env_overrides_and_floors_apply() {
        let _guard = env_lock().lock().unwrap();
        unsafe {
            std::env::set_var("ENGINE_CONCURRENCY", "0");
            std::env::set_var("ENGINE_RATE_LIMIT_MAX", "25");
        }
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.concurrency, 1);
        assert_eq!(cfg.rate_limit_max, 25);
        unsafe {
            std::env::remove_var("ENGINE_CONCURRENCY");
            std::env::remove_var("ENGINE_RATE_LIMIT_MAX");
        }
    }
}
