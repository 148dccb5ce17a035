//! Service configuration from environment variables.
//!
//! Every knob has a default; a value that does not parse is logged and the
//! default is used instead, so a typo never keeps the service from starting.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use wager_core::{Currency, FeeBps};
use wager_events::TopicConfig;
use wager_matchmaking::WideningPolicy;

use crate::ledger_engine::LedgerConfig;
use crate::matchmaker::QueueConfig;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub ledger: LedgerConfig,
    pub queue: QueueConfig,
    pub topics: TopicConfig,
    /// Pause between background matching cycles.
    pub matcher_interval: Duration,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub bind_addr: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            queue: QueueConfig::default(),
            topics: TopicConfig::default(),
            matcher_interval: Duration::from_millis(250),
            use_persistent_stores: false,
            database_url: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = ServiceConfig::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let currency = parsed(&get, "WAGER_CURRENCY", d.ledger.currency, |v| {
            Currency::from_str(v).map_err(|e| e.to_string())
        });
        let fee_bps = parsed(&get, "WAGER_FEE_BPS", d.ledger.fee_bps, |v| {
            let bps = v.parse::<u32>().map_err(|e| e.to_string())?;
            FeeBps::new(bps).map_err(|e| e.to_string())
        });
        let ledger = LedgerConfig {
            currency,
            fee_bps,
            max_attempts: parsed(&get, "WAGER_LEDGER_MAX_ATTEMPTS", d.ledger.max_attempts, positive),
            base_backoff: parsed(&get, "WAGER_LEDGER_BACKOFF_MS", d.ledger.base_backoff, millis),
        };

        let widening = WideningPolicy {
            enabled: parsed(&get, "WAGER_WIDENING_ENABLED", d.queue.widening.enabled, flag),
            after: parsed(&get, "WAGER_WIDENING_AFTER_SECS", d.queue.widening.after, secs),
            step_every: parsed(&get, "WAGER_WIDENING_STEP_SECS", d.queue.widening.step_every, secs),
            max_steps: parsed(&get, "WAGER_WIDENING_MAX_STEPS", d.queue.widening.max_steps, |v| {
                v.parse::<u32>().map_err(|e| e.to_string())
            }),
        };
        let queue = QueueConfig {
            lock_lease: parsed(&get, "WAGER_MATCH_LOCK_LEASE_MS", d.queue.lock_lease, millis),
            max_attempts: parsed(&get, "WAGER_MATCHER_MAX_ATTEMPTS", d.queue.max_attempts, positive),
            widening,
            ticket_retention: parsed(&get, "WAGER_TICKET_RETENTION_SECS", d.queue.ticket_retention, secs),
            escrow_redrive_after: parsed(
                &get,
                "WAGER_ESCROW_RESUME_AFTER_SECS",
                d.queue.escrow_redrive_after,
                secs,
            ),
        };

        let topics = TopicConfig {
            match_lifecycle: get("WAGER_MATCH_TOPIC").unwrap_or(d.topics.match_lifecycle),
            server_lifecycle: get("WAGER_SERVER_TOPIC").unwrap_or(d.topics.server_lifecycle),
        };

        Self {
            ledger,
            queue,
            topics,
            matcher_interval: parsed(&get, "WAGER_MATCHER_INTERVAL_MS", d.matcher_interval, millis),
            use_persistent_stores: parsed(&get, "USE_PERSISTENT_STORES", d.use_persistent_stores, flag),
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL").unwrap_or(d.redis_url),
            bind_addr: get("BIND_ADDR").unwrap_or(d.bind_addr),
        }
    }
}

fn parsed<T, G, P>(get: &G, key: &str, default: T, parse: P) -> T
where
    G: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Result<T, String>,
{
    let Some(raw) = get(key) else {
        return default;
    };
    match parse(raw.trim()) {
        Ok(value) => value,
        Err(reason) => {
            warn!(key, value = %raw, %reason, "invalid configuration value, using default");
            default
        }
    }
}

fn flag(v: &str) -> Result<bool, String> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("not a boolean: {other}")),
    }
}

fn positive(v: &str) -> Result<u32, String> {
    match v.parse::<u32>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn millis(v: &str) -> Result<Duration, String> {
    v.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| e.to_string())
}

fn secs(v: &str) -> Result<Duration, String> {
    v.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| e.to_string())
}
