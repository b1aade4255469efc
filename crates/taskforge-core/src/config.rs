//! Top-level configuration and bootstrap for the task subsystem.
//!
//! `Config::from_env()` is the single place defaults are defined; the HTTP
//! adapter and the CLI both start from it rather than reading environment
//! variables themselves.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use taskforge_db::config::DbConfig;

use crate::dispatcher::DispatcherConfig;
use crate::events::DEFAULT_CAPACITY as DEFAULT_EVENT_BUS_CAPACITY;

/// Process-wide configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub dispatcher: DispatcherConfig,
    pub event_bus_capacity: usize,
    pub http_bind_addr: SocketAddr,
    pub db_pool_max_connections: u32,
    pub db_pool_acquire_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let dispatcher = DispatcherConfig {
            poll_interval: duration_secs_env("TASKFORGE_DISPATCH_TICK_SECS", 1),
            idle_backoff: duration_secs_env("TASKFORGE_DISPATCH_BACKOFF_SECS", 5),
            max_concurrency: usize_env("TASKFORGE_DISPATCH_MAX_CONCURRENCY", 4),
            default_task_timeout: duration_secs_env("TASKFORGE_DISPATCH_DEFAULT_TIMEOUT_SECS", 300),
            cancel_grace: duration_secs_env("TASKFORGE_DISPATCH_CANCEL_GRACE_SECS", 5),
            stale_sweep_interval: duration_secs_env("TASKFORGE_DISPATCH_STALE_SWEEP_SECS", 600),
        };

        let http_bind_addr = env::var("TASKFORGE_HTTP_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid TASKFORGE_HTTP_BIND_ADDR: {e}"))?;

        Ok(Self {
            db: DbConfig::from_env(),
            dispatcher,
            event_bus_capacity: usize_env("TASKFORGE_EVENT_BUS_CAPACITY", DEFAULT_EVENT_BUS_CAPACITY),
            http_bind_addr,
            db_pool_max_connections: usize_env("TASKFORGE_DB_POOL_MAX_CONNECTIONS", 10) as u32,
            db_pool_acquire_timeout: duration_secs_env("TASKFORGE_DB_POOL_ACQUIRE_TIMEOUT_SECS", 30),
        })
    }
}

fn usize_env(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn duration_secs_env(key: &str, default_secs: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usize_env_falls_back_to_default_when_unset() {
        assert_eq!(usize_env("TASKFORGE_TEST_NONEXISTENT_VAR", 7), 7);
    }

    #[test]
    fn duration_secs_env_falls_back_to_default_when_unset() {
        assert_eq!(
            duration_secs_env("TASKFORGE_TEST_NONEXISTENT_VAR", 42),
            Duration::from_secs(42)
        );
    }
}
