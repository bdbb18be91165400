use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What happens when a scheduler tick fires while the previous one is
/// still dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Skip the new tick entirely; no additional polls are issued.
    Skip,
    /// Let ticks run concurrently.
    Concurrent,
}

impl FromStr for OverlapPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(OverlapPolicy::Skip),
            "concurrent" => Ok(OverlapPolicy::Concurrent),
            other => Err(anyhow!("unknown overlap policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind: String,
    pub targets_path: PathBuf,

    pub influx_url: String,
    pub influx_database: String,
    pub influx_retention_policy: Option<String>,
    pub influx_username: Option<String>,
    pub influx_password: Option<String>,
    pub influx_measurement: String,

    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub write_retry_limit: u32,
    pub write_backoff_ms: u64,
    pub write_backoff_max_ms: u64,

    pub tick_interval_secs: u64,
    pub tick_deadline_secs: u64,
    pub poll_concurrency: usize,
    pub overlap_policy: OverlapPolicy,

    pub snmp_timeout_ms: u64,
    pub snmp_default_community: String,
    pub snmp_default_port: u16,

    pub timestamp_max_age_secs: i64,
    pub timestamp_max_ahead_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let http_bind = env_string("COLLECTOR_HTTP_BIND", Some("127.0.0.1:9090".to_string()))?;
        let targets_path = PathBuf::from(env_string(
            "COLLECTOR_TARGETS_PATH",
            Some("/etc/telemetry-collector/targets.json".to_string()),
        )?);

        let influx_url = env_string(
            "COLLECTOR_INFLUX_URL",
            Some("http://127.0.0.1:8086".to_string()),
        )?;
        let influx_database =
            env_string("COLLECTOR_INFLUX_DATABASE", Some("monitoring".to_string()))?;
        let influx_retention_policy = env_optional("COLLECTOR_INFLUX_RETENTION_POLICY");
        let influx_username = env_optional("COLLECTOR_INFLUX_USERNAME");
        let influx_password = env_optional("COLLECTOR_INFLUX_PASSWORD");
        let influx_measurement =
            env_string("COLLECTOR_INFLUX_MEASUREMENT", Some("samples".to_string()))?;

        let batch_size = env_u64("COLLECTOR_BATCH_SIZE", Some(500))? as usize;
        let flush_interval_ms = env_u64("COLLECTOR_FLUSH_INTERVAL_MS", Some(750))?;
        let max_queue = env_u64(
            "COLLECTOR_MAX_QUEUE",
            Some(batch_size.saturating_mul(10) as u64),
        )? as usize;
        let write_retry_limit = env_u64("COLLECTOR_WRITE_RETRY_LIMIT", Some(3))? as u32;
        let write_backoff_ms = env_u64("COLLECTOR_WRITE_BACKOFF_MS", Some(250))?;
        let write_backoff_max_ms = env_u64("COLLECTOR_WRITE_BACKOFF_MAX_MS", Some(5000))?;

        let tick_interval_secs = env_u64("COLLECTOR_TICK_INTERVAL_SECONDS", Some(60))?;
        let tick_deadline_secs = env_u64("COLLECTOR_TICK_DEADLINE_SECONDS", Some(45))?;
        let poll_concurrency = env_u64("COLLECTOR_POLL_CONCURRENCY", Some(8))?.max(1) as usize;
        let overlap_policy = env_string("COLLECTOR_OVERLAP_POLICY", Some("skip".to_string()))?
            .parse::<OverlapPolicy>()
            .context("invalid COLLECTOR_OVERLAP_POLICY")?;

        let snmp_timeout_ms = env_u64("COLLECTOR_SNMP_TIMEOUT_MS", Some(3000))?;
        let snmp_default_community =
            env_string("COLLECTOR_SNMP_COMMUNITY", Some("public".to_string()))?;
        let snmp_default_port = env_u64("COLLECTOR_SNMP_PORT", Some(161))? as u16;

        let timestamp_max_age_secs =
            env_u64("COLLECTOR_TIMESTAMP_MAX_AGE_SECONDS", Some(30 * 86_400))? as i64;
        let timestamp_max_ahead_secs =
            env_u64("COLLECTOR_TIMESTAMP_MAX_AHEAD_SECONDS", Some(300))? as i64;

        if batch_size == 0 {
            return Err(anyhow!("COLLECTOR_BATCH_SIZE must be positive"));
        }
        if max_queue == 0 {
            return Err(anyhow!("COLLECTOR_MAX_QUEUE must be positive"));
        }
        if write_retry_limit == 0 {
            return Err(anyhow!("COLLECTOR_WRITE_RETRY_LIMIT must be positive"));
        }

        Ok(Self {
            http_bind,
            targets_path,
            influx_url,
            influx_database,
            influx_retention_policy,
            influx_username,
            influx_password,
            influx_measurement,
            batch_size,
            flush_interval_ms,
            max_queue,
            write_retry_limit,
            write_backoff_ms,
            write_backoff_max_ms,
            tick_interval_secs,
            tick_deadline_secs,
            poll_concurrency,
            overlap_policy,
            snmp_timeout_ms,
            snmp_default_community,
            snmp_default_port,
            timestamp_max_age_secs,
            timestamp_max_ahead_secs,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }

    pub fn write_backoff_max(&self) -> Duration {
        Duration::from_millis(self.write_backoff_max_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn tick_deadline(&self) -> Duration {
        Duration::from_secs(self.tick_deadline_secs)
    }

    pub fn snmp_timeout(&self) -> Duration {
        Duration::from_millis(self.snmp_timeout_ms)
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_policy_parses() {
        assert_eq!("skip".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Skip);
        assert_eq!(
            " Concurrent ".parse::<OverlapPolicy>().unwrap(),
            OverlapPolicy::Concurrent
        );
        assert!("both".parse::<OverlapPolicy>().is_err());
    }
}
