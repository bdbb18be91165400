use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::Config;

/// One SNMP parameter configured for a target. Parameters without a
/// usable OID are ingest-only: accepted over HTTP, never polled.
#[derive(Debug, Clone)]
pub struct TargetParameter {
    pub name: String,
    pub oid: Option<String>,
}

/// A host subject to periodic SNMP polling and/or HTTP ingestion.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub address: String,
    pub port: u16,
    pub community: String,
    pub poll_interval: Duration,
    pub parameters: Vec<TargetParameter>,
}

impl Target {
    /// A target is pollable when it has a community string and at least
    /// one parameter with a valid OID.
    pub fn is_pollable(&self) -> bool {
        !self.community.is_empty() && self.parameters.iter().any(|p| p.oid.is_some())
    }
}

/// Defaults applied to file entries that omit optional fields.
#[derive(Debug, Clone)]
pub struct RegistryDefaults {
    pub community: String,
    pub port: u16,
    pub poll_interval: Duration,
}

impl RegistryDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            community: config.snmp_default_community.clone(),
            port: config.snmp_default_port,
            poll_interval: config.tick_interval(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TargetFileEntry {
    host: String,
    address: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    community: Option<String>,
    #[serde(default)]
    poll_interval_seconds: Option<u64>,
    #[serde(default)]
    parameters: Vec<ParameterFileEntry>,
}

#[derive(Debug, Deserialize)]
struct ParameterFileEntry {
    name: String,
    #[serde(default)]
    oid: Option<String>,
}

struct RegistryState {
    targets: Vec<Arc<Target>>,
    by_host: HashMap<String, Arc<Target>>,
    last_dispatched: HashMap<String, Instant>,
}

/// Read-mostly cache over the external target configuration store (a JSON
/// document owned by the admin tooling). `refresh` reloads without
/// restarting the scheduler; a failed reload keeps the previous state.
pub struct TargetRegistry {
    path: PathBuf,
    defaults: RegistryDefaults,
    inner: RwLock<RegistryState>,
}

impl TargetRegistry {
    pub fn load(path: impl Into<PathBuf>, defaults: RegistryDefaults) -> Result<Self> {
        let path = path.into();
        let targets = if path.exists() {
            read_targets(&path, &defaults)?
        } else {
            tracing::warn!(path = %path.display(), "targets file not found, starting empty");
            Vec::new()
        };
        tracing::info!(
            path = %path.display(),
            targets = targets.len(),
            pollable = targets.iter().filter(|t| t.is_pollable()).count(),
            "target registry loaded"
        );
        Ok(Self {
            path,
            defaults,
            inner: RwLock::new(RegistryState {
                by_host: index_by_host(&targets),
                targets,
                last_dispatched: HashMap::new(),
            }),
        })
    }

    /// Reloads the targets file. Dispatch bookkeeping is retained for
    /// hosts that survive the reload so cadence is unaffected.
    pub async fn refresh(&self) -> Result<usize> {
        let targets = read_targets(&self.path, &self.defaults)?;
        let by_host = index_by_host(&targets);
        let count = targets.len();

        let mut state = self.inner.write().await;
        state.last_dispatched.retain(|host, _| by_host.contains_key(host));
        state.targets = targets;
        state.by_host = by_host;
        tracing::info!(targets = count, "target registry refreshed");
        Ok(count)
    }

    /// Parameter names configured for a host, or `None` when the host is
    /// not in the registry at all. Includes ingest-only parameters.
    pub async fn lookup_parameters(&self, host: &str) -> Option<HashSet<String>> {
        let state = self.inner.read().await;
        state
            .by_host
            .get(host)
            .map(|target| target.parameters.iter().map(|p| p.name.clone()).collect())
    }

    /// Pollable targets whose interval has elapsed, in file order. Each
    /// returned target is marked dispatched: there is no retry within a
    /// tick, so a failed poll waits for the next interval like any other.
    pub async fn due_targets(&self, now: Instant) -> Vec<Arc<Target>> {
        let mut state = self.inner.write().await;
        let mut due = Vec::new();
        for target in &state.targets {
            if !target.is_pollable() {
                continue;
            }
            let elapsed = state
                .last_dispatched
                .get(&target.host)
                .map(|last| now.duration_since(*last));
            if elapsed.map_or(true, |gap| gap >= target.poll_interval) {
                due.push(target.clone());
            }
        }
        for target in &due {
            state.last_dispatched.insert(target.host.clone(), now);
        }
        due
    }

    pub async fn target_count(&self) -> usize {
        self.inner.read().await.targets.len()
    }

    pub async fn pollable_count(&self) -> usize {
        self.inner
            .read()
            .await
            .targets
            .iter()
            .filter(|t| t.is_pollable())
            .count()
    }
}

fn index_by_host(targets: &[Arc<Target>]) -> HashMap<String, Arc<Target>> {
    let mut by_host = HashMap::with_capacity(targets.len());
    for target in targets {
        by_host.insert(target.host.clone(), target.clone());
    }
    by_host
}

fn read_targets(path: &Path, defaults: &RegistryDefaults) -> Result<Vec<Arc<Target>>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read targets file {}", path.display()))?;
    let entries: Vec<TargetFileEntry> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse targets file {}", path.display()))?;

    let mut targets: Vec<Arc<Target>> = Vec::with_capacity(entries.len());
    let mut seen = HashSet::new();
    for entry in entries {
        let host = entry.host.trim().to_string();
        let address = entry.address.trim().to_string();
        if host.is_empty() || address.is_empty() {
            tracing::warn!(host = %entry.host, "skipping target without host or address");
            continue;
        }
        if !seen.insert(host.clone()) {
            tracing::warn!(host = %host, "duplicate target entry ignored");
            continue;
        }

        let mut parameters = Vec::with_capacity(entry.parameters.len());
        for parameter in entry.parameters {
            let name = parameter.name.trim().to_string();
            if name.is_empty() {
                tracing::warn!(host = %host, "skipping unnamed parameter");
                continue;
            }
            let oid = parameter
                .oid
                .as_deref()
                .map(str::trim)
                .filter(|raw| !raw.is_empty())
                .map(str::to_string);
            let oid = match oid {
                Some(raw) if !is_valid_oid(&raw) => {
                    tracing::warn!(host = %host, parameter = %name, oid = %raw,
                        "invalid OID, parameter is ingest-only");
                    None
                }
                other => other,
            };
            parameters.push(TargetParameter { name, oid });
        }

        targets.push(Arc::new(Target {
            host,
            address,
            port: entry.port.unwrap_or(defaults.port),
            community: entry
                .community
                .unwrap_or_else(|| defaults.community.clone()),
            poll_interval: entry
                .poll_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            parameters,
        }));
    }
    Ok(targets)
}

/// Dotted numeric notation with at least two segments, e.g.
/// `1.3.6.1.2.1.1.3.0`.
fn is_valid_oid(raw: &str) -> bool {
    let trimmed = raw.trim_start_matches('.');
    let mut segments = 0;
    for segment in trimmed.split('.') {
        if segment.is_empty() || segment.parse::<u32>().is_err() {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn defaults() -> RegistryDefaults {
        RegistryDefaults {
            community: "public".to_string(),
            port: 161,
            poll_interval: Duration::from_secs(60),
        }
    }

    fn write_targets(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const TWO_TARGETS: &str = r#"[
        {
            "host": "router1",
            "address": "192.0.2.1",
            "parameters": [
                {"name": "CPU", "oid": "1.3.6.1.4.1.2021.11.10.0"},
                {"name": "Memory", "oid": "1.3.6.1.4.1.2021.4.6.0"}
            ]
        },
        {
            "host": "switch1",
            "address": "192.0.2.2",
            "port": 1161,
            "community": "ops",
            "poll_interval_seconds": 120,
            "parameters": [
                {"name": "Uptime", "oid": "1.3.6.1.2.1.1.3.0"},
                {"name": "Temperature"}
            ]
        }
    ]"#;

    #[tokio::test]
    async fn load_applies_defaults_and_indexes_hosts() {
        let file = write_targets(TWO_TARGETS);
        let registry = TargetRegistry::load(file.path(), defaults()).unwrap();

        assert_eq!(registry.target_count().await, 2);
        assert_eq!(registry.pollable_count().await, 2);

        let due = registry.due_targets(Instant::now()).await;
        let router = due.iter().find(|t| t.host == "router1").unwrap();
        assert_eq!(router.port, 161);
        assert_eq!(router.community, "public");
        assert_eq!(router.poll_interval, Duration::from_secs(60));

        let switch = due.iter().find(|t| t.host == "switch1").unwrap();
        assert_eq!(switch.port, 1161);
        assert_eq!(switch.community, "ops");
        assert_eq!(switch.poll_interval, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn lookup_includes_ingest_only_parameters() {
        let file = write_targets(TWO_TARGETS);
        let registry = TargetRegistry::load(file.path(), defaults()).unwrap();

        let parameters = registry.lookup_parameters("switch1").await.unwrap();
        assert!(parameters.contains("Uptime"));
        assert!(parameters.contains("Temperature"));
        assert!(registry.lookup_parameters("nowhere").await.is_none());
    }

    #[tokio::test]
    async fn due_targets_honours_per_target_cadence() {
        let file = write_targets(TWO_TARGETS);
        let registry = TargetRegistry::load(file.path(), defaults()).unwrap();
        let start = Instant::now();

        let first = registry.due_targets(start).await;
        assert_eq!(first.len(), 2);

        // Nothing is due again at the same instant.
        assert!(registry.due_targets(start).await.is_empty());

        // router1 polls every 60s, switch1 every 120s.
        let after_minute = start + Duration::from_secs(60);
        let second: Vec<String> = registry
            .due_targets(after_minute)
            .await
            .iter()
            .map(|t| t.host.clone())
            .collect();
        assert_eq!(second, vec!["router1".to_string()]);

        let after_two = start + Duration::from_secs(120);
        let third: Vec<String> = registry
            .due_targets(after_two)
            .await
            .iter()
            .map(|t| t.host.clone())
            .collect();
        assert_eq!(third, vec!["router1".to_string(), "switch1".to_string()]);
    }

    #[tokio::test]
    async fn unpollable_targets_are_ingest_only() {
        let file = write_targets(
            r#"[
                {
                    "host": "agentless",
                    "address": "192.0.2.9",
                    "community": "",
                    "parameters": [{"name": "CPU", "oid": "1.3.6.1.4.1.2021.11.10.0"}]
                },
                {
                    "host": "no-oids",
                    "address": "192.0.2.10",
                    "parameters": [{"name": "CPU", "oid": "not-an-oid"}]
                }
            ]"#,
        );
        let registry = TargetRegistry::load(file.path(), defaults()).unwrap();

        assert_eq!(registry.target_count().await, 2);
        assert_eq!(registry.pollable_count().await, 0);
        assert!(registry.due_targets(Instant::now()).await.is_empty());
        assert!(registry.lookup_parameters("agentless").await.is_some());
        assert!(registry
            .lookup_parameters("no-oids")
            .await
            .unwrap()
            .contains("CPU"));
    }

    #[tokio::test]
    async fn refresh_picks_up_edits_and_survives_parse_failure() {
        let file = write_targets(TWO_TARGETS);
        let registry = TargetRegistry::load(file.path(), defaults()).unwrap();
        let start = Instant::now();
        assert_eq!(registry.due_targets(start).await.len(), 2);

        std::fs::write(
            file.path(),
            r#"[
                {
                    "host": "router1",
                    "address": "192.0.2.1",
                    "parameters": [{"name": "CPU", "oid": "1.3.6.1.4.1.2021.11.10.0"}]
                },
                {
                    "host": "firewall1",
                    "address": "192.0.2.3",
                    "parameters": [{"name": "Sessions", "oid": "1.3.6.1.4.1.9.9.147.1.2.2.2.1.5"}]
                }
            ]"#,
        )
        .unwrap();
        assert_eq!(registry.refresh().await.unwrap(), 2);

        // router1 keeps its dispatch bookkeeping, the new target is due.
        let due: Vec<String> = registry
            .due_targets(start + Duration::from_secs(1))
            .await
            .iter()
            .map(|t| t.host.clone())
            .collect();
        assert_eq!(due, vec!["firewall1".to_string()]);
        assert!(registry.lookup_parameters("switch1").await.is_none());

        std::fs::write(file.path(), "not json").unwrap();
        assert!(registry.refresh().await.is_err());
        assert_eq!(registry.target_count().await, 2);
        assert!(registry.lookup_parameters("firewall1").await.is_some());
    }

    #[test]
    fn oid_validation() {
        assert!(is_valid_oid("1.3.6.1.2.1.1.3.0"));
        assert!(is_valid_oid(".1.3.6"));
        assert!(!is_valid_oid("1"));
        assert!(!is_valid_oid("1..3"));
        assert!(!is_valid_oid("1.3.x"));
        assert!(!is_valid_oid(""));
    }
}
