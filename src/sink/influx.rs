use super::SinkBackend;
use crate::config::Config;
use crate::error::WriteError;
use crate::sample::Sample;
use anyhow::Result;
use std::collections::BTreeMap;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// InfluxDB v1 write path. Samples are encoded as line protocol with
/// second precision; database, retention policy and credentials come from
/// config.
pub struct InfluxBackend {
    client: reqwest::Client,
    write_url: String,
    query: Vec<(&'static str, String)>,
    username: Option<String>,
    password: Option<String>,
    measurement: String,
}

impl InfluxBackend {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let write_url = format!("{}/write", config.influx_url.trim_end_matches('/'));
        let mut query = vec![
            ("db", config.influx_database.clone()),
            ("precision", "s".to_string()),
        ];
        if let Some(policy) = &config.influx_retention_policy {
            query.push(("rp", policy.clone()));
        }
        Ok(Self {
            client,
            write_url,
            query,
            username: config.influx_username.clone(),
            password: config.influx_password.clone(),
            measurement: config.influx_measurement.clone(),
        })
    }
}

impl SinkBackend for InfluxBackend {
    async fn write(&self, samples: &[Sample]) -> Result<(), WriteError> {
        let body = encode_line_protocol(&self.measurement, samples);
        if body.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&self.query)
            .body(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|err| WriteError::Transient(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(WriteError::Transient(format!("{status}: {detail}")))
        } else {
            Err(WriteError::Rejected(format!("{status}: {detail}")))
        }
    }
}

/// Encodes a batch as InfluxDB line protocol. Samples sharing a host and
/// timestamp collapse into one point tagged with the host, one field per
/// parameter, so a polled or posted batch for a host lands as a single
/// row per timestamp.
pub fn encode_line_protocol(measurement: &str, samples: &[Sample]) -> String {
    let mut groups: BTreeMap<(&str, i64), BTreeMap<&str, f64>> = BTreeMap::new();
    for sample in samples {
        groups
            .entry((sample.host.as_str(), sample.timestamp))
            .or_default()
            .insert(sample.parameter.as_str(), sample.value);
    }

    let mut out = String::new();
    for ((host, timestamp), fields) in groups {
        out.push_str(&escape_measurement(measurement));
        out.push_str(",host=");
        out.push_str(&escape_key(host));
        out.push(' ');
        let mut first = true;
        for (name, value) in fields {
            if !first {
                out.push(',');
            }
            first = false;
            out.push_str(&escape_key(name));
            out.push('=');
            out.push_str(&value.to_string());
        }
        out.push(' ');
        out.push_str(&timestamp.to_string());
        out.push('\n');
    }
    out
}

fn escape_measurement(raw: &str) -> String {
    raw.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag values and field keys share the same escaping rules.
fn escape_key(raw: &str) -> String {
    raw.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
