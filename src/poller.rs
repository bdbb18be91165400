use crate::error::PollError;
use crate::registry::Target;
use crate::sample::Sample;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Outcome for a single parameter that could not be read.
#[derive(Debug, Clone)]
pub struct ParameterError {
    pub parameter: String,
    pub error: PollError,
}

/// Everything one target produced during a tick: a sample per readable
/// parameter plus an error per failed one. Partial failure is normal.
#[derive(Debug, Default, Clone)]
pub struct TargetReport {
    pub host: String,
    pub samples: Vec<Sample>,
    pub errors: Vec<ParameterError>,
}

/// Seam between the scheduler and the concrete poll transport.
pub trait TargetPoller: Send + Sync + 'static {
    fn poll(
        &self,
        target: Arc<Target>,
        timestamp: i64,
    ) -> impl Future<Output = TargetReport> + Send;
}

/// SNMP v2c poller. Sessions are synchronous, so each target is polled on
/// the blocking pool; parameters within a target are read sequentially
/// while distinct targets proceed independently.
pub struct SnmpPoller {
    timeout: Duration,
}

impl SnmpPoller {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl TargetPoller for SnmpPoller {
    async fn poll(&self, target: Arc<Target>, timestamp: i64) -> TargetReport {
        let timeout = self.timeout;
        let host = target.host.clone();
        match tokio::task::spawn_blocking(move || poll_target_blocking(&target, timestamp, timeout))
            .await
        {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(host = %host, error = %err, "snmp poll task failed");
                TargetReport {
                    host,
                    ..TargetReport::default()
                }
            }
        }
    }
}

fn poll_target_blocking(target: &Target, timestamp: i64, timeout: Duration) -> TargetReport {
    let mut report = TargetReport {
        host: target.host.clone(),
        ..TargetReport::default()
    };
    let pollable: Vec<(&str, &str)> = target
        .parameters
        .iter()
        .filter_map(|p| p.oid.as_deref().map(|oid| (p.name.as_str(), oid)))
        .collect();
    if pollable.is_empty() {
        return report;
    }

    let mut session = match snmp::SyncSession::new(
        (target.address.as_str(), target.port),
        target.community.as_bytes(),
        Some(timeout),
        0,
    ) {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(host = %target.host, error = %err, "snmp session init failed");
            for (name, _) in pollable {
                report.errors.push(ParameterError {
                    parameter: name.to_string(),
                    error: PollError::NoResponse,
                });
            }
            return report;
        }
    };

    for (name, oid) in pollable {
        match get_parameter(&mut session, oid) {
            Ok(value) => report.samples.push(Sample {
                host: target.host.clone(),
                parameter: name.to_string(),
                value,
                timestamp,
            }),
            Err(error) => report.errors.push(ParameterError {
                parameter: name.to_string(),
                error,
            }),
        }
    }
    report
}

fn get_parameter(session: &mut snmp::SyncSession, raw_oid: &str) -> Result<f64, PollError> {
    let oid = parse_oid(raw_oid)?;
    let mut pdu = session.get(&oid).map_err(map_snmp_error)?;
    match pdu.varbinds.next() {
        Some((_name, value)) => decode_value(&value),
        None => Err(PollError::NoResponse),
    }
}

pub(crate) fn parse_oid(raw: &str) -> Result<Vec<u32>, PollError> {
    let trimmed = raw.trim().trim_start_matches('.');
    let mut parts = Vec::new();
    for part in trimmed.split('.') {
        if part.is_empty() {
            continue;
        }
        parts.push(
            part.parse::<u32>()
                .map_err(|_| PollError::MalformedReply(format!("invalid OID segment {part}")))?,
        );
    }
    if parts.is_empty() {
        Err(PollError::MalformedReply("empty OID".to_string()))
    } else {
        Ok(parts)
    }
}

fn map_snmp_error(err: snmp::SnmpError) -> PollError {
    match err {
        snmp::SnmpError::ReceiveError => PollError::Timeout,
        snmp::SnmpError::SendError => PollError::NoResponse,
        other => PollError::MalformedReply(format!("{other:?}")),
    }
}

fn decode_value(value: &snmp::Value<'_>) -> Result<f64, PollError> {
    match value {
        snmp::Value::Integer(v) => Ok(*v as f64),
        snmp::Value::Counter32(v) => Ok(*v as f64),
        snmp::Value::Unsigned32(v) => Ok(*v as f64),
        snmp::Value::Timeticks(v) => Ok(*v as f64),
        snmp::Value::Counter64(v) => Ok(*v as f64),
        snmp::Value::Boolean(v) => Ok(if *v { 1.0 } else { 0.0 }),
        snmp::Value::OctetString(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let trimmed = text.trim();
            trimmed.parse::<f64>().map_err(|_| {
                PollError::MalformedReply(format!("non-numeric octet string {trimmed:?}"))
            })
        }
        snmp::Value::IpAddress(octets) => Ok(u32::from_be_bytes(*octets) as f64),
        snmp::Value::NoSuchObject | snmp::Value::NoSuchInstance | snmp::Value::EndOfMibView => {
            Err(PollError::NoResponse)
        }
        snmp::Value::Null => Err(PollError::MalformedReply("null value".to_string())),
        _ => Err(PollError::MalformedReply("unsupported value type".to_string())),
    }
}
