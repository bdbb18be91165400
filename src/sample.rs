use chrono::Utc;

/// One monitoring data point bound for the time-series sink. Immutable
/// once created; produced by the ingestion validator or the SNMP poller.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub host: String,
    pub parameter: String,
    pub value: f64,
    pub timestamp: i64,
}

/// Current time as epoch seconds.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Epoch seconds truncated to the start of the minute. Polled samples for
/// one tick all carry the same minute-aligned timestamp so that every
/// parameter of a host lands in the same point.
pub fn minute_epoch(epoch: i64) -> i64 {
    epoch - epoch.rem_euclid(60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minute_epoch_truncates() {
        assert_eq!(minute_epoch(1_500_000_059), 1_500_000_000);
        assert_eq!(minute_epoch(1_500_000_000), 1_500_000_000);
        assert_eq!(minute_epoch(59), 0);
    }
}
