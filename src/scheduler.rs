use crate::config::{Config, OverlapPolicy};
use crate::error::PollError;
use crate::poller::{TargetPoller, TargetReport};
use crate::registry::TargetRegistry;
use crate::sample::{minute_epoch, now_epoch};
use crate::sink::SinkHandle;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub deadline: Duration,
    pub concurrency: usize,
    pub overlap_policy: OverlapPolicy,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            deadline: config.tick_deadline(),
            concurrency: config.poll_concurrency,
            overlap_policy: config.overlap_policy,
        }
    }
}

/// What one tick did. Abandoned targets are those still in flight when
/// the deadline elapsed; they count as poll errors.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub skipped: bool,
    pub due: usize,
    pub completed: usize,
    pub abandoned: usize,
    pub samples: usize,
    pub poll_errors: usize,
    pub sink_rejected: usize,
}

#[derive(Default)]
struct TickAcc {
    completed: HashSet<String>,
    samples: usize,
    poll_errors: usize,
    sink_rejected: usize,
}

/// Drives polling: each tick asks the registry for due targets, fans out
/// polls under a concurrency bound, and forwards samples to the sink.
/// `run_tick` is the entry point; the built-in interval loop in `start`
/// is just one way of calling it on a cadence.
pub struct Scheduler<P> {
    registry: Arc<TargetRegistry>,
    poller: Arc<P>,
    sink: SinkHandle,
    config: SchedulerConfig,
    in_flight: tokio::sync::Mutex<()>,
}

impl<P: TargetPoller> Scheduler<P> {
    pub fn new(
        registry: Arc<TargetRegistry>,
        poller: Arc<P>,
        sink: SinkHandle,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            poller,
            sink,
            config,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn run_tick(&self) -> TickReport {
        let _guard = match self.config.overlap_policy {
            OverlapPolicy::Skip => match self.in_flight.try_lock() {
                Ok(guard) => Some(guard),
                Err(_) => {
                    tracing::info!("previous tick still dispatching, skipping");
                    return TickReport {
                        skipped: true,
                        ..TickReport::default()
                    };
                }
            },
            OverlapPolicy::Concurrent => None,
        };

        let due = self.registry.due_targets(Instant::now()).await;
        if due.is_empty() {
            return TickReport::default();
        }
        let timestamp = minute_epoch(now_epoch());

        let acc = Arc::new(Mutex::new(TickAcc::default()));
        let dispatch = futures::stream::iter(due.iter().cloned())
            .map(|target| {
                let poller = self.poller.clone();
                async move { poller.poll(target, timestamp).await }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .for_each(|report| {
                let acc = acc.clone();
                let sink = self.sink.clone();
                async move {
                    collect_target_report(report, &sink, &acc);
                }
            });

        let timed_out = tokio::time::timeout(self.config.deadline, dispatch)
            .await
            .is_err();

        let acc = acc.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let abandoned = if timed_out {
            for target in &due {
                if !acc.completed.contains(&target.host) {
                    tracing::warn!(
                        host = %target.host,
                        kind = PollError::DeadlineExceeded.kind(),
                        "target abandoned for this tick"
                    );
                }
            }
            due.len() - acc.completed.len()
        } else {
            0
        };

        TickReport {
            skipped: false,
            due: due.len(),
            completed: acc.completed.len(),
            abandoned,
            samples: acc.samples,
            poll_errors: acc.poll_errors + abandoned,
            sink_rejected: acc.sink_rejected,
        }
    }

    /// Spawns the interval loop. Each tick runs as its own task so a
    /// stuck tick can never delay the timer; the overlap policy decides
    /// what the next firing does about it.
    pub fn start(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let scheduler = self.clone();
                        tokio::spawn(async move {
                            let report = scheduler.run_tick().await;
                            if !report.skipped {
                                tracing::info!(
                                    due = report.due,
                                    completed = report.completed,
                                    abandoned = report.abandoned,
                                    samples = report.samples,
                                    poll_errors = report.poll_errors,
                                    sink_rejected = report.sink_rejected,
                                    "poll tick finished"
                                );
                            }
                        });
                    }
                }
            }
        })
    }
}

fn collect_target_report(report: TargetReport, sink: &SinkHandle, acc: &Mutex<TickAcc>) {
    let mut rejected = 0usize;
    let samples = report.samples.len();
    for sample in report.samples {
        if let Err(err) = sink.try_enqueue(sample) {
            rejected += 1;
            tracing::warn!(host = %report.host, error = %err, "dropping polled sample");
        }
    }
    for failure in &report.errors {
        tracing::warn!(
            host = %report.host,
            parameter = %failure.parameter,
            kind = failure.error.kind(),
            "parameter poll failed"
        );
    }

    let mut acc = acc.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    acc.completed.insert(report.host);
    acc.samples += samples - rejected;
    acc.poll_errors += report.errors.len();
    acc.sink_rejected += rejected;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryDefaults, Target, TargetRegistry};
    use crate::sample::Sample;
    use crate::sink::{SinkCommand, SinkStats};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct FakePoller {
        delay: Duration,
        samples_per_target: usize,
        errors_per_target: usize,
        calls: AtomicUsize,
    }

    impl FakePoller {
        fn new(delay: Duration, samples_per_target: usize, errors_per_target: usize) -> Self {
            Self {
                delay,
                samples_per_target,
                errors_per_target,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TargetPoller for FakePoller {
        async fn poll(&self, target: Arc<Target>, timestamp: i64) -> TargetReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let samples = (0..self.samples_per_target)
                .map(|i| Sample {
                    host: target.host.clone(),
                    parameter: format!("p{i}"),
                    value: i as f64,
                    timestamp,
                })
                .collect();
            let errors = (0..self.errors_per_target)
                .map(|i| crate::poller::ParameterError {
                    parameter: format!("broken{i}"),
                    error: PollError::Timeout,
                })
                .collect();
            TargetReport {
                host: target.host.clone(),
                samples,
                errors,
            }
        }
    }

    fn registry_with_always_due_targets(count: usize) -> Arc<TargetRegistry> {
        let entries: Vec<String> = (0..count)
            .map(|i| {
                format!(
                    r#"{{
                        "host": "host{i}",
                        "address": "192.0.2.{i}",
                        "poll_interval_seconds": 0,
                        "parameters": [{{"name": "CPU", "oid": "1.3.6.1.4.1.2021.11.10.0"}}]
                    }}"#
                )
            })
            .collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[{}]", entries.join(",")).unwrap();
        file.flush().unwrap();
        let defaults = RegistryDefaults {
            community: "public".to_string(),
            port: 161,
            poll_interval: Duration::from_secs(60),
        };
        // The file is only read during load; tests never refresh.
        Arc::new(TargetRegistry::load(file.path(), defaults).unwrap())
    }

    fn scheduler_config(deadline: Duration, overlap_policy: OverlapPolicy) -> SchedulerConfig {
        SchedulerConfig {
            deadline,
            concurrency: 4,
            overlap_policy,
        }
    }

    fn sink(capacity: usize) -> (SinkHandle, mpsc::Receiver<SinkCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (SinkHandle::new(tx, Arc::new(SinkStats::new())), rx)
    }

    #[tokio::test]
    async fn tick_polls_due_targets_and_forwards_samples() {
        let registry = registry_with_always_due_targets(2);
        let poller = Arc::new(FakePoller::new(Duration::ZERO, 2, 1));
        let (sink, mut rx) = sink(100);
        let scheduler = Scheduler::new(
            registry,
            poller.clone(),
            sink,
            scheduler_config(Duration::from_secs(5), OverlapPolicy::Skip),
        );

        let report = scheduler.run_tick().await;
        assert!(!report.skipped);
        assert_eq!(report.due, 2);
        assert_eq!(report.completed, 2);
        assert_eq!(report.abandoned, 0);
        assert_eq!(report.samples, 4);
        assert_eq!(report.poll_errors, 2);
        assert_eq!(report.sink_rejected, 0);

        let mut delivered = 0;
        while let Ok(cmd) = rx.try_recv() {
            assert!(matches!(cmd, SinkCommand::Sample(_)));
            delivered += 1;
        }
        assert_eq!(delivered, 4);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped_without_issuing_polls() {
        let registry = registry_with_always_due_targets(2);
        let poller = Arc::new(FakePoller::new(Duration::from_millis(200), 1, 0));
        let (sink, _rx) = sink(100);
        let scheduler = Arc::new(Scheduler::new(
            registry,
            poller.clone(),
            sink,
            scheduler_config(Duration::from_secs(5), OverlapPolicy::Skip),
        ));

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_tick().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = scheduler.run_tick().await;
        assert!(second.skipped);
        assert_eq!(poller.calls.load(Ordering::SeqCst), 2);

        let first = first.await.unwrap();
        assert!(!first.skipped);
        assert_eq!(first.completed, 2);
        assert_eq!(poller.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deadline_abandons_stuck_targets_but_not_the_next_tick() {
        let registry = registry_with_always_due_targets(2);
        let poller = Arc::new(FakePoller::new(Duration::from_secs(30), 1, 0));
        let (sink, _rx) = sink(100);
        let scheduler = Scheduler::new(
            registry,
            poller.clone(),
            sink,
            scheduler_config(Duration::from_millis(100), OverlapPolicy::Skip),
        );

        let report = scheduler.run_tick().await;
        assert_eq!(report.due, 2);
        assert_eq!(report.completed, 0);
        assert_eq!(report.abandoned, 2);
        assert_eq!(report.poll_errors, 2);

        // The stuck tick is over; the next one dispatches again.
        let next = scheduler.run_tick().await;
        assert!(!next.skipped);
        assert_eq!(next.due, 2);
    }

    #[tokio::test]
    async fn full_sink_queue_counts_rejected_samples() {
        let registry = registry_with_always_due_targets(1);
        let poller = Arc::new(FakePoller::new(Duration::ZERO, 3, 0));
        let (sink, _rx) = sink(1);
        let scheduler = Scheduler::new(
            registry,
            poller,
            sink,
            scheduler_config(Duration::from_secs(5), OverlapPolicy::Skip),
        );

        let report = scheduler.run_tick().await;
        assert_eq!(report.samples, 1);
        assert_eq!(report.sink_rejected, 2);
    }

    #[tokio::test]
    async fn tick_with_nothing_due_is_a_no_op() {
        let registry = registry_with_always_due_targets(0);
        let poller = Arc::new(FakePoller::new(Duration::ZERO, 1, 0));
        let (sink, _rx) = sink(10);
        let scheduler = Scheduler::new(
            registry,
            poller.clone(),
            sink,
            scheduler_config(Duration::from_secs(5), OverlapPolicy::Skip),
        );

        let report = scheduler.run_tick().await;
        assert_eq!(report, TickReport::default());
        assert_eq!(poller.calls.load(Ordering::SeqCst), 0);
    }
}
