use chrono::{DateTime, Utc};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    queue::MeasurementQueue,
    stats::DeliveryStats,
    store::{FailureKind, Store},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base_secs: f64,
    max_secs: f64,
    multiplier: f64,
    current_secs: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, multiplier: f64) -> Self {
        let base_secs = base.as_secs_f64();
        Self {
            base_secs,
            max_secs: max.as_secs_f64().max(base_secs),
            multiplier: multiplier.max(1.0),
            current_secs: base_secs,
        }
    }

    pub fn current(&self) -> Duration {
        Duration::from_secs_f64(self.current_secs)
    }

    pub fn current_secs(&self) -> f64 {
        self.current_secs
    }

    pub fn escalate(&mut self) -> Duration {
        self.current_secs = (self.current_secs * self.multiplier).min(self.max_secs);
        self.current()
    }

    pub fn reset(&mut self) {
        self.current_secs = self.base_secs;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Empty,

    Delivered { batch_size: usize },

    /// Dropped.
    Rejected { batch_size: usize },

    Requeued {
        batch_size: usize,
        kind: FailureKind,
        escalated: bool,
    },
}

pub struct Reporter<S> {
    store: S,
    queue: MeasurementQueue,
    stats: DeliveryStats,
    backoff: Backoff,
    failing_since: Option<DateTime<Utc>>,
    shutdown: CancellationToken,
}

impl<S: Store> Reporter<S> {
    pub fn new(
        store: S,
        queue: MeasurementQueue,
        stats: DeliveryStats,
        backoff: Backoff,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue,
            stats,
            backoff,
            failing_since: None,
            shutdown,
        }
    }

    /// Returns how many measurements were still undelivered at exit.
    pub async fn run(mut self) -> usize {
        loop {
            self.report_once().await;

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = sleep(self.backoff.current()) => {}
            }
        }

        self.report_once().await;
        self.store.close().await;

        self.queue.len()
    }

    pub async fn report_once(&mut self) -> Delivery {
        let batch = self.queue.drain_all();
        let Some(first) = batch.first() else {
            return Delivery::Empty;
        };
        let batch_size = batch.len();
        let first_measured_at = first.measured_at;

        match self.store.write(&batch).await {
            Ok(true) => {
                self.stats.record(batch_size);
                self.backoff.reset();
                if let Some(since) = self.failing_since.take() {
                    info!(batch_size, failing_since = %since, "store delivery recovered");
                } else {
                    debug!(batch_size, "delivered batch");
                }
                Delivery::Delivered { batch_size }
            }
            Ok(false) => {
                let since = *self.failing_since.get_or_insert(first_measured_at);
                warn!(
                    batch_size,
                    failing_since = %since,
                    "store did not acknowledge batch, dropping it"
                );
                Delivery::Rejected { batch_size }
            }
            Err(err) => {
                let since = *self.failing_since.get_or_insert(first_measured_at);
                self.queue.requeue(batch);
                error!(
                    batch_size,
                    failing_since = %since,
                    error = %err,
                    "failed to deliver batch, requeued"
                );

                let escalated = match err.kind {
                    FailureKind::Server | FailureKind::Connection => {
                        let interval = self.backoff.escalate();
                        warn!(
                            interval_secs = interval.as_secs_f64(),
                            "resetting store client"
                        );
                        if let Err(err) = self.store.reconnect().await {
                            error!(error = %err, "failed to reset store client");
                        }
                        true
                    }
                    FailureKind::Other => false,
                };

                Delivery::Requeued {
                    batch_size,
                    kind: err.kind,
                    escalated,
                }
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.backoff.current()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn failing_since(&self) -> Option<DateTime<Utc>> {
        self.failing_since
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::{HashSet, VecDeque},
        sync::{Arc, Mutex},
    };

    use chrono::TimeZone;

    use super::*;
    use crate::{
        measurement::{Measurement, Reading},
        stats::{DeliveryEvent, delivery_stats},
        store::StoreError,
    };

    /// What a `ScriptedStore` has seen, shared with the test after the store
    /// has been moved into a reporter.
    #[derive(Debug, Default)]
    pub(crate) struct StoreLog {
        pub delivered: Vec<Vec<Measurement>>,
        pub writes: usize,
        pub reconnects: usize,
        pub creates: usize,
        pub closed: bool,
    }

    /// Plays back scripted write outcomes, then acknowledges everything.
    pub(crate) struct ScriptedStore {
        outcomes: VecDeque<Result<bool, StoreError>>,
        create_fails: bool,
        log: Arc<Mutex<StoreLog>>,
    }

    impl ScriptedStore {
        pub(crate) fn new(
            outcomes: impl IntoIterator<Item = Result<bool, StoreError>>,
        ) -> (Self, Arc<Mutex<StoreLog>>) {
            let log = Arc::new(Mutex::new(StoreLog::default()));
            let store = Self {
                outcomes: outcomes.into_iter().collect(),
                create_fails: false,
                log: log.clone(),
            };
            (store, log)
        }

        pub(crate) fn failing_create_database(mut self) -> Self {
            self.create_fails = true;
            self
        }
    }

    impl Store for ScriptedStore {
        async fn write(&mut self, batch: &[Measurement]) -> Result<bool, StoreError> {
            let outcome = self.outcomes.pop_front().unwrap_or(Ok(true));
            let mut log = self.log.lock().unwrap();
            log.writes += 1;
            if let Ok(true) = outcome {
                log.delivered.push(batch.to_vec());
            }
            outcome
        }

        async fn reconnect(&mut self) -> Result<(), StoreError> {
            self.log.lock().unwrap().reconnects += 1;
            Ok(())
        }

        async fn create_database(&mut self) -> Result<(), StoreError> {
            self.log.lock().unwrap().creates += 1;
            if self.create_fails {
                return Err(StoreError::other("permission denied to create database"));
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.log.lock().unwrap().closed = true;
        }
    }

    pub(crate) fn measurement(i: u32) -> Measurement {
        Measurement::new(
            "test-device",
            Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
            Reading {
                temperature_celsius: 20.0 + i as f64 / 10.0,
                humidity_percent: 50.0,
            },
        )
    }

    fn reporter(
        outcomes: impl IntoIterator<Item = Result<bool, StoreError>>,
        backoff: Backoff,
    ) -> (
        Reporter<ScriptedStore>,
        MeasurementQueue,
        Arc<Mutex<StoreLog>>,
        tokio::sync::mpsc::UnboundedReceiver<DeliveryEvent>,
    ) {
        let (store, log) = ScriptedStore::new(outcomes);
        let queue = MeasurementQueue::new();
        let (stats, events) = delivery_stats();
        let reporter = Reporter::new(
            store,
            queue.clone(),
            stats,
            backoff,
            CancellationToken::new(),
        );
        (reporter, queue, log, events)
    }

    fn default_backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(300), 1.2)
    }

    fn assert_secs(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
    }

    #[test]
    fn backoff_escalates_and_clamps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(2), 1.5);
        backoff.escalate();
        assert_secs(backoff.current_secs(), 1.5);
        backoff.escalate();
        assert_secs(backoff.current_secs(), 2.0);
        for _ in 0..10 {
            let before = backoff.current_secs();
            backoff.escalate();
            assert!(backoff.current_secs() >= before);
            assert!(backoff.current_secs() <= 2.0);
        }
        backoff.reset();
        assert_secs(backoff.current_secs(), 1.0);
    }

    #[tokio::test]
    async fn empty_queue_does_not_touch_the_store() {
        let (mut reporter, _queue, log, _events) = reporter([], default_backoff());
        assert_eq!(reporter.report_once().await, Delivery::Empty);
        assert_eq!(log.lock().unwrap().writes, 0);
    }

    #[tokio::test]
    async fn success_emits_delivery_event() {
        let (mut reporter, queue, log, mut events) = reporter([], default_backoff());
        queue.push(measurement(0));
        queue.push(measurement(1));

        assert_eq!(
            reporter.report_once().await,
            Delivery::Delivered { batch_size: 2 }
        );
        assert_eq!(events.try_recv().unwrap(), DeliveryEvent { batch_size: 2 });
        assert!(queue.is_empty());
        assert_eq!(log.lock().unwrap().delivered, vec![vec![measurement(0), measurement(1)]]);
    }

    #[tokio::test]
    async fn connection_failures_back_off_then_reset_on_success() {
        let (mut reporter, queue, log, _events) = reporter(
            [
                Err(StoreError::connection("refused")),
                Err(StoreError::connection("refused")),
                Err(StoreError::connection("refused")),
                Ok(true),
            ],
            default_backoff(),
        );
        queue.push(measurement(0));

        let mut intervals = Vec::new();
        for _ in 0..3 {
            let delivery = reporter.report_once().await;
            assert_eq!(
                delivery,
                Delivery::Requeued {
                    batch_size: 1,
                    kind: FailureKind::Connection,
                    escalated: true,
                }
            );
            intervals.push(reporter.backoff().current_secs());
        }
        assert_secs(intervals[0], 1.2);
        assert_secs(intervals[1], 1.44);
        assert_secs(intervals[2], 1.728);
        assert_eq!(
            reporter.failing_since(),
            Some(measurement(0).measured_at)
        );

        assert_eq!(
            reporter.report_once().await,
            Delivery::Delivered { batch_size: 1 }
        );
        assert_eq!(reporter.current_interval(), Duration::from_secs(1));
        assert_eq!(reporter.failing_since(), None);

        let log = log.lock().unwrap();
        assert_eq!(log.reconnects, 3);
        assert_eq!(log.writes, 4);
    }

    #[tokio::test]
    async fn server_failures_also_escalate() {
        let (mut reporter, queue, log, _events) =
            reporter([Err(StoreError::server("HTTP 503"))], default_backoff());
        queue.push(measurement(0));

        reporter.report_once().await;
        assert_secs(reporter.backoff().current_secs(), 1.2);
        assert_eq!(log.lock().unwrap().reconnects, 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn other_failures_requeue_without_backoff_or_reconnect() {
        let (mut reporter, queue, log, mut events) =
            reporter([Err(StoreError::other("HTTP 400"))], default_backoff());
        queue.push(measurement(0));
        queue.push(measurement(1));

        assert_eq!(
            reporter.report_once().await,
            Delivery::Requeued {
                batch_size: 2,
                kind: FailureKind::Other,
                escalated: false,
            }
        );
        assert_eq!(reporter.current_interval(), Duration::from_secs(1));
        assert_eq!(log.lock().unwrap().reconnects, 0);
        assert_eq!(queue.drain_all(), vec![measurement(0), measurement(1)]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn soft_failure_drops_batch_and_keeps_interval() {
        let mut backoff = default_backoff();
        backoff.escalate();
        let (mut reporter, queue, log, mut events) = reporter([Ok(false)], backoff);
        queue.push(measurement(3));

        assert_eq!(
            reporter.report_once().await,
            Delivery::Rejected { batch_size: 1 }
        );
        assert!(queue.is_empty());
        assert_secs(reporter.backoff().current_secs(), 1.2);
        assert_eq!(reporter.failing_since(), Some(measurement(3).measured_at));
        assert_eq!(log.lock().unwrap().reconnects, 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_failures_never_exceed_ceiling() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(300), 1.2);
        let (mut reporter, queue, _log, _events) = reporter(
            (0..100).map(|_| Err(StoreError::connection("down"))),
            backoff,
        );
        queue.push(measurement(0));

        for _ in 0..100 {
            reporter.report_once().await;
            assert!(reporter.current_interval() <= Duration::from_secs(300));
        }
        assert_eq!(reporter.current_interval(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn alternating_failures_deliver_every_measurement_exactly_once() {
        let outcomes = (0..20).map(|i| {
            if i % 2 == 0 {
                Err(StoreError::connection("flaky"))
            } else {
                Ok(true)
            }
        });
        let (mut reporter, queue, log, _events) = reporter(outcomes, default_backoff());

        for i in 0..50 {
            queue.push(measurement(i));
            if i % 5 == 4 {
                reporter.report_once().await;
            }
        }
        while !queue.is_empty() {
            reporter.report_once().await;
        }

        let log = log.lock().unwrap();
        let delivered: Vec<&Measurement> = log.delivered.iter().flatten().collect();
        assert_eq!(delivered.len(), 50);
        let unique: HashSet<i64> = delivered.iter().map(|m| m.measured_at.timestamp()).collect();
        assert_eq!(unique.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn run_flushes_queue_after_shutdown() {
        let (store, log) = ScriptedStore::new([]);
        let queue = MeasurementQueue::new();
        let (stats, _events) = delivery_stats();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            Reporter::new(store, queue.clone(), stats, default_backoff(), shutdown.clone()).run(),
        );

        sleep(Duration::from_millis(1500)).await;
        queue.push(measurement(0));
        queue.push(measurement(1));
        shutdown.cancel();

        assert_eq!(handle.await.unwrap(), 0);
        let log = log.lock().unwrap();
        assert_eq!(log.delivered, vec![vec![measurement(0), measurement(1)]]);
        assert!(log.closed);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_undelivered_measurements_at_exit() {
        let (store, _log) =
            ScriptedStore::new((0..10).map(|_| Err(StoreError::connection("down"))));
        let queue = MeasurementQueue::new();
        let (stats, _events) = delivery_stats();
        let shutdown = CancellationToken::new();
        queue.push(measurement(0));

        let handle = tokio::spawn(
            Reporter::new(store, queue.clone(), stats, default_backoff(), shutdown.clone()).run(),
        );
        sleep(Duration::from_secs(3)).await;
        shutdown.cancel();

        assert_eq!(handle.await.unwrap(), 1);
    }
}
