use std::{collections::BTreeMap, fmt};

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError},
    time::{Duration, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryEvent {
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct DeliveryStats {
    tx: UnboundedSender<DeliveryEvent>,
}

impl DeliveryStats {
    pub fn record(&self, batch_size: usize) {
        let _ = self.tx.send(DeliveryEvent { batch_size });
    }
}

pub fn delivery_stats() -> (DeliveryStats, UnboundedReceiver<DeliveryEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeliveryStats { tx }, rx)
}

// Rendered as `3x2 5x1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram(BTreeMap<usize, u64>);

impl Histogram {
    pub fn record(&mut self, batch_size: usize) {
        *self.0.entry(batch_size).or_default() += 1;
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (&size, &count) in &other.0 {
            *self.0.entry(size).or_default() += count;
        }
    }

    pub fn total_points(&self) -> usize {
        self.0
            .iter()
            .map(|(&size, &count)| size * count as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (size, count)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{size}x{count}")?;
        }
        Ok(())
    }
}

/// Periodically logs how big recent deliveries were.
pub struct StatsReporter {
    rx: UnboundedReceiver<DeliveryEvent>,
    interval: Duration,
    all_time: Histogram,
    shutdown: CancellationToken,
}

impl StatsReporter {
    pub fn new(
        rx: UnboundedReceiver<DeliveryEvent>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            rx,
            interval,
            all_time: Histogram::default(),
            shutdown,
        }
    }

    /// After shutdown, keeps collecting until every `DeliveryStats` handle is
    /// dropped, then logs a last window and returns the all-time histogram.
    pub async fn run(mut self) -> Histogram {
        loop {
            self.report_window();

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = sleep(self.interval) => {}
            }
        }

        let mut recent = self.drain_window();
        while let Some(event) = self.rx.recv().await {
            recent.record(event.batch_size);
        }
        self.log_window(recent);

        self.all_time
    }

    pub fn report_window(&mut self) -> Histogram {
        let recent = self.drain_window();
        self.log_window(recent)
    }

    pub fn all_time(&self) -> &Histogram {
        &self.all_time
    }

    fn log_window(&mut self, recent: Histogram) -> Histogram {
        self.all_time.merge(&recent);

        info!(
            "{} reported points: recent {}, all time {}",
            recent.total_points(),
            recent,
            self.all_time
        );

        recent
    }

    fn drain_window(&mut self) -> Histogram {
        let mut recent = Histogram::default();
        loop {
            match self.rx.try_recv() {
                Ok(event) => recent.record(event.batch_size),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        recent
    }
}
