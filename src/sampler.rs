use chrono::Utc;
use chrono_tz::Tz;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{measurement::Measurement, queue::MeasurementQueue, sensor::SampleSource};

/// Every reading is logged until this many have been taken, then every 10th.
const VERBOSE_SAMPLES: u64 = 60;

pub struct Sampler<S> {
    source: S,
    queue: MeasurementQueue,
    device_id: String,
    poll_interval: Duration,
    iteration_limit: Option<u64>,
    timezone: Tz,
    shutdown: CancellationToken,
}

impl<S: SampleSource> Sampler<S> {
    pub fn new(
        source: S,
        queue: MeasurementQueue,
        device_id: impl Into<String>,
        poll_interval: Duration,
        iteration_limit: Option<u64>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            queue,
            device_id: device_id.into(),
            poll_interval,
            iteration_limit,
            timezone: Tz::UTC,
            shutdown,
        }
    }

    /// Timezone used when printing readings. Stored timestamps are always UTC.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Polls the source until the iteration limit is reached, then cancels
    /// `shutdown` so the rest of the pipeline winds down. Also stops early if
    /// someone else cancels it.
    ///
    /// Returns the number of polls performed.
    pub async fn run(mut self) -> u64 {
        let mut iterations = 0u64;
        let mut samples = 0u64;

        while !self.budget_exhausted(iterations) && !self.shutdown.is_cancelled() {
            let measured_at = Utc::now();
            match self.source.read().await {
                Ok(reading) => {
                    if samples < VERBOSE_SAMPLES || samples % 10 == 0 {
                        info!(
                            "{iterations}: {} {:.1} C {:.1}%",
                            measured_at
                                .with_timezone(&self.timezone)
                                .format("%Y/%m/%d %H:%M:%S%.6f"),
                            reading.temperature_celsius,
                            reading.humidity_percent,
                        );
                    }
                    samples += 1;
                    self.queue
                        .push(Measurement::new(&self.device_id, measured_at, reading));
                }
                Err(err) => {
                    warn!(iteration = iterations, error = %err, "failed to read from sensor");
                }
            }
            iterations += 1;

            if self.budget_exhausted(iterations) {
                break;
            }

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = sleep(self.poll_interval) => {}
            }
        }

        if self.budget_exhausted(iterations) {
            info!(iterations, samples, "iteration limit reached, shutting down");
            self.shutdown.cancel();
        }

        iterations
    }

    fn budget_exhausted(&self, iterations: u64) -> bool {
        self.iteration_limit.is_some_and(|limit| iterations >= limit)
    }
}
