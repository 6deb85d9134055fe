use anyhow::{Context as _, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    queue::MeasurementQueue,
    reporter::{Backoff, Reporter},
    sampler::Sampler,
    sensor::SampleSource,
    stats::{Histogram, StatsReporter, delivery_stats},
    store::Store,
};

#[derive(Debug)]
pub struct PipelineSummary {
    /// Sensor polls performed, including failed reads.
    pub iterations: u64,

    /// Measurements still queued when the pipeline stopped.
    pub undelivered: usize,

    /// Delivered batch sizes over the whole run. Empty on a dry run.
    pub deliveries: Histogram,
}

/// Runs the sampler and, unless this is a dry run or `store` is `None`, the
/// reporter and the stats reporter, each on its own task.
///
/// Returns once the sampler has stopped and the other tasks have observed
/// `shutdown` and finished.
pub async fn run<Src, St>(
    config: &Config,
    source: Src,
    store: Option<St>,
    shutdown: CancellationToken,
) -> Result<PipelineSummary>
where
    Src: SampleSource + 'static,
    St: Store + 'static,
{
    let queue = MeasurementQueue::new();

    let sampler = Sampler::new(
        source,
        queue.clone(),
        &config.device_id,
        config.poll_interval,
        config.iteration_limit,
        shutdown.clone(),
    )
    .with_timezone(config.timezone);
    let sampler = tokio::spawn(sampler.run());

    let delivery = match store.filter(|_| !config.dry_run) {
        Some(mut store) => {
            if config.create_database_on_start {
                match store.create_database().await {
                    Ok(()) => info!(database = %config.database_name, "created database"),
                    Err(err) => error!(
                        database = %config.database_name,
                        error = %err,
                        "failed to create database"
                    ),
                }
            }

            let (stats, events) = delivery_stats();
            let backoff = Backoff::new(
                config.report_interval,
                config.report_interval_max,
                config.report_interval_backoff,
            );
            let reporter = Reporter::new(store, queue.clone(), stats, backoff, shutdown.clone());
            let stats_reporter =
                StatsReporter::new(events, config.histogram_interval, shutdown.clone());

            Some((
                tokio::spawn(reporter.run()),
                tokio::spawn(stats_reporter.run()),
            ))
        }
        None => None,
    };

    let iterations = sampler.await;
    // Make sure the other tasks stop even if the sampler died.
    shutdown.cancel();
    let iterations = iterations.context("sampler task failed")?;

    let delivering = delivery.is_some();
    let (undelivered, deliveries) = match delivery {
        Some((reporter, stats_reporter)) => {
            let undelivered = reporter.await.context("reporter task failed")?;
            let deliveries = stats_reporter.await.context("stats reporter task failed")?;
            (undelivered, deliveries)
        }
        None => (queue.len(), Histogram::default()),
    };

    if undelivered > 0 && delivering {
        warn!(undelivered, "stopping with undelivered measurements");
    }

    Ok(PipelineSummary {
        iterations,
        undelivered,
        deliveries,
    })
}
