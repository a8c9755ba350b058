//! The measurement loop: select targets, measure, publish, sleep, repeat.
//!
//! Per-target failures are absorbed here so a single bad server or a
//! transient write hiccup never brings the process down; only a
//! configuration-retrieval failure from the measurement network is allowed
//! to propagate.

use crate::config::Config;
use crate::influx::{MetricPoint, MetricSink};
use crate::speedtest::{MeasureError, Measurer};
use std::time::Duration;
use tracing::{error, info};

/// Outcome counters for a single measurement cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    /// Measurements completed and written to the sink.
    pub published: usize,
    /// Measurements completed whose write failed (point dropped).
    pub dropped: usize,
    /// Targets skipped because their measurement failed.
    pub skipped: usize,
}

/// Drives measurements against the configured targets and publishes the
/// results.
pub struct Daemon<M, S> {
    delay: Duration,
    measurement: String,
    servers: Vec<String>,
    measurer: M,
    sink: S,
}

impl<M: Measurer, S: MetricSink> Daemon<M, S> {
    pub fn new(config: &Config, measurer: M, sink: S) -> Self {
        Self {
            delay: config.delay,
            measurement: config.influx.measurement.clone(),
            servers: config.servers.clone(),
            measurer,
            sink,
        }
    }

    /// Run measurement cycles forever, sleeping between them. Returns only
    /// on a fatal measurement failure.
    pub async fn run(&self) -> Result<(), MeasureError> {
        loop {
            self.cycle().await?;
            info!(
                "Waiting {} seconds until next test",
                self.delay.as_secs()
            );
            tokio::time::sleep(self.delay).await;
        }
    }

    /// Run one full pass over the configured targets, sequentially and in
    /// order. An empty target list means a single auto-selected test.
    pub async fn cycle(&self) -> Result<CycleStats, MeasureError> {
        let targets: Vec<Option<&str>> = if self.servers.is_empty() {
            vec![None]
        } else {
            self.servers.iter().map(|id| Some(id.as_str())).collect()
        };

        let mut stats = CycleStats::default();
        for target in targets {
            match self.run_one(target).await {
                Ok(true) => stats.published += 1,
                Ok(false) => stats.dropped += 1,
                Err(err) if err.is_fatal() => {
                    error!("{err}. Aborting");
                    return Err(err);
                }
                Err(err) => {
                    error!("{err}");
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Measure one target and publish the result. Returns whether the point
    /// was written; a failed write drops the point and is not retried here.
    async fn run_one(&self, target: Option<&str>) -> Result<bool, MeasureError> {
        info!(server = target.unwrap_or("auto"), "Starting speed test");
        let result = self.measurer.measure(target).await?;

        let point = MetricPoint::from_measurement(&self.measurement, &result);
        let written = match self.sink.write(std::slice::from_ref(&point)).await {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to write to InfluxDB: {err}");
                false
            }
        };

        info!(
            "Download: {:.2} Mbps - Upload: {:.2} Mbps - Latency: {} ms",
            result.download_mbps(),
            result.upload_mbps(),
            result.latency_ms
        );

        Ok(written)
    }
}
