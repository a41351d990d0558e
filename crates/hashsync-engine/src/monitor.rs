//! Progress sampling
//!
//! Transfer workers only bump atomic counters. The sampler reads them on a
//! fast refresh tick and publishes [`ProgressSnapshot`]s through a `watch`
//! channel; throughput is recomputed at most once per sampling interval to
//! keep it from jittering.

use hashsync_types::{CounterSnapshot, ProgressCounters, ProgressSnapshot};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes per second between two readings, never negative
///
/// A reading lower than the previous one (bytes of a discarded blob taken
/// back) yields zero.
pub fn throughput(previous_bytes: u64, current_bytes: u64, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds <= 0.0 || current_bytes <= previous_bytes {
        return 0.0;
    }
    (current_bytes - previous_bytes) as f64 / seconds
}

/// Time left at `speed`, `None` while the speed is zero
pub fn estimate_eta(bytes_done: u64, bytes_total: u64, speed: f64) -> Option<Duration> {
    let remaining = bytes_total.saturating_sub(bytes_done);
    if remaining == 0 {
        return Some(Duration::ZERO);
    }
    if speed > 0.0 && speed.is_finite() {
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    } else {
        None
    }
}

/// Turns counter readings into snapshots with speed and ETA
#[derive(Debug, Clone)]
pub struct ThroughputSampler {
    interval: Duration,
    baseline: Option<(u64, Instant)>,
    speed: f64,
}

impl ThroughputSampler {
    /// Sampler recomputing speed every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            baseline: None,
            speed: 0.0,
        }
    }

    /// Snapshot for a reading taken at `now`
    pub fn sample(&mut self, counters: CounterSnapshot, now: Instant) -> ProgressSnapshot {
        match self.baseline {
            None => self.baseline = Some((counters.bytes_downloaded, now)),
            Some((bytes, at)) => {
                let elapsed = now.saturating_duration_since(at);
                if elapsed >= self.interval {
                    self.speed = throughput(bytes, counters.bytes_downloaded, elapsed);
                    self.baseline = Some((counters.bytes_downloaded, now));
                }
            }
        }

        ProgressSnapshot {
            bytes_downloaded: counters.bytes_downloaded,
            bytes_total: counters.bytes_total,
            files_downloaded: counters.files_downloaded,
            files_total: counters.files_total,
            speed: self.speed,
            eta: estimate_eta(counters.bytes_downloaded, counters.bytes_total, self.speed),
        }
    }
}

/// Background task publishing progress snapshots
#[derive(Debug)]
pub struct ProgressSampler {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressSampler {
    /// Start sampling `counters` into `sink`
    pub fn spawn(
        counters: Arc<ProgressCounters>,
        sink: Arc<watch::Sender<ProgressSnapshot>>,
        sample_interval: Duration,
        refresh_interval: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let refresh = refresh_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut sampler = ThroughputSampler::new(sample_interval);
            let mut ticker = tokio::time::interval(refresh);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        sink.send_replace(sampler.sample(counters.snapshot(), Instant::now()));
                    }
                }
            }

            // Final reading so observers see the end state
            let mut last = sampler.sample(counters.snapshot(), Instant::now());
            last.speed = 0.0;
            last.eta = estimate_eta(last.bytes_downloaded, last.bytes_total, 0.0);
            sink.send_replace(last);
            debug!("Progress sampler stopped");
        });

        Self { stop, handle }
    }

    /// Stop sampling and wait for the final snapshot to be published
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}
