//! Passive training monitor
//!
//! Joins the directory without training, periodically reads every peer's
//! progress record and reports collaboration-wide metrics whenever the
//! latest step changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::SwarmConfig;
use crate::coordinator::{TelemetryRecord, TelemetrySink};
use crate::peer::{LivenessTracker, ProgressRecord};

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Period between directory reads
    pub refresh_period: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            refresh_period: Duration::from_secs(30),
        }
    }
}

impl MonitorConfig {
    pub fn from_config(config: &SwarmConfig) -> Self {
        Self {
            refresh_period: Duration::from_millis(config.monitor.refresh_period_ms),
        }
    }
}

/// Collaboration-wide metrics at one step
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSnapshot {
    /// Latest step any peer reported
    pub step: u64,

    /// Peers with a live record
    pub alive_peers: usize,

    /// Mean mini-batch loss across peers; absent before any batch
    pub loss: Option<f64>,

    /// Samples accumulated across peers
    pub samples: u64,

    /// Combined samples per second
    pub performance: f64,
}

/// Aggregate live progress records
pub fn aggregate(records: &[ProgressRecord]) -> Option<MonitorSnapshot> {
    let step = records.iter().map(|r| r.local_step).max()?;

    let loss: f64 = records.iter().map(|r| r.loss).sum();
    let mini_steps: u64 = records.iter().map(|r| r.mini_steps).sum();

    Some(MonitorSnapshot {
        step,
        alive_peers: records.len(),
        loss: (mini_steps > 0).then(|| loss / mini_steps as f64),
        samples: records.iter().map(|r| r.samples_accumulated).sum(),
        performance: records.iter().map(|r| r.samples_per_second.max(0.0)).sum(),
    })
}

/// Watches a run from the outside
pub struct TrainingMonitor {
    config: MonitorConfig,
    tracker: Arc<LivenessTracker>,
    telemetry: Arc<dyn TelemetrySink>,
    current_step: Option<u64>,
}

impl TrainingMonitor {
    /// The tracker is only read from; the monitor never reports progress
    pub fn new(config: MonitorConfig, tracker: Arc<LivenessTracker>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            config,
            tracker,
            telemetry,
            current_step: None,
        }
    }

    /// Read the directory once; returns metrics if the step changed
    pub async fn poll(&mut self) -> Option<MonitorSnapshot> {
        let records = self.tracker.refresh_now().await;
        let snapshot = aggregate(&records)?;
        if self.current_step == Some(snapshot.step) {
            return None;
        }
        self.current_step = Some(snapshot.step);

        debug!(peers = records.len(), "Got progress from peers");
        match snapshot.loss {
            Some(loss) => info!(
                alive_peers = snapshot.alive_peers,
                samples = snapshot.samples,
                performance = snapshot.performance,
                "Step #{} loss = {:.5}",
                snapshot.step,
                loss
            ),
            None => info!(alive_peers = snapshot.alive_peers, "Step #{}", snapshot.step),
        }

        self.telemetry.record(TelemetryRecord::new(
            snapshot.step,
            snapshot.loss.unwrap_or(f64::NAN),
            snapshot.performance,
            snapshot.alive_peers,
        ));
        Some(snapshot)
    }

    /// Poll every refresh period until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut refresh = tokio::time::interval(self.config.refresh_period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    if self.poll().await.is_none() {
                        debug!("Monitor is still alive");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
