//! Progress records and collaboration-wide progress estimates

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dht::PeerId;

/// What each peer publishes about its own training progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Writer identity; must match the directory subkey
    pub peer_id: PeerId,

    /// Address the writer accepts requests on
    pub addr: SocketAddr,

    /// Logical step the writer is working towards
    pub local_step: u64,

    /// Samples accumulated toward `local_step`
    pub samples_accumulated: u64,

    /// Recent local throughput
    pub samples_per_second: f64,

    /// Sum of mini-batch losses accumulated toward `local_step`
    pub loss: f64,

    /// Number of mini-batches behind `loss`
    pub mini_steps: u64,

    /// Writer contributes but owns no tensor parts
    pub client_mode: bool,

    /// When the record was produced
    pub timestamp: DateTime<Utc>,
}

impl ProgressRecord {
    /// Empty record at `step`
    pub fn new(peer_id: PeerId, addr: SocketAddr, step: u64) -> Self {
        Self {
            peer_id,
            addr,
            local_step: step,
            samples_accumulated: 0,
            samples_per_second: 0.0,
            loss: 0.0,
            mini_steps: 0,
            client_mode: false,
            timestamp: Utc::now(),
        }
    }

    /// Samples expected by `now`, extrapolated from throughput
    pub fn extrapolated_samples(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.timestamp).num_milliseconds().max(0) as f64 / 1000.0;
        self.samples_accumulated as f64 + self.samples_per_second.max(0.0) * elapsed
    }

    /// Mean mini-batch loss, if any batch was processed
    pub fn mean_loss(&self) -> Option<f64> {
        (self.mini_steps > 0).then(|| self.loss / self.mini_steps as f64)
    }
}

/// Estimate of where the whole collaboration stands
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalProgress {
    /// Highest step any live peer is working on
    pub global_step: u64,

    /// Estimated samples accumulated toward `global_step`
    pub samples_accumulated: u64,

    /// Samples required to close the step
    pub target_batch_size: u64,

    /// Peers working on `global_step`
    pub peers_at_step: usize,

    /// All peers that contributed a record
    pub total_peers: usize,

    /// Combined throughput of peers at `global_step`
    pub samples_per_second: f64,

    /// Estimated time until the target is reached
    pub eta: Duration,
}

impl GlobalProgress {
    /// Derive an estimate from fresh records
    pub fn estimate(records: &[ProgressRecord], target_batch_size: u64, now: DateTime<Utc>) -> Self {
        let global_step = records.iter().map(|r| r.local_step).max().unwrap_or(0);
        let current: Vec<&ProgressRecord> = records
            .iter()
            .filter(|r| r.local_step == global_step)
            .collect();

        let samples: f64 = current.iter().map(|r| r.extrapolated_samples(now)).sum();
        let samples_per_second: f64 = current.iter().map(|r| r.samples_per_second.max(0.0)).sum();

        let remaining = (target_batch_size as f64 - samples).max(0.0);
        let eta = if remaining == 0.0 {
            Duration::ZERO
        } else if samples_per_second > 0.0 {
            Duration::try_from_secs_f64(remaining / samples_per_second).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };

        Self {
            global_step,
            samples_accumulated: samples.floor() as u64,
            target_batch_size,
            peers_at_step: current.len(),
            total_peers: records.len(),
            samples_per_second,
            eta,
        }
    }

    /// Whether the collaboration is estimated to have reached the target
    pub fn ready_to_average(&self) -> bool {
        self.samples_accumulated >= self.target_batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: u64, samples: u64, sps: f64, at: DateTime<Utc>) -> ProgressRecord {
        ProgressRecord {
            samples_accumulated: samples,
            samples_per_second: sps,
            timestamp: at,
            ..ProgressRecord::new(PeerId::random(), "127.0.0.1:1".parse().unwrap(), step)
        }
    }

    #[test]
    fn test_global_step_is_max() {
        let now = Utc::now();
        let records = vec![record(3, 100, 0.0, now), record(5, 10, 0.0, now), record(4, 50, 0.0, now)];
        let progress = GlobalProgress::estimate(&records, 1000, now);
        assert_eq!(progress.global_step, 5);
        assert_eq!(progress.samples_accumulated, 10);
        assert_eq!(progress.peers_at_step, 1);
        assert_eq!(progress.total_peers, 3);
    }

    #[test]
    fn test_samples_only_count_current_step() {
        let now = Utc::now();
        let records = vec![record(2, 300, 0.0, now), record(2, 200, 0.0, now), record(1, 900, 0.0, now)];
        let progress = GlobalProgress::estimate(&records, 400, now);
        assert_eq!(progress.samples_accumulated, 500);
        assert!(progress.ready_to_average());
    }

    #[test]
    fn test_extrapolation_from_throughput() {
        let now = Utc::now();
        let ten_secs_ago = now - chrono::Duration::seconds(10);
        let records = vec![record(0, 100, 20.0, ten_secs_ago)];

        let progress = GlobalProgress::estimate(&records, 1000, now);
        assert_eq!(progress.samples_accumulated, 300);
        assert_eq!(progress.eta, Duration::from_secs(35));
        assert!(!progress.ready_to_average());
    }

    #[test]
    fn test_no_throughput_never_ready() {
        let now = Utc::now();
        let progress = GlobalProgress::estimate(&[record(0, 0, 0.0, now)], 10, now);
        assert_eq!(progress.eta, Duration::MAX);
        assert!(!progress.ready_to_average());
    }

    #[test]
    fn test_tiny_throughput_saturates_eta() {
        let now = Utc::now();
        let progress = GlobalProgress::estimate(&[record(0, 0, 1e-300, now)], 10, now);
        assert_eq!(progress.eta, Duration::MAX);
    }

    #[test]
    fn test_empty_estimate() {
        let progress = GlobalProgress::estimate(&[], 10, Utc::now());
        assert_eq!(progress.global_step, 0);
        assert_eq!(progress.total_peers, 0);
    }

    #[test]
    fn test_mean_loss() {
        let mut r = record(0, 0, 0.0, Utc::now());
        assert_eq!(r.mean_loss(), None);
        r.loss = 6.0;
        r.mini_steps = 3;
        assert_eq!(r.mean_loss(), Some(2.0));
    }

    #[test]
    fn test_record_json_roundtrip() {
        let r = record(7, 64, 12.5, Utc::now());
        let json = serde_json::to_string(&r).unwrap();
        let back: ProgressRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
