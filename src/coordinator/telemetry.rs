//! Best-effort telemetry
//!
//! The coordinator and the monitor hand `(step, loss, throughput, group
//! size)` records to a sink that must never block them. The channel sink
//! drops records when its queue is full; a consumer task writes them out.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub logical_step: u64,
    pub loss: f64,

    /// Samples per second
    pub throughput: f64,
    pub group_size: usize,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryRecord {
    pub fn new(logical_step: u64, loss: f64, throughput: f64, group_size: usize) -> Self {
        Self {
            logical_step,
            loss,
            throughput,
            group_size,
            timestamp: Utc::now(),
        }
    }
}

/// Receives telemetry without ever blocking the caller
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: TelemetryRecord);
}

/// Discards everything
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _record: TelemetryRecord) {}
}

/// Bounded queue in front of a consumer task
pub struct ChannelSink {
    tx: mpsc::Sender<TelemetryRecord>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its queue
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<TelemetryRecord>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn record(&self, record: TelemetryRecord) {
        if let Err(e) = self.tx.try_send(record) {
            debug!(error = %e, "Telemetry record dropped");
        }
    }
}

/// Drain the queue into a JSON-lines file, or the log when no file is set
pub fn spawn_consumer(mut rx: mpsc::Receiver<TelemetryRecord>, file: Option<PathBuf>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut writer = match &file {
            Some(path) => match open_append(path).await {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(error = %e, "Telemetry file unavailable, logging records instead");
                    None
                }
            },
            None => None,
        };

        while let Some(record) = rx.recv().await {
            match writer.as_mut() {
                Some(f) => {
                    if let Err(e) = write_line(f, &record).await {
                        warn!(error = %e, "Failed to write telemetry record");
                    }
                }
                None => info!(
                    step = record.logical_step,
                    loss = record.loss,
                    throughput = record.throughput,
                    group_size = record.group_size,
                    "Telemetry"
                ),
            }
        }

        if let Some(mut f) = writer {
            let _ = f.flush().await;
        }
        debug!("Telemetry consumer stopped");
    })
}

async fn open_append(path: &Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| Error::IoWrite {
            path: path.to_path_buf(),
            source: e,
        })
}

async fn write_line(file: &mut tokio::fs::File, record: &TelemetryRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    Ok(())
}
