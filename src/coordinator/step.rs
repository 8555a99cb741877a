//! Collaborative step coordinator
//!
//! Drives one peer through `idle → accumulating → matchmaking → averaging
//! → applying → idle`:
//! - Accumulates local gradients until the collaboration reaches the
//!   target batch size
//! - Forms a group and averages the accumulated gradient with it
//! - Applies the average and advances the logical step
//! - Downloads a peer's parameters when the collaboration is ahead
//!
//! Network-level failures skip the round and keep going. Only a failing
//! local trainer ends the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::state::RoundState;
use super::sync::StateSync;
use super::telemetry::{TelemetryRecord, TelemetrySink};
use super::tensor::TensorSet;
use super::trainer::{LocalBatch, LocalTrainer};
use crate::averaging::{AllReduceEngine, RoundOutcome};
use crate::config::{SwarmConfig, WeightingMode};
use crate::dht::Contact;
use crate::error::{Error, Result};
use crate::matchmaking::Matchmaker;
use crate::peer::{LivenessTracker, ProgressRecord};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Step coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Samples the collaboration accumulates per step
    pub target_batch_size: u64,

    /// How this peer weights its contribution
    pub weighting: WeightingMode,

    /// Declared capacity, used as weight and for part ownership
    pub capacity: f64,

    /// Contribute without owning parts
    pub client_mode: bool,

    /// Failed rounds a gradient survives before it is discarded
    pub max_retained_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            target_batch_size: 4096,
            weighting: WeightingMode::Capacity,
            capacity: 1.0,
            client_mode: false,
            max_retained_attempts: 3,
        }
    }
}

impl CoordinatorConfig {
    /// Build from the trainer configuration
    pub fn from_config(config: &SwarmConfig) -> Self {
        Self {
            target_batch_size: config.training.target_batch_size,
            weighting: config.averaging.weighting,
            capacity: config.peer.capacity,
            client_mode: config.peer.client_mode,
            max_retained_attempts: config.training.max_retained_attempts,
        }
    }
}

/// What the coordinator is doing right now
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorStatus {
    pub state: RoundState,
    pub local_step: u64,
    pub samples_accumulated: u64,
    pub last_loss: Option<f64>,
    pub last_group_size: Option<usize>,
    pub rounds_completed: u64,
    pub rounds_failed: u64,
}

impl Default for CoordinatorStatus {
    fn default() -> Self {
        Self {
            state: RoundState::Idle,
            local_step: 0,
            samples_accumulated: 0,
            last_loss: None,
            last_group_size: None,
            rounds_completed: 0,
            rounds_failed: 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Accumulation
// ─────────────────────────────────────────────────────────────────

/// Gradients accumulated toward one step
struct Accumulator {
    /// Samples-weighted sum of batch gradients
    sum: Option<TensorSet>,
    samples: u64,
    loss: f64,
    mini_steps: u64,
    failed_attempts: u32,
    started: Instant,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            sum: None,
            samples: 0,
            loss: 0.0,
            mini_steps: 0,
            failed_attempts: 0,
            started: Instant::now(),
        }
    }

    fn add(&mut self, batch: LocalBatch) -> Result<()> {
        let weight = batch.samples as f32;
        match self.sum.as_mut() {
            Some(sum) => sum.add_scaled(&batch.gradients, weight)?,
            None => {
                let mut first = batch.gradients;
                first.scale(weight);
                self.sum = Some(first);
            }
        }
        self.samples += batch.samples;
        self.loss += batch.loss;
        self.mini_steps += 1;
        Ok(())
    }

    /// Mean gradient over every accumulated sample
    fn mean(&self) -> Option<TensorSet> {
        let sum = self.sum.as_ref().filter(|_| self.samples > 0)?;
        let mut mean = sum.clone();
        mean.scale(1.0 / self.samples as f32);
        Some(mean)
    }

    fn samples_per_second(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.samples as f64 / elapsed
        } else {
            0.0
        }
    }

    fn mean_loss(&self) -> f64 {
        if self.mini_steps > 0 {
            self.loss / self.mini_steps as f64
        } else {
            0.0
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────

/// Runs the per-peer training loop
pub struct StepCoordinator {
    config: CoordinatorConfig,
    trainer: Arc<Mutex<Box<dyn LocalTrainer>>>,
    tracker: Arc<LivenessTracker>,
    matchmaker: Matchmaker,
    engine: Arc<AllReduceEngine>,
    state: Arc<StateSync>,
    telemetry: Arc<dyn TelemetrySink>,
    local_step: AtomicU64,
    status: RwLock<CoordinatorStatus>,
}

impl StepCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        trainer: Box<dyn LocalTrainer>,
        tracker: Arc<LivenessTracker>,
        matchmaker: Matchmaker,
        engine: Arc<AllReduceEngine>,
        state: Arc<StateSync>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            trainer: Arc::new(Mutex::new(trainer)),
            tracker,
            matchmaker,
            engine,
            state,
            telemetry,
            local_step: AtomicU64::new(0),
            status: RwLock::new(CoordinatorStatus::default()),
        })
    }

    /// Logical step this peer works toward
    pub fn local_step(&self) -> u64 {
        self.local_step.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.status.read().clone()
    }

    /// Adopt the collaboration's step if it is ahead of ours
    ///
    /// Reads the directory first, so a peer joining mid-run starts from the
    /// current step instead of zero.
    pub async fn catch_up(&self) -> Result<bool> {
        self.tracker.refresh_now().await;
        let progress = self.tracker.global_progress(self.config.target_batch_size);
        self.fast_forward_to(progress.global_step).await
    }

    /// Run until shutdown or a local compute failure
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.catch_up().await? {
            info!(step = self.local_step(), "Joined a collaboration in progress");
        } else {
            self.publish_state().await?;
        }
        self.report_progress(&Accumulator::new());

        let mut acc = Accumulator::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                result = self.step_once(&mut acc) => {
                    if let Err(e) = result {
                        let _ = self.enter(RoundState::Failed);
                        return Err(e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        debug!(step = self.local_step(), "Step coordinator stopped");
        Ok(())
    }

    /// One batch, and a round once the collaboration is ready
    async fn step_once(&self, acc: &mut Accumulator) -> Result<()> {
        self.enter(RoundState::Accumulating)?;
        let batch = self.with_trainer("compute", |t| t.compute_local_gradient()).await?;
        if !batch.gradients.is_finite() {
            return Err(Error::local_compute("compute", "gradient contains non-finite values"));
        }
        acc.add(batch)?;
        self.status.write().samples_accumulated = acc.samples;
        self.report_progress(acc);

        let progress = self.tracker.global_progress(self.config.target_batch_size);
        if progress.global_step > self.local_step() {
            debug!(
                discarded_samples = acc.samples,
                "Collaboration moved on, discarding stale gradients"
            );
            self.enter(RoundState::Idle)?;
            self.fast_forward_to(progress.global_step).await?;
            *acc = Accumulator::new();
            self.report_progress(acc);
            return Ok(());
        }
        if !progress.ready_to_average() {
            return Ok(());
        }

        debug!(
            step = self.local_step(),
            global_samples = progress.samples_accumulated,
            peers = progress.peers_at_step,
            "Target batch size reached"
        );

        match self.average_and_apply(acc).await {
            Ok(outcome) => {
                self.finish_round(acc, &outcome);
                *acc = Accumulator::new();
                self.report_progress(acc);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.enter(RoundState::Failed)?;
                self.fail_round(acc, &e);
                self.enter(RoundState::Idle)?;
                Ok(())
            }
        }
    }

    async fn average_and_apply(&self, acc: &Accumulator) -> Result<RoundOutcome> {
        let step = self.local_step();
        let gradients = acc
            .mean()
            .ok_or_else(|| Error::Internal("round started without gradients".to_string()))?;
        let flat = gradients.flatten();

        self.enter(RoundState::Matchmaking)?;
        let weight = match self.config.weighting {
            WeightingMode::Capacity => self.config.capacity,
            WeightingMode::Equal => 1.0,
            WeightingMode::Samples => acc.samples as f64,
        };
        let capacity = if self.config.client_mode { 0.0 } else { self.config.capacity };
        let group = self.matchmaker.form_group(step, weight, capacity, flat.len()).await?;

        self.enter(RoundState::Averaging)?;
        let outcome = self.engine.run(&group, &flat).await?;

        self.enter(RoundState::Applying)?;
        let averaged = gradients.unflatten_like(&outcome.averaged)?;
        self.with_trainer("apply", move |t| t.apply_update(&averaged)).await?;

        self.local_step.store(step + 1, Ordering::SeqCst);
        self.publish_state().await?;
        self.enter(RoundState::Idle)?;
        Ok(outcome)
    }

    fn finish_round(&self, acc: &Accumulator, outcome: &RoundOutcome) {
        let step = self.local_step();
        let loss = acc.mean_loss();
        let throughput = acc.samples_per_second();
        let group_size = outcome.contributors.len();

        {
            let mut status = self.status.write();
            status.local_step = step;
            status.samples_accumulated = 0;
            status.last_loss = Some(loss);
            status.last_group_size = Some(group_size);
            status.rounds_completed += 1;
        }

        info!(
            step = step,
            loss = loss,
            group_size = group_size,
            dropped = outcome.dropped.len(),
            samples = acc.samples,
            "Round complete"
        );
        self.telemetry
            .record(TelemetryRecord::new(step, loss, throughput, group_size));
    }

    fn fail_round(&self, acc: &mut Accumulator, error: &Error) {
        self.status.write().rounds_failed += 1;
        acc.failed_attempts += 1;

        match error {
            Error::NoGroupFormed { .. } => debug!(
                step = self.local_step(),
                reason = %error,
                "No group formed, retrying next cycle"
            ),
            _ => warn!(
                step = self.local_step(),
                code = %error.code(),
                error = %error,
                "Round skipped"
            ),
        }

        if acc.failed_attempts >= self.config.max_retained_attempts {
            warn!(
                attempts = acc.failed_attempts,
                samples = acc.samples,
                "Discarding gradients after repeated failed rounds"
            );
            *acc = Accumulator::new();
            self.status.write().samples_accumulated = 0;
            self.report_progress(acc);
        }
    }

    async fn fast_forward_to(&self, step: u64) -> Result<bool> {
        let from = self.local_step();
        if step <= from {
            return Ok(false);
        }

        self.load_peer_state(step).await?;
        self.with_trainer("fast_forward", move |t| t.fast_forward(step)).await?;
        self.local_step.store(step, Ordering::SeqCst);
        self.publish_state().await?;
        {
            let mut status = self.status.write();
            status.local_step = step;
            status.samples_accumulated = 0;
        }
        info!(from = from, to = step, "Fast-forwarded to the collaboration's step");
        Ok(true)
    }

    /// Replace local parameters with those of a peer already at `step`
    ///
    /// Keeps the local parameters when no peer serves usable state.
    async fn load_peer_state(&self, step: u64) -> Result<()> {
        let mut records: Vec<ProgressRecord> = self
            .tracker
            .snapshot()
            .into_iter()
            .map(|(_, record)| record)
            .filter(|r| r.local_step >= step && !r.client_mode)
            .collect();
        records.sort_by(|a, b| b.local_step.cmp(&a.local_step));
        let sources: Vec<Contact> = records
            .iter()
            .map(|r| Contact::new(r.peer_id, r.addr))
            .collect();

        let Some(downloaded) = self.state.download(&sources, step).await else {
            warn!(
                step = step,
                sources = sources.len(),
                "No peer served model state, keeping local parameters"
            );
            return Ok(());
        };

        let tensors = downloaded.tensors;
        match self.with_trainer("load_state", move |t| t.load_state(&tensors)).await {
            Ok(()) => {
                info!(step = downloaded.step, "Loaded model state from a peer");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Peer model state rejected, keeping local parameters");
                Ok(())
            }
        }
    }

    /// Serve the current parameters to late joiners
    async fn publish_state(&self) -> Result<()> {
        if self.config.client_mode {
            return Ok(());
        }
        let tensors = self.with_trainer("export_state", |t| t.export_state()).await?;
        self.state.publish(self.local_step(), tensors);
        Ok(())
    }

    fn report_progress(&self, acc: &Accumulator) {
        let contact = self.tracker.local_contact();
        self.tracker.report(ProgressRecord {
            peer_id: contact.peer_id,
            addr: contact.addr,
            local_step: self.local_step(),
            samples_accumulated: acc.samples,
            samples_per_second: acc.samples_per_second(),
            loss: acc.loss,
            mini_steps: acc.mini_steps,
            client_mode: self.config.client_mode,
            timestamp: Utc::now(),
        });
    }

    fn enter(&self, next: RoundState) -> Result<()> {
        let mut status = self.status.write();
        status.state = status.state.transition(next)?;
        Ok(())
    }

    /// Run a trainer call on the blocking pool
    async fn with_trainer<T, F>(&self, stage: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn LocalTrainer>) -> anyhow::Result<T> + Send + 'static,
    {
        let trainer = Arc::clone(&self.trainer);
        tokio::task::spawn_blocking(move || {
            let mut guard = trainer.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::local_compute(stage, format!("trainer task failed: {}", e)))?
        .map_err(|e| Error::local_compute(stage, format!("{:#}", e)))
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
