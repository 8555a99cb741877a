//! Local training collaborator
//!
//! The coordinator never looks inside the model. It asks the trainer for a
//! gradient, hands back an averaged gradient to apply, and tells it when the
//! collaboration has moved to a later step. Parameters can be exported and
//! loaded so a late joiner starts from the collaboration's weights. Trainer
//! calls are synchronous and run on the blocking pool.

use std::time::Duration;

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::tensor::{Tensor, TensorSet};
use crate::config::TrainingSettings;

/// One mini-batch worth of local work
#[derive(Debug, Clone)]
pub struct LocalBatch {
    pub gradients: TensorSet,

    /// Samples the gradient was computed over
    pub samples: u64,

    /// Mean loss over those samples
    pub loss: f64,
}

/// Model-side operations the coordinator depends on
pub trait LocalTrainer: Send + 'static {
    /// Compute a gradient on the next local mini-batch
    fn compute_local_gradient(&mut self) -> anyhow::Result<LocalBatch>;

    /// Apply an averaged gradient through the local optimizer
    fn apply_update(&mut self, gradients: &TensorSet) -> anyhow::Result<()>;

    /// Current model parameters
    fn export_state(&self) -> anyhow::Result<TensorSet>;

    /// Replace the model parameters with a peer's
    fn load_state(&mut self, state: &TensorSet) -> anyhow::Result<()>;

    /// Catch up with a collaboration already at `step`
    fn fast_forward(&mut self, _step: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Synthetic trainer
// ─────────────────────────────────────────────────────────────────

/// Seed of the hidden target weights, shared by every peer of a run
const TARGET_SEED: u64 = 0x5EED;

/// Noise amplitude added to the regression targets
const NOISE: f32 = 0.01;

/// Settings for the synthetic trainer
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub model_size: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub compute_delay: Duration,
    pub seed: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            model_size: 64,
            batch_size: 32,
            learning_rate: 0.05,
            compute_delay: Duration::ZERO,
            seed: None,
        }
    }
}

impl SyntheticConfig {
    /// Build from training settings
    pub fn from_settings(settings: &TrainingSettings) -> Self {
        Self {
            model_size: settings.model_size,
            batch_size: settings.batch_size,
            learning_rate: settings.learning_rate,
            compute_delay: Duration::from_millis(settings.compute_delay_ms),
            seed: settings.seed,
        }
    }
}

/// Linear regression against fixed hidden weights
///
/// Every peer draws its own samples but shares the target, so averaged
/// gradients steer all peers towards the same weights.
pub struct SyntheticTrainer {
    config: SyntheticConfig,
    weights: Vec<f32>,
    bias: f32,
    target: Vec<f32>,
    rng: StdRng,
    step: u64,
}

impl SyntheticTrainer {
    pub fn new(config: SyntheticConfig) -> Self {
        let mut target_rng = StdRng::seed_from_u64(TARGET_SEED);
        let target: Vec<f32> = (0..config.model_size)
            .map(|_| target_rng.gen_range(-1.0f32..1.0))
            .collect();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            weights: vec![0.0; config.model_size],
            bias: 0.0,
            target,
            rng,
            step: 0,
            config,
        }
    }

    /// Current parameters
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Step the trainer was last told about
    pub fn step(&self) -> u64 {
        self.step
    }

    fn batch_loss_and_gradient(&mut self) -> (f64, Vec<f32>, f32) {
        let n = self.config.model_size;
        let b = self.config.batch_size.max(1);
        let mut grad_w = vec![0.0f32; n];
        let mut grad_b = 0.0f32;
        let mut loss = 0.0f64;

        for _ in 0..b {
            let x: Vec<f32> = (0..n).map(|_| self.rng.gen_range(-1.0f32..1.0)).collect();
            let noise = self.rng.gen_range(-NOISE..NOISE);
            let y: f32 = x.iter().zip(&self.target).map(|(a, t)| a * t).sum::<f32>() + noise;
            let prediction: f32 = x.iter().zip(&self.weights).map(|(a, w)| a * w).sum::<f32>() + self.bias;

            let error = prediction - y;
            loss += f64::from(error * error);
            for (g, xi) in grad_w.iter_mut().zip(&x) {
                *g += 2.0 * error * xi;
            }
            grad_b += 2.0 * error;
        }

        let scale = 1.0 / b as f32;
        grad_w.iter_mut().for_each(|g| *g *= scale);
        (loss / b as f64, grad_w, grad_b * scale)
    }
}

impl LocalTrainer for SyntheticTrainer {
    fn compute_local_gradient(&mut self) -> anyhow::Result<LocalBatch> {
        if !self.config.compute_delay.is_zero() {
            std::thread::sleep(self.config.compute_delay);
        }

        let (loss, grad_w, grad_b) = self.batch_loss_and_gradient();
        if !loss.is_finite() {
            bail!("loss diverged to {}", loss);
        }

        let gradients = TensorSet::new(vec![
            Tensor::new("weight", vec![self.config.model_size], grad_w).context("weight gradient")?,
            Tensor::new("bias", vec![1], vec![grad_b]).context("bias gradient")?,
        ]);
        Ok(LocalBatch {
            gradients,
            samples: self.config.batch_size as u64,
            loss,
        })
    }

    fn apply_update(&mut self, gradients: &TensorSet) -> anyhow::Result<()> {
        let weight = gradients.get("weight").context("update has no weight gradient")?;
        let bias = gradients.get("bias").context("update has no bias gradient")?;
        if weight.numel() != self.weights.len() || bias.numel() != 1 {
            bail!(
                "update shape mismatch: weight {} (expected {}), bias {}",
                weight.numel(),
                self.weights.len(),
                bias.numel()
            );
        }
        if !gradients.is_finite() {
            bail!("update contains non-finite values");
        }

        let lr = self.config.learning_rate;
        for (w, g) in self.weights.iter_mut().zip(&weight.data) {
            *w -= lr * g;
        }
        self.bias -= lr * bias.data[0];
        Ok(())
    }

    fn export_state(&self) -> anyhow::Result<TensorSet> {
        Ok(TensorSet::new(vec![
            Tensor::new("weight", vec![self.weights.len()], self.weights.clone()).context("weight")?,
            Tensor::new("bias", vec![1], vec![self.bias]).context("bias")?,
        ]))
    }

    fn load_state(&mut self, state: &TensorSet) -> anyhow::Result<()> {
        let weight = state.get("weight").context("state has no weight tensor")?;
        let bias = state.get("bias").context("state has no bias tensor")?;
        if weight.numel() != self.weights.len() || bias.numel() != 1 {
            bail!(
                "state shape mismatch: weight {} (expected {}), bias {}",
                weight.numel(),
                self.weights.len(),
                bias.numel()
            );
        }
        if !state.is_finite() {
            bail!("state contains non-finite values");
        }

        self.weights.copy_from_slice(&weight.data);
        self.bias = bias.data[0];
        Ok(())
    }

    fn fast_forward(&mut self, step: u64) -> anyhow::Result<()> {
        self.step = self.step.max(step);
        Ok(())
    }
}
