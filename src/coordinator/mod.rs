//! Collaborative step coordination
//!
//! Turns local gradient computation into collaborative training steps:
//! - Tensor sets and their flat buffers
//! - The local trainer collaborator and a synthetic trainer
//! - Round state machine and the step loop
//! - Best-effort telemetry
//! - Model state exchange for late joiners

pub mod state;
pub mod step;
pub mod sync;
pub mod telemetry;
pub mod tensor;
pub mod trainer;

pub use state::RoundState;
pub use step::{CoordinatorConfig, CoordinatorStatus, StepCoordinator};
pub use sync::{ModelState, StateSync};
pub use telemetry::{spawn_consumer, ChannelSink, NullSink, TelemetryRecord, TelemetrySink};
pub use tensor::{Tensor, TensorSet};
pub use trainer::{LocalBatch, LocalTrainer, SyntheticConfig, SyntheticTrainer};
