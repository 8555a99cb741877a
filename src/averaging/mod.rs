//! Group averaging
//!
//! - `partition`: capacity-proportional part assignment
//! - `reducer`: weighted mean of part contributions
//! - `engine`: the all-reduce protocol with dropout handling

pub mod engine;
pub mod partition;
pub mod reducer;

pub use engine::{AllReduceEngine, EngineConfig, RoundOutcome};
pub use partition::{load_balance, split_parts};
pub use reducer::{reduce_part, weighted_average, PartContribution};
