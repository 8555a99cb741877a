//! Peer liveness and progress tracking
//!
//! Each peer publishes a progress record under `{run_id}_progress`, one
//! subkey per writer. Reading those records tells a peer:
//! - Who else is alive in the run
//! - Which logical step the collaboration is on
//! - How fast the collaboration is accumulating samples

pub mod progress;
pub mod registry;
pub mod tracker;

pub use progress::*;
pub use registry::*;
pub use tracker::*;

/// Directory key holding every peer's progress record
pub fn progress_key(run_id: &str) -> String {
    format!("{}_progress", run_id)
}
