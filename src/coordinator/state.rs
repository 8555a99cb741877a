//! Per-peer round state machine

use std::fmt;

use crate::error::{Error, Result};

/// Where this peer is in the current step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundState {
    /// Waiting to start accumulating
    #[default]
    Idle,
    /// Computing local gradients toward the target batch
    Accumulating,
    /// Negotiating an averaging group
    Matchmaking,
    /// Exchanging tensors with the group
    Averaging,
    /// Applying the averaged gradient locally
    Applying,
    /// The attempt failed; returns to idle
    Failed,
}

impl RoundState {
    /// Whether `next` may follow this state
    pub fn can_transition_to(self, next: RoundState) -> bool {
        use RoundState::*;
        matches!(
            (self, next),
            (Idle, Accumulating)
                | (Accumulating, Accumulating)
                | (Accumulating, Matchmaking)
                | (Accumulating, Idle)
                | (Matchmaking, Averaging)
                | (Averaging, Applying)
                | (Applying, Idle)
                | (Failed, Idle)
                | (_, Failed)
        )
    }

    /// Move to `next`, rejecting transitions the loop never makes
    pub fn transition(self, next: RoundState) -> Result<RoundState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::Internal(format!(
                "invalid round state transition {} -> {}",
                self, next
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoundState::Idle => "idle",
            RoundState::Accumulating => "accumulating",
            RoundState::Matchmaking => "matchmaking",
            RoundState::Averaging => "averaging",
            RoundState::Applying => "applying",
            RoundState::Failed => "failed",
        }
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = RoundState::default();
        for next in [
            RoundState::Accumulating,
            RoundState::Matchmaking,
            RoundState::Averaging,
            RoundState::Applying,
            RoundState::Idle,
        ] {
            state = state.transition(next).unwrap();
        }
        assert_eq!(state, RoundState::Idle);
    }

    #[test]
    fn test_failure_from_anywhere_returns_to_idle() {
        for state in [RoundState::Accumulating, RoundState::Matchmaking, RoundState::Averaging, RoundState::Applying] {
            let failed = state.transition(RoundState::Failed).unwrap();
            assert_eq!(failed.transition(RoundState::Idle).unwrap(), RoundState::Idle);
        }
    }

    #[test]
    fn test_cannot_skip_matchmaking() {
        assert!(RoundState::Accumulating.transition(RoundState::Averaging).is_err());
        assert!(RoundState::Idle.transition(RoundState::Applying).is_err());
        assert!(RoundState::Failed.transition(RoundState::Accumulating).is_err());
    }
}
