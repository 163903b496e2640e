//! Per-request state machine.
//!
//! `Received → ModelResolved → CredentialAcquired → Forwarding → Completed`,
//! with `Failed` reachable from any non-terminal phase. [`Lifecycle::advance`]
//! only ever moves to the successor, so a phase cannot be skipped.

use std::fmt;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    ModelResolved,
    CredentialAcquired,
    Forwarding,
    Completed,
    Failed,
}

impl RequestPhase {
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Received => Some(Self::ModelResolved),
            Self::ModelResolved => Some(Self::CredentialAcquired),
            Self::CredentialAcquired => Some(Self::Forwarding),
            Self::Forwarding => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::ModelResolved => "model_resolved",
            Self::CredentialAcquired => "credential_acquired",
            Self::Forwarding => "forwarding",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    history: Vec<RequestPhase>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        debug!(phase = %RequestPhase::Received, "request phase");
        Self {
            history: vec![RequestPhase::Received],
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.history
            .last()
            .copied()
            .unwrap_or(RequestPhase::Received)
    }

    /// Move to the next phase. No-op once terminal.
    pub fn advance(&mut self) -> RequestPhase {
        let from = self.phase();
        if let Some(next) = from.successor() {
            debug!(from = %from, to = %next, "request phase");
            self.history.push(next);
        }
        self.phase()
    }

    /// Mark the request failed and hand the cause back to the caller.
    pub fn fail<E: fmt::Display>(&mut self, cause: E) -> E {
        let from = self.phase();
        if !from.is_terminal() {
            warn!(from = %from, error = %cause, "request failed");
            self.history.push(RequestPhase::Failed);
        }
        cause
    }

    pub fn history(&self) -> &[RequestPhase] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: [RequestPhase; 5] = [
        RequestPhase::Received,
        RequestPhase::ModelResolved,
        RequestPhase::CredentialAcquired,
        RequestPhase::Forwarding,
        RequestPhase::Completed,
    ];

    #[test]
    fn test_happy_path_visits_every_phase() {
        let mut lifecycle = Lifecycle::new();
        while !lifecycle.phase().is_terminal() {
            lifecycle.advance();
        }
        assert_eq!(lifecycle.history(), ORDER);
    }

    #[test]
    fn test_failure_from_every_non_terminal_phase() {
        for steps in 0..4 {
            let mut lifecycle = Lifecycle::new();
            for _ in 0..steps {
                lifecycle.advance();
            }
            let cause = lifecycle.fail("boom");
            assert_eq!(cause, "boom");

            let history = lifecycle.history();
            assert_eq!(&history[..history.len() - 1], &ORDER[..=steps]);
            assert_eq!(lifecycle.phase(), RequestPhase::Failed);
        }
    }

    #[test]
    fn test_terminal_phases_are_sticky() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.fail("first");
        lifecycle.fail("second");
        assert_eq!(lifecycle.advance(), RequestPhase::Failed);
        assert_eq!(
            lifecycle.history(),
            [RequestPhase::Received, RequestPhase::Failed]
        );

        let mut lifecycle = Lifecycle::new();
        for _ in 0..4 {
            lifecycle.advance();
        }
        lifecycle.fail("late");
        assert_eq!(lifecycle.phase(), RequestPhase::Completed);
    }
}
