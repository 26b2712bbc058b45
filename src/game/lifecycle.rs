//! Match Lifecycle
//!
//! `Idle → Active → Ended` state machine with a host-owned countdown.
//! The host advances the clock; clients only observe broadcasts.

use serde::{Serialize, Deserialize};
use tracing::info;

use crate::game::entity::PeerId;

/// Match phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPhase {
    /// Waiting for the scene.
    Idle,
    /// Clock running.
    Active,
    /// Clock expired, winner decided. Terminal until the session resets.
    Ended,
}

/// Invalid lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    /// Transition not allowed from the current phase.
    #[error("cannot {action} a match in phase {phase:?}")]
    InvalidTransition {
        /// Attempted action.
        action: &'static str,
        /// Phase at the time.
        phase: MatchPhase,
    },
}

/// What a clock advance produced.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClockUpdate {
    /// Remaining time to broadcast, set when a whole second was crossed.
    pub broadcast: Option<f64>,
    /// The clock reached zero on this advance.
    pub expired: bool,
}

/// One match.
#[derive(Debug, Clone)]
pub struct MatchLifecycle {
    phase: MatchPhase,
    duration: f64,
    remaining: f64,
    winner: Option<PeerId>,
}

impl MatchLifecycle {
    /// Create an idle match of `duration_secs`.
    pub fn new(duration_secs: f64) -> Self {
        Self {
            phase: MatchPhase::Idle,
            duration: duration_secs.max(0.0),
            remaining: duration_secs.max(0.0),
            winner: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// Configured duration (seconds).
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Remaining time (seconds).
    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    /// Winner, once ended.
    pub fn winner(&self) -> Option<PeerId> {
        self.winner
    }

    /// Check if the clock is running.
    pub fn is_active(&self) -> bool {
        self.phase == MatchPhase::Active
    }

    /// Check if the match is over.
    pub fn is_ended(&self) -> bool {
        self.phase == MatchPhase::Ended
    }

    /// Host: `Idle → Active`.
    pub fn start(&mut self) -> Result<(), MatchError> {
        if self.phase != MatchPhase::Idle {
            return Err(MatchError::InvalidTransition { action: "start", phase: self.phase });
        }
        self.phase = MatchPhase::Active;
        self.remaining = self.duration;
        self.winner = None;
        info!("Match started ({:.0}s)", self.duration);
        Ok(())
    }

    /// Host: run the clock down by `elapsed` seconds.
    ///
    /// A broadcast is requested only when the integer part of the remaining
    /// time changes. Remaining never increases and stops at zero.
    pub fn advance(&mut self, elapsed: f64) -> ClockUpdate {
        if self.phase != MatchPhase::Active || elapsed <= 0.0 {
            return ClockUpdate::default();
        }

        let before = self.remaining;
        self.remaining = (self.remaining - elapsed).max(0.0);

        ClockUpdate {
            broadcast: (before.floor() != self.remaining.floor()).then_some(self.remaining),
            expired: self.remaining <= 0.0,
        }
    }

    /// Host: `Active → Ended` with the decided winner.
    pub fn end(&mut self, winner: Option<PeerId>) -> Result<(), MatchError> {
        if self.phase != MatchPhase::Active {
            return Err(MatchError::InvalidTransition { action: "end", phase: self.phase });
        }
        self.phase = MatchPhase::Ended;
        self.remaining = 0.0;
        self.winner = winner;
        info!("Match ended, winner: {:?}", winner);
        Ok(())
    }

    /// Client: apply a `SetRemainingTime` broadcast. Returns true if it started the match.
    pub fn observe_remaining(&mut self, seconds: f64) -> bool {
        match self.phase {
            MatchPhase::Idle => {
                self.phase = MatchPhase::Active;
                self.remaining = seconds.max(0.0);
                true
            }
            MatchPhase::Active => {
                self.remaining = seconds.max(0.0);
                false
            }
            MatchPhase::Ended => false,
        }
    }

    /// Client: apply an `AnnounceResult` broadcast. Returns true on the first result.
    pub fn observe_result(&mut self, winner: Option<PeerId>) -> bool {
        if self.phase == MatchPhase::Ended {
            return false;
        }
        self.phase = MatchPhase::Ended;
        self.remaining = 0.0;
        self.winner = winner;
        true
    }

    /// Back to Idle.
    pub fn reset(&mut self) {
        self.phase = MatchPhase::Idle;
        self.remaining = self.duration;
        self.winner = None;
    }
}

/// The peer with the strictly highest kill count.
///
/// A tie for first place, or no entries, yields no winner.
pub fn compute_winner(scores: impl IntoIterator<Item = (PeerId, u32)>) -> Option<PeerId> {
    let mut best: Option<(PeerId, u32)> = None;
    let mut tied = false;

    for (peer, kills) in scores {
        match best {
            None => best = Some((peer, kills)),
            Some((_, top)) if kills > top => {
                best = Some((peer, kills));
                tied = false;
            }
            Some((_, top)) if kills == top => tied = true,
            Some(_) => {}
        }
    }

    if tied { None } else { best.map(|(peer, _)| peer) }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_winner_rules() {
        let a = PeerId(1);
        let b = PeerId(2);
        let c = PeerId(3);

        assert_eq!(compute_winner([(a, 3), (b, 5), (c, 5)]), None);
        assert_eq!(compute_winner([(a, 3), (b, 5), (c, 2)]), Some(b));
        assert_eq!(compute_winner([(a, 0)]), Some(a));
        assert_eq!(compute_winner(Vec::<(PeerId, u32)>::new()), None);

        // Tie below the top does not matter
        assert_eq!(compute_winner([(a, 1), (b, 1), (c, 4)]), Some(c));
    }

    #[test]
    fn test_start_only_from_idle() {
        let mut m = MatchLifecycle::new(300.0);
        assert!(m.start().is_ok());
        assert!(m.is_active());
        assert_eq!(
            m.start(),
            Err(MatchError::InvalidTransition { action: "start", phase: MatchPhase::Active })
        );
    }

    #[test]
    fn test_broadcast_on_second_boundary() {
        let mut m = MatchLifecycle::new(3.0);
        m.start().unwrap();

        // 3.0 -> 2.75 crosses the 3 boundary
        assert_eq!(m.advance(0.25).broadcast, Some(2.75));
        // 2.75 -> 2.5 stays within second 2
        assert_eq!(m.advance(0.25).broadcast, None);
        assert_eq!(m.advance(0.25).broadcast, None);
        // 2.25 -> 2.0 keeps the same integer part
        assert_eq!(m.advance(0.25).broadcast, None);
        // 2.0 -> 1.75
        assert_eq!(m.advance(0.25).broadcast, Some(1.75));
    }

    #[test]
    fn test_clock_clamps_and_expires_once() {
        let mut m = MatchLifecycle::new(1.0);
        m.start().unwrap();

        let update = m.advance(5.0);
        assert!(update.expired);
        assert_eq!(m.remaining(), 0.0);

        m.end(Some(PeerId(2))).unwrap();
        assert!(m.is_ended());
        assert_eq!(m.winner(), Some(PeerId(2)));

        // Ended is terminal
        assert_eq!(m.advance(1.0), ClockUpdate::default());
        assert!(m.end(None).is_err());
        assert!(m.start().is_err());
    }

    #[test]
    fn test_client_observation() {
        let mut m = MatchLifecycle::new(300.0);
        assert!(m.observe_remaining(120.0));
        assert!(m.is_active());
        assert_eq!(m.remaining(), 120.0);
        assert!(!m.observe_remaining(119.0));

        assert!(m.observe_result(None));
        assert!(!m.observe_result(Some(PeerId(3))));
        assert_eq!(m.winner(), None);
        assert!(!m.observe_remaining(50.0));
        assert_eq!(m.remaining(), 0.0);

        m.reset();
        assert_eq!(m.phase(), MatchPhase::Idle);
        assert_eq!(m.remaining(), 300.0);
    }

    proptest! {
        #[test]
        fn prop_remaining_non_increasing(steps in proptest::collection::vec(0.0f64..2.0, 1..200)) {
            let mut m = MatchLifecycle::new(30.0);
            m.start().unwrap();
            let mut last = m.remaining();
            let mut expirations = 0;

            for dt in steps {
                let update = m.advance(dt);
                prop_assert!(m.remaining() <= last);
                prop_assert!(m.remaining() >= 0.0);
                last = m.remaining();
                if update.expired {
                    expirations += 1;
                    m.end(None).unwrap();
                }
            }

            prop_assert!(expirations <= 1);
        }
    }
}
