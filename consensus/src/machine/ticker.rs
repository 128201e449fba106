use crate::wal::TimeoutInfo;
use tokio::time::Instant;
use tracing::trace;

/// Holds the single timeout the state machine is waiting for.
///
/// A scheduled timeout only replaces the last one if it is for a later height, round or step,
/// so a stale transition can't postpone a timeout of the current step.
#[derive(Debug, Default)]
pub struct TimeoutTicker {
    last: Option<TimeoutInfo>,
    deadline: Option<Instant>,
}

impl TimeoutTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `timeout`, returning whether it replaced the last one.
    pub fn schedule(&mut self, timeout: TimeoutInfo) -> bool {
        if let Some(last) = &self.last {
            if timeout.position() <= last.position() {
                trace!(?timeout, ?last, "ignoring stale timeout");
                return false;
            }
        }
        trace!(?timeout, "scheduled timeout");
        self.deadline = Some(Instant::now() + timeout.duration);
        self.last = Some(timeout);
        true
    }

    /// When the pending timeout fires (if any).
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The timeout that has not fired yet.
    pub fn pending(&self) -> Option<&TimeoutInfo> {
        self.deadline.and(self.last.as_ref())
    }

    /// Takes the pending timeout (regardless of its deadline).
    pub fn fire(&mut self) -> Option<TimeoutInfo> {
        self.deadline.take()?;
        self.last.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoundStep;
    use std::time::Duration;

    fn timeout(height: u64, round: u32, step: RoundStep) -> TimeoutInfo {
        TimeoutInfo {
            duration: Duration::from_millis(10),
            height,
            round,
            step,
        }
    }

    #[test]
    fn test_only_later_timeouts_replace() {
        let mut ticker = TimeoutTicker::new();
        assert!(ticker.pending().is_none());
        assert!(ticker.schedule(timeout(1, 0, RoundStep::Propose)));
        assert!(!ticker.schedule(timeout(1, 0, RoundStep::NewRound)));
        assert!(!ticker.schedule(timeout(1, 0, RoundStep::Propose)));
        assert_eq!(ticker.pending(), Some(&timeout(1, 0, RoundStep::Propose)));

        assert!(ticker.schedule(timeout(1, 1, RoundStep::NewHeight)));
        assert!(ticker.schedule(timeout(2, 0, RoundStep::NewHeight)));
        assert_eq!(ticker.fire(), Some(timeout(2, 0, RoundStep::NewHeight)));
        assert_eq!(ticker.fire(), None);
        assert!(ticker.deadline().is_none());

        // A fired timeout still orders later schedules
        assert!(!ticker.schedule(timeout(2, 0, RoundStep::NewHeight)));
        assert!(ticker.schedule(timeout(2, 0, RoundStep::NewRound)));
    }
}
