//! Stuck-state watchdog.
//!
//! The processor can end up claiming to advance the queue with nothing armed
//! to move it (a timer lost to an external reset, a speech wait dropped out
//! from under it). Left alone the queue would never drain. The engine loop
//! audits the processor on a fixed interval and forces it back to Idle.

use tracing::warn;

use crate::pacing::{PacingProcessor, ProcessorState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Stuck(&'static str),
}

/// Inspect the processor against the queue it is meant to drain.
pub fn audit(pacing: &PacingProcessor, queue_len: usize) -> Verdict {
    if queue_len == 0 {
        return Verdict::Healthy;
    }
    match pacing.state() {
        ProcessorState::Dequeuing if !pacing.has_live_timer() => {
            Verdict::Stuck("dequeuing without a pacing timer")
        }
        ProcessorState::WaitingOnSpeech { .. } if !pacing.has_open_speech_wait() => {
            Verdict::Stuck("waiting on speech that will never report")
        }
        _ => Verdict::Healthy,
    }
}

#[derive(Debug, Default)]
pub struct Watchdog {
    corrections: u64,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    /// Force the processor idle if it is stuck. Returns true when it acted.
    pub fn enforce(&mut self, pacing: &mut PacingProcessor, queue_len: usize) -> bool {
        match audit(pacing, queue_len) {
            Verdict::Healthy => false,
            Verdict::Stuck(reason) => {
                warn!(
                    "Watchdog: processor stuck in {} ({reason}), {queue_len} queued; forcing idle",
                    pacing.state()
                );
                pacing.force_idle();
                self.corrections += 1;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PacingConfig;
    use crate::message::Message;
    use crate::pacing::{Advance, PacingPolicy};
    use crate::queue::DeliveryQueue;

    fn setup() -> (PacingProcessor, DeliveryQueue) {
        let mut queue = DeliveryQueue::new();
        queue.push_batch([Message::agent("one").with_id("a"), Message::agent("two").with_id("b")]);
        (PacingProcessor::new(PacingPolicy::new(&PacingConfig::default())), queue)
    }

    #[tokio::test(start_paused = true)]
    async fn lost_timer_is_corrected() {
        let (mut pacing, mut queue) = setup();
        let mut watchdog = Watchdog::new();

        pacing.advance(&mut queue, false);
        assert!(!watchdog.enforce(&mut pacing, queue.len()));

        pacing.lose_timer();
        assert_eq!(audit(&pacing, queue.len()), Verdict::Stuck("dequeuing without a pacing timer"));
        assert!(watchdog.enforce(&mut pacing, queue.len()));
        assert_eq!(pacing.state(), &ProcessorState::Idle);
        assert_eq!(watchdog.corrections(), 1);

        // Processing resumes on the next advance.
        assert!(matches!(pacing.advance(&mut queue, false), Some(Advance::Scheduled(_))));
    }

    #[test]
    fn speech_wait_never_attached_is_corrected() {
        let (mut pacing, mut queue) = setup();
        let mut watchdog = Watchdog::new();

        pacing.advance(&mut queue, true);
        assert!(watchdog.enforce(&mut pacing, queue.len()));
        assert_eq!(pacing.state(), &ProcessorState::Idle);
    }

    #[test]
    fn empty_queue_is_never_stuck() {
        let (mut pacing, mut queue) = setup();
        pacing.advance(&mut queue, true);
        assert_eq!(audit(&pacing, 0), Verdict::Healthy);
    }
}
