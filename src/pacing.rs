//! Pacing processor: the reveal loop for sequenced messages.
//!
//! Idle → Dequeuing → Idle            (timer paced: narration off, or bulk)
//! Idle → WaitingOnSpeech → Idle      (single-message narration)
//!
//! The processor owns its suspension points: the pacing timer and the
//! speech-completion receiver. Dropping either cancels it, so there is no
//! separate "active timer" bookkeeping to forget.

use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tracing::debug;

use crate::config::PacingConfig;
use crate::message::Message;
use crate::narration::SpeechOutcome;
use crate::queue::DeliveryQueue;

/// Length-based reveal delay.
#[derive(Debug, Clone)]
pub struct PacingPolicy {
    reading_rate: f64,
    min_ms: u64,
    max_ms: u64,
}

impl PacingPolicy {
    pub fn new(config: &PacingConfig) -> Self {
        Self {
            reading_rate: config.reading_rate,
            min_ms: config.min_delay_ms,
            max_ms: config.max_delay_ms.max(config.min_delay_ms),
        }
    }

    /// `clamp(previous_len / reading_rate, min, max)`.
    pub fn delay_for(&self, previous_len: usize) -> Duration {
        let raw_ms = if self.reading_rate > 0.0 {
            previous_len as f64 / self.reading_rate
        } else {
            self.max_ms as f64
        };
        let ms = raw_ms.clamp(self.min_ms as f64, self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessorState {
    Idle,
    /// Pacing timer armed for the queue head.
    Dequeuing,
    WaitingOnSpeech { message_id: String },
}

impl ProcessorState {
    /// Claims to be moving the queue forward.
    pub fn is_advancing(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Dequeuing => write!(f, "DEQUEUING"),
            Self::WaitingOnSpeech { message_id } => write!(f, "WAITING_ON_SPEECH({message_id})"),
        }
    }
}

/// What `advance` decided for the queue head.
#[derive(Debug)]
pub enum Advance {
    /// Timer armed; the head is revealed when it fires.
    Scheduled(Duration),
    /// Head moved out of the queue; reveal it now and narrate it.
    Speak(Message),
}

/// A suspension point that resolved.
#[derive(Debug)]
pub enum Wake {
    TimerFired,
    SpeechDone {
        message_id: String,
        outcome: SpeechOutcome,
    },
}

struct SpeechWait {
    message_id: String,
    done: oneshot::Receiver<SpeechOutcome>,
}

pub struct PacingProcessor {
    policy: PacingPolicy,
    state: ProcessorState,
    timer: Option<Pin<Box<Sleep>>>,
    speech: Option<SpeechWait>,
    last_sequenced_len: usize,
}

impl PacingProcessor {
    pub fn new(policy: PacingPolicy) -> Self {
        Self {
            policy,
            state: ProcessorState::Idle,
            timer: None,
            speech: None,
            last_sequenced_len: 0,
        }
    }

    pub fn state(&self) -> &ProcessorState {
        &self.state
    }

    pub fn has_live_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub fn has_open_speech_wait(&self) -> bool {
        self.speech.is_some()
    }

    pub fn last_sequenced_len(&self) -> usize {
        self.last_sequenced_len
    }

    /// Transition rule, evaluated while Idle with a non-empty queue.
    pub fn advance(&mut self, queue: &mut DeliveryQueue, voiced: bool) -> Option<Advance> {
        if self.state != ProcessorState::Idle || queue.is_empty() {
            return None;
        }

        if voiced {
            let message = queue.pop_front()?;
            self.note_revealed(&message);
            self.state = ProcessorState::WaitingOnSpeech {
                message_id: message.key().to_string(),
            };
            return Some(Advance::Speak(message));
        }

        let delay = self.policy.delay_for(self.last_sequenced_len);
        self.timer = Some(Box::pin(tokio::time::sleep(delay)));
        self.state = ProcessorState::Dequeuing;
        debug!(
            "Pacing: next reveal in {}ms (previous {} chars, {} queued)",
            delay.as_millis(),
            self.last_sequenced_len,
            queue.len()
        );
        Some(Advance::Scheduled(delay))
    }

    /// Park in `WaitingOnSpeech` until `done` resolves.
    pub fn await_speech(&mut self, message_id: &str, done: oneshot::Receiver<SpeechOutcome>) {
        self.speech = Some(SpeechWait {
            message_id: message_id.to_string(),
            done,
        });
    }

    /// Narration was skipped for the revealed message; resolve straight to Idle.
    pub fn speech_skipped(&mut self) {
        if matches!(self.state, ProcessorState::WaitingOnSpeech { .. }) {
            self.speech = None;
            self.state = ProcessorState::Idle;
        }
    }

    /// Resolve once the armed timer fires or the awaited speech completes.
    /// Pending forever when neither is armed. Cancel safe.
    pub async fn next_wake(&mut self) -> Wake {
        if let Some(timer) = self.timer.as_mut() {
            timer.as_mut().await;
            self.timer = None;
            return Wake::TimerFired;
        }

        if let Some(wait) = self.speech.as_mut() {
            // A dropped sender means the narration task died: still a completion
            let outcome = (&mut wait.done).await.unwrap_or(SpeechOutcome::Abandoned);
            let message_id = wait.message_id.clone();
            self.speech = None;
            return Wake::SpeechDone { message_id, outcome };
        }

        std::future::pending().await
    }

    /// Timer fired: move the queue head into view.
    pub fn reveal_due(&mut self, queue: &mut DeliveryQueue) -> Option<Message> {
        if self.state != ProcessorState::Dequeuing {
            return None;
        }
        self.timer = None;
        self.state = ProcessorState::Idle;
        let message = queue.pop_front()?;
        self.note_revealed(&message);
        Some(message)
    }

    /// Speech for `message_id` completed. Returns false for a stale signal.
    pub fn speech_finished(&mut self, message_id: &str) -> bool {
        match &self.state {
            ProcessorState::WaitingOnSpeech { message_id: waiting } if waiting == message_id => {
                self.speech = None;
                self.state = ProcessorState::Idle;
                true
            }
            _ => false,
        }
    }

    /// Record a sequenced message that became visible, for the next delay.
    pub fn note_revealed(&mut self, message: &Message) {
        self.last_sequenced_len = message.char_len();
    }

    /// Cancel the timer and any speech wait, and return to Idle.
    pub fn flush(&mut self) {
        self.timer = None;
        self.speech = None;
        self.state = ProcessorState::Idle;
    }

    /// Flush and forget the previous message length (thread reset).
    pub fn reset(&mut self) {
        self.flush();
        self.last_sequenced_len = 0;
    }

    /// Watchdog correction: drop whatever the processor thinks it is doing.
    pub fn force_idle(&mut self) {
        self.flush();
    }

    /// Simulate a timer lost to an external reset.
    #[cfg(test)]
    pub(crate) fn lose_timer(&mut self) {
        self.timer = None;
    }
}
