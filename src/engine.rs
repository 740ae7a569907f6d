//! Delivery engine: the single task that owns all pacing and narration state.
//!
//! Every state change happens inside one `tokio::select!` loop: transcript
//! commands, the pacing processor's suspension points, generation results
//! and the watchdog tick. Nothing else mutates the queue or the visible
//! transcript, so the interrupt flush is atomic with respect to pacing.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::classifier::{Classifier, InterruptLane, Routed};
use crate::config::{Config, NarrationSettings};
use crate::gate::UnlockGate;
use crate::history::default_history_dir;
use crate::merge::{reconcile_cards, upsert_card};
use crate::message::{Message, MessageKind};
use crate::narration::{NarrationCoordinator, NarrationEvent, SpeechStart};
use crate::pacing::{Advance, PacingPolicy, PacingProcessor, ProcessorState, Wake};
use crate::playback::{AudioOutput, HaltOutcome, PlaybackEngine, PlaybackState};
use crate::queue::DeliveryQueue;
use crate::synth::Synthesizer;
use crate::watchdog::Watchdog;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine task has stopped")]
    Closed,
}

/// Wholesale transcript delivered by upstream on every change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptUpdate {
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Upstream is still producing a response.
    #[serde(default)]
    pub awaiting_response: bool,
}

#[derive(Debug)]
enum Command {
    Transcript(TranscriptUpdate),
    SetNarration(NarrationSettings),
    Shutdown,
}

/// What the rendering layer sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub thread_id: Option<String>,
    pub visible: Vec<Message>,
    pub should_show_loading: bool,
    pub queue_len: usize,
    pub processor: ProcessorState,
    pub playback: PlaybackState,
    pub narration: NarrationSettings,
    pub audio_unlocked: bool,
    pub watchdog_corrections: u64,
}

#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<EngineSnapshot>,
    gate: UnlockGate,
    playback: PlaybackEngine,
}

impl EngineHandle {
    pub fn update_transcript(&self, update: TranscriptUpdate) -> Result<(), EngineError> {
        self.send(Command::Transcript(update))
    }

    pub fn set_narration(&self, settings: NarrationSettings) -> Result<(), EngineError> {
        self.send(Command::SetNarration(settings))
    }

    /// Record the user gesture that permits audio. Returns true the first time.
    pub fn unlock_audio(&self) -> bool {
        self.gate.unlock()
    }

    /// External interruption (e.g. navigating away): fade out whatever is sounding.
    pub fn fade_out_and_stop(&self) -> HaltOutcome {
        self.playback.fade_out_and_stop()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshots.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::Closed)
    }
}

struct Engine {
    classifier: Classifier,
    queue: DeliveryQueue,
    visible: Vec<Message>,
    pacing: PacingProcessor,
    narration: NarrationCoordinator,
    watchdog: Watchdog,
    awaiting_response: bool,
    gate: UnlockGate,
    snapshots: watch::Sender<EngineSnapshot>,
}

/// Start the engine task.
pub fn spawn(
    config: &Config,
    synth: Arc<dyn Synthesizer>,
    output: Arc<dyn AudioOutput>,
    gate: UnlockGate,
) -> (EngineHandle, JoinHandle<()>) {
    let playback = PlaybackEngine::new(output, gate.clone(), config.playback.clone());
    let history_dir = if config.history.enabled {
        default_history_dir()
    } else {
        None
    };
    let (narration, events) = NarrationCoordinator::new(
        config.narration,
        synth,
        playback.clone(),
        gate.clone(),
        history_dir,
    );
    let (commands_tx, commands) = mpsc::unbounded_channel();

    let mut engine = Engine {
        classifier: Classifier::new(&config.classifier),
        queue: DeliveryQueue::new(),
        visible: Vec::new(),
        pacing: PacingProcessor::new(PacingPolicy::new(&config.pacing)),
        narration,
        watchdog: Watchdog::new(),
        awaiting_response: false,
        gate: gate.clone(),
        snapshots: watch::Sender::new(EngineSnapshot {
            thread_id: None,
            visible: Vec::new(),
            should_show_loading: false,
            queue_len: 0,
            processor: ProcessorState::Idle,
            playback: PlaybackState::Idle,
            narration: config.narration,
            audio_unlocked: gate.is_open(),
            watchdog_corrections: 0,
        }),
    };
    engine.publish();

    let handle = EngineHandle {
        commands: commands_tx,
        snapshots: engine.snapshots.subscribe(),
        gate,
        playback,
    };
    let interval = Duration::from_millis(config.watchdog.interval_ms.max(1));
    let task = tokio::spawn(engine.run(commands, events, interval));

    (handle, task)
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<NarrationEvent>,
        watchdog_interval: Duration,
    ) {
        let mut audit = tokio::time::interval(watchdog_interval);
        audit.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Delivery engine started (narration {}, {} mode)",
            if self.narration.settings().enabled { "on" } else { "off" },
            self.narration.settings().mode
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Transcript(update)) => self.handle_transcript(update),
                    Some(Command::SetNarration(settings)) => {
                        self.narration.apply_settings(settings);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                wake = self.pacing.next_wake() => self.handle_wake(wake),
                Some(event) = events.recv() => self.narration.on_event(event),
                _ = audit.tick() => {
                    self.watchdog.enforce(&mut self.pacing, self.queue.len());
                }
            }

            self.drive();
            self.publish();
        }

        self.narration.teardown();
        self.pacing.reset();
        self.publish();
        info!("Delivery engine stopped");
    }

    fn handle_transcript(&mut self, update: TranscriptUpdate) {
        self.awaiting_response = update.awaiting_response;

        if self.classifier.observe_thread(&update.thread_id) {
            self.reset_thread();
        }

        let mut batch: Vec<Message> = Vec::new();
        for routed in self.classifier.classify(&update.messages) {
            match routed {
                Routed::Immediate(message) => {
                    if message.kind == MessageKind::Card {
                        upsert_card(&mut self.visible, message);
                    } else {
                        self.visible.push(message);
                    }
                }
                Routed::Interrupt { lane, message } => {
                    // Turns before the interrupt are flushed along with the queue
                    self.queue.push_batch(batch.drain(..));
                    self.interrupt(lane);
                    self.visible.push(message);
                }
                Routed::Sequenced(message) => batch.push(message),
            }
        }

        if !batch.is_empty() {
            debug!("Queueing {} agent turn(s)", batch.len());
            self.narration.prepare_batch(&batch);
            self.queue.push_batch(batch);
        }

        let processed = self.classifier.cursor().min(update.messages.len());
        let updated = reconcile_cards(&mut self.visible, &update.messages[..processed]);
        if updated > 0 {
            debug!("Reconciled {updated} card(s) with upstream");
        }
    }

    /// Flush pending work ahead of a user turn or interrupting event.
    fn interrupt(&mut self, lane: InterruptLane) {
        self.pacing.flush();

        let flushed = self.queue.drain_all();
        if !flushed.is_empty() {
            info!(
                "Interrupt ({lane}): revealing {} queued message(s) without narration",
                flushed.len()
            );
        }
        for message in flushed {
            self.pacing.note_revealed(&message);
            self.visible.push(message);
        }

        self.narration.interrupt();
    }

    fn reset_thread(&mut self) {
        info!(
            "Thread reset: dropping {} visible and {} queued message(s)",
            self.visible.len(),
            self.queue.len()
        );
        self.pacing.reset();
        self.queue.clear();
        self.visible.clear();
        self.narration.reset_thread();
    }

    fn handle_wake(&mut self, wake: Wake) {
        match wake {
            Wake::TimerFired => {
                if let Some(message) = self.pacing.reveal_due(&mut self.queue) {
                    debug!("Revealed {} ({} queued)", message.key(), self.queue.len());
                    self.visible.push(message);
                }
            }
            Wake::SpeechDone {
                message_id,
                outcome,
            } => {
                if self.pacing.speech_finished(&message_id) {
                    debug!("Speech for {message_id} ended: {outcome:?}");
                }
            }
        }
    }

    /// Apply the transition rule until the processor is parked.
    fn drive(&mut self) {
        self.watchdog.enforce(&mut self.pacing, self.queue.len());

        loop {
            let voiced = self.narration.voiced_pacing();
            let Some(Advance::Speak(message)) = self.pacing.advance(&mut self.queue, voiced) else {
                return;
            };

            let message_id = message.key().to_string();
            let start = self.narration.speak(&message);
            self.visible.push(message);

            match start {
                SpeechStart::Started(done) => {
                    self.pacing.await_speech(&message_id, done);
                    return;
                }
                SpeechStart::Skipped(reason) => {
                    debug!("Narration skipped for {message_id}: {reason:?}");
                    self.pacing.speech_skipped();
                }
            }
        }
    }

    fn publish(&mut self) {
        let next = EngineSnapshot {
            thread_id: self.classifier.thread_id().map(str::to_string),
            visible: self.visible.clone(),
            should_show_loading: !self.queue.is_empty() || self.awaiting_response,
            queue_len: self.queue.len(),
            processor: self.pacing.state().clone(),
            playback: self.narration.session_state(),
            narration: self.narration.settings(),
            audio_unlocked: self.gate.is_open(),
            watchdog_corrections: self.watchdog.corrections(),
        };
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
