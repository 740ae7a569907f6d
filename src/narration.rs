//! Narration coordinator.
//!
//! Sits between the pacing processor and the playback engine. In single mode
//! it pre-generates one clip per agent turn and plays them as the processor
//! reveals each message. In bulk mode it generates one clip for the whole
//! batch and plays it alongside timer-paced reveals.
//!
//! Generation runs on spawned tasks that report back through a channel the
//! engine loop drains. Results carry the epoch they were started under; a
//! result from an older epoch is dropped on arrival.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{NarrationMode, NarrationSettings};
use crate::gate::UnlockGate;
use crate::history::{save_record, NarrationRecord};
use crate::message::{narratable_text, Message, MessageKind};
use crate::playback::{Clip, PlayOutcome, PlaybackEngine, PlaybackMode, PlaybackState};
use crate::synth::{SynthError, Synthesizer};

/// How a single-message narration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechOutcome {
    Finished,
    Stopped,
    Skipped,
    Failed,
    /// The narration task went away without reporting.
    Abandoned,
}

impl SpeechOutcome {
    pub fn label(self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Stopped => "stopped",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl From<PlayOutcome> for SpeechOutcome {
    fn from(outcome: PlayOutcome) -> Self {
        match outcome {
            PlayOutcome::Finished => Self::Finished,
            PlayOutcome::Stopped => Self::Stopped,
            PlayOutcome::Skipped => Self::Skipped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    AudioLocked,
    NothingToSay,
}

/// Result of asking to narrate one revealed message.
#[derive(Debug)]
pub enum SpeechStart {
    /// Resolves once playback ends, however it ends.
    Started(oneshot::Receiver<SpeechOutcome>),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkRequest {
    Started,
    /// Same batch already sounding.
    Unchanged,
    /// Another bulk generation holds the lock.
    Locked,
    NothingToSay,
    Disabled,
}

/// Completion reports from generation tasks.
#[derive(Debug)]
pub enum NarrationEvent {
    PreGenerated {
        thread_epoch: u64,
        message_id: String,
        result: Result<Clip, SynthError>,
    },
    BulkReady {
        turn_epoch: u64,
        fingerprint: String,
        result: Result<Clip, SynthError>,
    },
}

/// Clips keyed by message id, scoped to the current thread.
#[derive(Debug, Default)]
pub struct AudioCache {
    clips: HashMap<String, Clip>,
}

impl AudioCache {
    pub fn get(&self, message_id: &str) -> Option<&Clip> {
        self.clips.get(message_id)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.clips.contains_key(message_id)
    }

    pub fn insert(&mut self, message_id: String, clip: Clip) {
        self.clips.insert(message_id, clip);
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    pub fn clear(&mut self) {
        self.clips.clear();
    }
}

struct Generation {
    fingerprint: String,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BulkSession {
    /// Fingerprint of the batch whose clip is loaded.
    fingerprint: Option<String>,
    clip: Option<Clip>,
    /// Generation lock.
    generating: Option<Generation>,
    player: Option<JoinHandle<()>>,
}

impl BulkSession {
    fn release_lock(&mut self) {
        if let Some(generation) = self.generating.take() {
            generation.task.abort();
        }
    }

    fn stop_player(&mut self) {
        if let Some(player) = self.player.take() {
            player.abort();
        }
    }
}

/// Content fingerprint of a batch: ids and texts, in order.
pub fn batch_fingerprint(batch: &[Message]) -> String {
    let mut hasher = Sha256::new();
    for message in batch {
        hasher.update(message.key().as_bytes());
        hasher.update([0x1f]);
        hasher.update(message.text.as_bytes());
        hasher.update([0x1e]);
    }
    format!("{:x}", hasher.finalize())
}

pub struct NarrationCoordinator {
    settings: NarrationSettings,
    synth: Arc<dyn Synthesizer>,
    playback: PlaybackEngine,
    gate: UnlockGate,
    events: mpsc::UnboundedSender<NarrationEvent>,
    cache: AudioCache,
    pending: HashMap<String, JoinHandle<()>>,
    bulk: BulkSession,
    speech: Option<JoinHandle<()>>,
    thread_epoch: u64,
    turn_epoch: u64,
    history_dir: Option<PathBuf>,
}

impl NarrationCoordinator {
    pub fn new(
        settings: NarrationSettings,
        synth: Arc<dyn Synthesizer>,
        playback: PlaybackEngine,
        gate: UnlockGate,
        history_dir: Option<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<NarrationEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            settings,
            synth,
            playback,
            gate,
            events,
            cache: AudioCache::default(),
            pending: HashMap::new(),
            bulk: BulkSession::default(),
            speech: None,
            thread_epoch: 0,
            turn_epoch: 0,
            history_dir,
        };
        (coordinator, events_rx)
    }

    pub fn settings(&self) -> NarrationSettings {
        self.settings
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    pub fn cache(&self) -> &AudioCache {
        &self.cache
    }

    /// Reveals wait on speech rather than the timer. Holds with the gate
    /// closed too: each reveal's speech is skipped and resolves at once.
    pub fn voiced_pacing(&self) -> bool {
        self.settings.enabled && self.settings.mode == NarrationMode::Single
    }

    pub fn is_generating_bulk(&self) -> bool {
        self.bulk.generating.is_some()
    }

    /// Playback state as the rendering layer sees it: a pending bulk
    /// generation shows as `Generating` until audio starts.
    pub fn session_state(&self) -> PlaybackState {
        let state = self.playback.state();
        match state {
            PlaybackState::Playing | PlaybackState::Fading => state,
            _ if self.is_generating_bulk() => PlaybackState::Generating,
            _ => state,
        }
    }

    pub fn bulk_fingerprint(&self) -> Option<&str> {
        self.bulk.fingerprint.as_deref()
    }

    /// Called with each newly sequenced batch before it is queued.
    pub fn prepare_batch(&mut self, batch: &[Message]) {
        if !self.settings.enabled || batch.is_empty() {
            return;
        }
        match self.settings.mode {
            NarrationMode::Single => {
                for message in batch {
                    self.pre_generate(message);
                }
            }
            NarrationMode::Bulk => {
                let outcome = self.request_bulk(batch);
                debug!("Bulk narration request: {outcome:?}");
            }
        }
    }

    fn pre_generate(&mut self, message: &Message) {
        let id = message.key();
        if message.kind != MessageKind::AgentTurn
            || self.cache.contains(id)
            || self.pending.contains_key(id)
        {
            return;
        }
        let Some(text) = narratable_text(&message.text) else {
            return;
        };

        let synth = self.synth.clone();
        let events = self.events.clone();
        let thread_epoch = self.thread_epoch;
        let message_id = id.to_string();
        let task_id = message_id.clone();

        let task = tokio::spawn(async move {
            let result = synth.synthesize(&text).await;
            let _ = events.send(NarrationEvent::PreGenerated {
                thread_epoch,
                message_id,
                result,
            });
        });
        self.pending.insert(task_id, task);
    }

    /// Generate and play one clip for `batch`, unless the same batch is
    /// already playing or another generation holds the lock.
    pub fn request_bulk(&mut self, batch: &[Message]) -> BulkRequest {
        if !self.settings.enabled || self.settings.mode != NarrationMode::Bulk {
            return BulkRequest::Disabled;
        }

        let voiced: Vec<Message> = batch
            .iter()
            .filter(|m| m.kind == MessageKind::AgentTurn && narratable_text(&m.text).is_some())
            .cloned()
            .collect();
        if voiced.is_empty() {
            return BulkRequest::NothingToSay;
        }

        let fingerprint = batch_fingerprint(&voiced);
        if self.bulk.fingerprint.as_deref() == Some(fingerprint.as_str())
            && self.playback.is_playing(PlaybackMode::Bulk)
        {
            return BulkRequest::Unchanged;
        }

        if let Some(generation) = &self.bulk.generating {
            if !generation.task.is_finished() {
                debug!(
                    "Bulk generation for {} in flight, rejecting {}",
                    short(&generation.fingerprint),
                    short(&fingerprint)
                );
                return BulkRequest::Locked;
            }
            warn!("Bulk generation task ended without reporting, releasing lock");
            self.bulk.generating = None;
        }

        self.bulk.stop_player();
        self.playback.stop_immediately();

        let synth = self.synth.clone();
        let events = self.events.clone();
        let turn_epoch = self.turn_epoch;
        let task_fingerprint = fingerprint.clone();
        info!(
            "Generating bulk narration for {} messages ({})",
            voiced.len(),
            short(&fingerprint)
        );

        let task = tokio::spawn(async move {
            let result = synth.synthesize_batch(&voiced).await;
            let _ = events.send(NarrationEvent::BulkReady {
                turn_epoch,
                fingerprint: task_fingerprint,
                result,
            });
        });
        self.bulk.generating = Some(Generation { fingerprint, task });
        BulkRequest::Started
    }

    /// Apply a generation result reported by a spawned task.
    pub fn on_event(&mut self, event: NarrationEvent) {
        match event {
            NarrationEvent::PreGenerated {
                thread_epoch,
                message_id,
                result,
            } => {
                if thread_epoch != self.thread_epoch {
                    debug!("Dropping clip for {message_id} from an old thread");
                    return;
                }
                self.pending.remove(&message_id);
                match result {
                    Ok(clip) => self.cache.insert(message_id, clip),
                    Err(e) => warn!("Pre-generation failed for {message_id}: {e}"),
                }
            }
            NarrationEvent::BulkReady {
                turn_epoch,
                fingerprint,
                result,
            } => {
                if turn_epoch != self.turn_epoch {
                    debug!("Dropping bulk clip {} from an interrupted turn", short(&fingerprint));
                    return;
                }
                self.bulk.generating = None;

                let mut record = NarrationRecord::now("bulk", &fingerprint, 0);
                match result {
                    Ok(clip) => {
                        record.outcome = "generated".into();
                        self.bulk.fingerprint = Some(fingerprint);
                        self.bulk.clip = Some(clip.clone());
                        if self.settings.enabled && self.settings.mode == NarrationMode::Bulk {
                            self.start_bulk_playback(clip);
                        }
                    }
                    Err(e) => {
                        record.outcome = "failed".into();
                        warn!("Bulk synthesis failed: {e}");
                    }
                }
                if let Some(dir) = &self.history_dir {
                    save_record(dir, &record);
                }
            }
        }
    }

    fn start_bulk_playback(&mut self, clip: Clip) {
        self.bulk.stop_player();
        let playback = self.playback.clone();
        self.bulk.player = Some(tokio::spawn(async move {
            match playback.play(&clip, PlaybackMode::Bulk).await {
                Ok(outcome) => debug!("Bulk playback ended: {outcome:?}"),
                Err(e) => warn!("Bulk playback failed: {e}"),
            }
        }));
    }

    /// Narrate a message that was just revealed.
    ///
    /// Uses the pre-generated clip when there is one, otherwise synthesizes
    /// on demand. The returned receiver always resolves: a task that dies
    /// drops its sender.
    pub fn speak(&mut self, message: &Message) -> SpeechStart {
        if !self.settings.enabled || self.settings.mode != NarrationMode::Single {
            return SpeechStart::Skipped(SkipReason::Disabled);
        }
        if !self.gate.is_open() {
            return SpeechStart::Skipped(SkipReason::AudioLocked);
        }
        let Some(text) = narratable_text(&message.text) else {
            return SpeechStart::Skipped(SkipReason::NothingToSay);
        };

        self.abort_speech();

        let (done, rx) = oneshot::channel();
        let cached = self.cache.get(message.key()).cloned();
        let synth = self.synth.clone();
        let playback = self.playback.clone();
        let history_dir = self.history_dir.clone();
        let message_id = message.key().to_string();

        self.speech = Some(tokio::spawn(async move {
            let mut record = NarrationRecord::now("single", &message_id, text.chars().count());
            record.cache_hit = cached.is_some();

            let started = Instant::now();
            let clip = match cached {
                Some(clip) => Ok(clip),
                None => synth.synthesize(&text).await,
            };
            record.synth_latency_ms = started.elapsed().as_millis() as i64;

            let outcome = match clip {
                Ok(clip) => match playback.play(&clip, PlaybackMode::Single).await {
                    Ok(outcome) => SpeechOutcome::from(outcome),
                    Err(e) => {
                        warn!("Playback failed for {message_id}: {e}");
                        SpeechOutcome::Failed
                    }
                },
                Err(e) => {
                    warn!("Synthesis failed for {message_id}: {e}");
                    SpeechOutcome::Failed
                }
            };

            record.outcome = outcome.label().into();
            if let Some(dir) = history_dir {
                save_record(&dir, &record);
            }
            let _ = done.send(outcome);
        }));

        SpeechStart::Started(rx)
    }

    /// Stop narration for the current turn: the user spoke or an interrupt
    /// event arrived. Single-mode audio fades out; bulk audio stops at once
    /// and its loaded clip is discarded.
    pub fn interrupt(&mut self) {
        self.turn_epoch += 1;
        self.abort_speech();

        match self.settings.mode {
            NarrationMode::Single => {
                self.playback.fade_out_and_stop();
            }
            NarrationMode::Bulk => {
                self.bulk.stop_player();
                self.playback.stop_immediately();
                self.bulk.clip = None;
                self.bulk.fingerprint = None;
            }
        }
        self.bulk.release_lock();
    }

    /// New thread: stop everything and forget every clip.
    pub fn reset_thread(&mut self) {
        self.thread_epoch += 1;
        self.turn_epoch += 1;
        self.abort_speech();
        for (_, task) in self.pending.drain() {
            task.abort();
        }
        self.bulk.stop_player();
        self.bulk.release_lock();
        self.bulk = BulkSession::default();
        self.cache.clear();
        self.playback.stop_immediately();
    }

    /// Switch narration on/off or change mode. Returns false if nothing changed.
    pub fn apply_settings(&mut self, settings: NarrationSettings) -> bool {
        if settings == self.settings {
            return false;
        }
        info!(
            "Narration {} ({} mode)",
            if settings.enabled { "enabled" } else { "disabled" },
            settings.mode
        );

        self.turn_epoch += 1;
        self.abort_speech();
        self.bulk.stop_player();
        self.bulk.release_lock();
        self.bulk.clip = None;
        self.bulk.fingerprint = None;
        self.playback.stop_immediately();

        self.settings = settings;
        true
    }

    /// Shut down: cancel all tasks and release the audio device.
    pub fn teardown(&mut self) {
        self.reset_thread();
        self.playback.release();
    }

    fn abort_speech(&mut self) {
        if let Some(task) = self.speech.take() {
            task.abort();
        }
    }
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlaybackConfig;
    use crate::testing::{FakeOutput, FakeSynth};
    use std::time::Duration;

    struct Rig {
        coordinator: NarrationCoordinator,
        events: mpsc::UnboundedReceiver<NarrationEvent>,
        synth: Arc<FakeSynth>,
        output: Arc<FakeOutput>,
    }

    fn rig(mode: NarrationMode, synth: FakeSynth, unlocked: bool) -> Rig {
        let synth = Arc::new(synth);
        let output = Arc::new(FakeOutput::new());
        let gate = UnlockGate::new();
        if unlocked {
            gate.unlock();
        }
        let playback = PlaybackEngine::new(output.clone(), gate.clone(), PlaybackConfig::default());
        let (coordinator, events) = NarrationCoordinator::new(
            NarrationSettings { enabled: true, mode },
            synth.clone(),
            playback,
            gate,
            None,
        );
        Rig {
            coordinator,
            events,
            synth,
            output,
        }
    }

    fn batch(texts: &[&str]) -> Vec<Message> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Message::agent(*t).with_id(format!("a{i}")))
            .collect()
    }

    async fn settle(rig: &mut Rig) {
        let event = rig.events.recv().await.unwrap();
        rig.coordinator.on_event(event);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = batch(&["one", "two"]);
        let mut b = a.clone();
        assert_eq!(batch_fingerprint(&a), batch_fingerprint(&b));
        b[1].text.push('!');
        assert_ne!(batch_fingerprint(&a), batch_fingerprint(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_bulk_batches_generate_once() {
        let mut rig = rig(NarrationMode::Bulk, FakeSynth::new(), true);
        let turns = batch(&["Let's look at question two.", "Start with the gradient."]);

        assert_eq!(rig.coordinator.request_bulk(&turns), BulkRequest::Started);
        assert_eq!(rig.coordinator.request_bulk(&turns), BulkRequest::Locked);
        settle(&mut rig).await;
        assert!(rig.coordinator.playback().is_playing(PlaybackMode::Bulk));

        for _ in 0..3 {
            assert_eq!(rig.coordinator.request_bulk(&turns), BulkRequest::Unchanged);
        }
        assert_eq!(rig.synth.batch_calls(), 1);
        assert_eq!(rig.output.started(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_bulk_request_is_rejected_while_locked() {
        let mut rig = rig(NarrationMode::Bulk, FakeSynth::slow(Duration::from_secs(3)), true);

        assert_eq!(rig.coordinator.request_bulk(&batch(&["first"])), BulkRequest::Started);
        assert_eq!(rig.coordinator.request_bulk(&batch(&["second"])), BulkRequest::Locked);
        assert!(rig.coordinator.is_generating_bulk());

        settle(&mut rig).await;
        assert!(!rig.coordinator.is_generating_bulk());
        assert_eq!(rig.coordinator.request_bulk(&batch(&["second"])), BulkRequest::Started);
        assert_eq!(rig.synth.batch_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bulk_generation_releases_lock() {
        let mut rig = rig(NarrationMode::Bulk, FakeSynth::new(), true);
        rig.synth.set_failing(true);

        assert_eq!(rig.coordinator.request_bulk(&batch(&["hello"])), BulkRequest::Started);
        settle(&mut rig).await;

        assert!(!rig.coordinator.is_generating_bulk());
        assert_eq!(rig.coordinator.bulk_fingerprint(), None);
        assert_eq!(rig.output.started(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_drops_in_flight_bulk_result() {
        let mut rig = rig(NarrationMode::Bulk, FakeSynth::slow(Duration::from_secs(1)), true);
        rig.coordinator.request_bulk(&batch(&["hello"]));

        rig.coordinator.interrupt();
        assert!(!rig.coordinator.is_generating_bulk());

        // The aborted task never reports; nothing stale can arrive.
        let next = tokio::time::timeout(Duration::from_secs(5), rig.events.recv()).await;
        assert!(next.is_err());
        assert_eq!(rig.output.started(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_interrupt_hard_stops_and_forgets_the_clip() {
        let mut rig = rig(NarrationMode::Bulk, FakeSynth::new(), true);
        let turns = batch(&["Here is the plan."]);
        rig.coordinator.request_bulk(&turns);
        assert_eq!(rig.coordinator.session_state(), PlaybackState::Generating);

        settle(&mut rig).await;
        assert_eq!(rig.coordinator.session_state(), PlaybackState::Playing);
        assert!(rig.coordinator.bulk_fingerprint().is_some());

        rig.coordinator.interrupt();
        assert_eq!(rig.output.voice(0).stop_calls(), 1);
        assert!((rig.output.voice(0).gain() - 1.0).abs() < f32::EPSILON);
        assert_eq!(rig.coordinator.bulk_fingerprint(), None);
        assert_eq!(rig.coordinator.session_state(), PlaybackState::Stopped);

        // Same content after the interrupt is a new turn and is generated again.
        assert_eq!(rig.coordinator.request_bulk(&turns), BulkRequest::Started);
        settle(&mut rig).await;
        assert_eq!(rig.synth.batch_calls(), 2);
        assert_eq!(rig.output.started(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_generated_clip_is_used_without_resynthesis() {
        let mut rig = rig(NarrationMode::Single, FakeSynth::new(), true);
        let turns = batch(&["Nice work on part a."]);

        rig.coordinator.prepare_batch(&turns);
        settle(&mut rig).await;
        assert!(rig.coordinator.cache().contains("a0"));
        assert_eq!(rig.synth.single_calls(), 1);

        let SpeechStart::Started(done) = rig.coordinator.speak(&turns[0]) else {
            panic!("expected narration to start");
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        rig.output.finish_all();

        assert_eq!(done.await.unwrap(), SpeechOutcome::Finished);
        assert_eq!(rig.synth.single_calls(), 1);
        assert_eq!(rig.output.voice(0).clip.bytes(), b"Nice work on part a.");
    }

    #[tokio::test(start_paused = true)]
    async fn speech_failure_still_reports() {
        let mut rig = rig(NarrationMode::Single, FakeSynth::new(), true);
        rig.synth.set_failing(true);

        let SpeechStart::Started(done) = rig.coordinator.speak(&batch(&["hi"])[0]) else {
            panic!("expected narration to start");
        };
        assert_eq!(done.await.unwrap(), SpeechOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn locked_gate_and_code_only_turns_are_skipped() {
        let mut locked = rig(NarrationMode::Single, FakeSynth::new(), false);
        assert!(matches!(
            locked.coordinator.speak(&batch(&["hi"])[0]),
            SpeechStart::Skipped(SkipReason::AudioLocked)
        ));
        assert!(locked.coordinator.voiced_pacing());

        let mut open = rig(NarrationMode::Single, FakeSynth::new(), true);
        assert!(matches!(
            open.coordinator.speak(&batch(&["```\nx = 1\n```"])[0]),
            SpeechStart::Skipped(SkipReason::NothingToSay)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn thread_reset_ignores_late_pre_generation() {
        let mut rig = rig(NarrationMode::Single, FakeSynth::new(), true);
        let turns = batch(&["old thread turn"]);
        rig.coordinator.prepare_batch(&turns);

        let event = rig.events.recv().await.unwrap();
        rig.coordinator.reset_thread();
        rig.coordinator.on_event(event);

        assert!(rig.coordinator.cache().is_empty());
    }
}
