//! Playback engine: one clip at a time, with fade-out and hard stop.
//!
//! The audio device is an explicitly owned resource (`AudioOutput`). The
//! rodio implementation opens the output stream on first use and releases
//! it on teardown. Every operation consults the unlock gate first and
//! reports a benign skip while it is closed.

use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::PlaybackConfig;
use crate::gate::UnlockGate;

/// Opaque synthesized audio, decoded when played.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clip {
    bytes: Arc<[u8]>,
}

impl Clip {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::from(bytes.into()),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("failed to open audio output: {0}")]
    Device(String),
    #[error("failed to decode clip: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    Single,
    Bulk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    /// A bulk clip is being synthesized; nothing sounding yet.
    Generating,
    Playing,
    Fading,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Finished,
    /// Cut short by a fade-out or hard stop.
    Stopped,
    /// Gate closed; nothing was played.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltOutcome {
    Skipped,
    NothingPlaying,
    Halted,
}

/// A clip that is currently sounding.
pub trait Voice: Send + Sync {
    fn set_gain(&self, gain: f32);
    fn stop(&self);
    fn is_finished(&self) -> bool;
}

/// Owned audio device.
pub trait AudioOutput: Send + Sync {
    fn start(&self, clip: &Clip) -> Result<Box<dyn Voice>, PlaybackError>;
    /// Release the underlying device. The next `start` reacquires it.
    fn release(&self);
}

// --- rodio backend ---

pub struct RodioOutput {
    // In rodio 0.21, OutputStream is the handle; dropping it closes the device
    stream: Mutex<Option<OutputStream>>,
}

impl RodioOutput {
    pub fn new() -> Self {
        Self {
            stream: Mutex::new(None),
        }
    }
}

impl Default for RodioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for RodioOutput {
    fn start(&self, clip: &Clip) -> Result<Box<dyn Voice>, PlaybackError> {
        let mut guard = lock(&self.stream);
        if guard.is_none() {
            let stream = OutputStreamBuilder::open_default_stream()
                .map_err(|e| PlaybackError::Device(e.to_string()))?;
            info!("Audio output opened");
            *guard = Some(stream);
        }
        let Some(stream) = guard.as_ref() else {
            return Err(PlaybackError::Device("output stream unavailable".into()));
        };

        let source = Decoder::new(Cursor::new(clip.bytes().to_vec()))
            .map_err(|e| PlaybackError::Decode(e.to_string()))?;
        let sink = Sink::connect_new(stream.mixer());
        sink.append(source);

        Ok(Box::new(RodioVoice { sink }))
    }

    fn release(&self) {
        if lock(&self.stream).take().is_some() {
            info!("Audio output released");
        }
    }
}

struct RodioVoice {
    sink: Sink,
}

impl Voice for RodioVoice {
    fn set_gain(&self, gain: f32) {
        self.sink.set_volume(gain);
    }

    fn stop(&self) {
        self.sink.stop();
    }

    fn is_finished(&self) -> bool {
        self.sink.empty()
    }
}

// --- engine ---

struct ActiveClip {
    id: u64,
    mode: PlaybackMode,
    voice: Box<dyn Voice>,
}

/// A clip replaced mid-fade. Its ramp keeps running and stops it.
struct Retiring {
    clip: ActiveClip,
    ramp: JoinHandle<()>,
}

impl Retiring {
    fn stop(self) {
        self.ramp.abort();
        self.clip.voice.stop();
    }
}

struct PlaybackInner {
    active: Option<ActiveClip>,
    state: PlaybackState,
    gain: f32,
    ramp: Option<JoinHandle<()>>,
    retiring: Option<Retiring>,
    next_id: u64,
}

impl PlaybackInner {
    fn voice(&self, id: u64) -> Option<&dyn Voice> {
        match (&self.active, &self.retiring) {
            (Some(active), _) if active.id == id => Some(active.voice.as_ref()),
            (_, Some(retiring)) if retiring.clip.id == id => Some(retiring.clip.voice.as_ref()),
            _ => None,
        }
    }

    fn stop_retiring(&mut self) -> bool {
        match self.retiring.take() {
            Some(retiring) => {
                debug!("Stopped fading clip #{}", retiring.clip.id);
                retiring.stop();
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct PlaybackEngine {
    inner: Arc<Mutex<PlaybackInner>>,
    output: Arc<dyn AudioOutput>,
    gate: UnlockGate,
    config: PlaybackConfig,
}

impl PlaybackEngine {
    pub fn new(output: Arc<dyn AudioOutput>, gate: UnlockGate, config: PlaybackConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PlaybackInner {
                active: None,
                state: PlaybackState::Idle,
                gain: 1.0,
                ramp: None,
                retiring: None,
                next_id: 0,
            })),
            output,
            gate,
            config,
        }
    }

    pub fn state(&self) -> PlaybackState {
        lock(&self.inner).state
    }

    pub fn gain(&self) -> f32 {
        lock(&self.inner).gain
    }

    /// True while a clip of `mode` is sounding at full volume (not fading).
    pub fn is_playing(&self, mode: PlaybackMode) -> bool {
        let inner = lock(&self.inner);
        inner.state == PlaybackState::Playing && inner.active.as_ref().is_some_and(|a| a.mode == mode)
    }

    /// Play a clip until it finishes or is stopped. Replaces whatever was
    /// playing; a clip that is fading out finishes its fade underneath.
    pub async fn play(&self, clip: &Clip, mode: PlaybackMode) -> Result<PlayOutcome, PlaybackError> {
        if !self.gate.is_open() {
            debug!("Audio locked, skipping {mode:?} playback");
            return Ok(PlayOutcome::Skipped);
        }

        self.retire_or_stop();
        let voice = self.output.start(clip)?;

        let id = {
            let mut inner = lock(&self.inner);
            inner.next_id += 1;
            let id = inner.next_id;
            voice.set_gain(inner.gain);
            inner.active = Some(ActiveClip { id, mode, voice });
            inner.state = PlaybackState::Playing;
            id
        };
        debug!("Playing {mode:?} clip #{id} ({} bytes)", clip.len());

        let mut poll = tokio::time::interval(self.config.poll());
        loop {
            poll.tick().await;
            let mut inner = lock(&self.inner);
            match inner.active.as_ref() {
                Some(active) if active.id == id => {
                    if active.voice.is_finished() {
                        inner.active = None;
                        inner.state = PlaybackState::Idle;
                        return Ok(PlayOutcome::Finished);
                    }
                }
                _ => return Ok(PlayOutcome::Stopped),
            }
        }
    }

    /// Ramp the current clip down exponentially, then hard-stop it.
    ///
    /// Returns immediately; the ramp runs on its own task. Calling it again
    /// restarts the ramp from the current gain.
    pub fn fade_out_and_stop(&self) -> HaltOutcome {
        if !self.gate.is_open() {
            return HaltOutcome::Skipped;
        }

        let mut inner = lock(&self.inner);
        if let Some(ramp) = inner.ramp.take() {
            ramp.abort();
        }

        let Some(id) = inner.active.as_ref().map(|a| a.id) else {
            inner.gain = 1.0;
            inner.state = PlaybackState::Stopped;
            return HaltOutcome::NothingPlaying;
        };

        let from = inner.gain;
        inner.state = PlaybackState::Fading;
        debug!("Fading out clip #{id} from gain {from:.3}");

        let engine = self.clone();
        inner.ramp = Some(tokio::spawn(async move {
            engine.run_fade(id, from).await;
        }));
        HaltOutcome::Halted
    }

    /// Stop the current clip, and any clip still fading, without a ramp.
    pub fn stop_immediately(&self) -> HaltOutcome {
        if !self.gate.is_open() {
            return HaltOutcome::Skipped;
        }

        let mut inner = lock(&self.inner);
        if let Some(ramp) = inner.ramp.take() {
            ramp.abort();
        }
        inner.gain = 1.0;
        let retired = inner.stop_retiring();

        match inner.active.take() {
            Some(active) => {
                active.voice.stop();
                inner.state = PlaybackState::Stopped;
                debug!("Stopped clip #{}", active.id);
                HaltOutcome::Halted
            }
            None => {
                if inner.state != PlaybackState::Idle {
                    inner.state = PlaybackState::Stopped;
                }
                if retired {
                    HaltOutcome::Halted
                } else {
                    HaltOutcome::NothingPlaying
                }
            }
        }
    }

    /// Clear the way for a new clip. A fading clip moves aside with its ramp;
    /// anything else is stopped at once.
    fn retire_or_stop(&self) {
        let mut inner = lock(&self.inner);
        let fading = inner.state == PlaybackState::Fading && inner.ramp.is_some();
        if !fading {
            drop(inner);
            self.stop_immediately();
            return;
        }

        inner.stop_retiring();
        if let (Some(clip), Some(ramp)) = (inner.active.take(), inner.ramp.take()) {
            debug!("Clip #{} keeps fading under the next clip", clip.id);
            inner.retiring = Some(Retiring { clip, ramp });
        }
        inner.gain = 1.0;
        inner.state = PlaybackState::Stopped;
    }

    /// Stop everything and release the audio device.
    pub fn release(&self) {
        {
            let mut inner = lock(&self.inner);
            if let Some(ramp) = inner.ramp.take() {
                ramp.abort();
            }
            if let Some(active) = inner.active.take() {
                active.voice.stop();
            }
            inner.stop_retiring();
            inner.gain = 1.0;
            inner.state = PlaybackState::Stopped;
        }
        self.output.release();
    }

    async fn run_fade(&self, id: u64, from: f32) {
        let window = self.config.fade();
        let step = self.config.fade_step();
        let steps = (window.as_millis() / step.as_millis()).max(1) as u32;

        for i in 1..=steps {
            tokio::time::sleep(step).await;
            let gain = ramp_gain(from, self.config.fade_floor, i as f32 / steps as f32);
            let mut inner = lock(&self.inner);
            let Some(voice) = inner.voice(id) else {
                return;
            };
            voice.set_gain(gain);
            if inner.active.as_ref().is_some_and(|a| a.id == id) {
                inner.gain = gain;
            }
        }

        tokio::time::sleep(self.config.stop_buffer()).await;

        let mut inner = lock(&self.inner);
        if inner.active.as_ref().is_some_and(|a| a.id == id) {
            if let Some(active) = inner.active.take() {
                active.voice.stop();
            }
            inner.state = PlaybackState::Stopped;
            inner.gain = 1.0;
            inner.ramp = None;
            debug!("Fade complete, clip #{id} stopped");
        } else if inner.retiring.as_ref().is_some_and(|r| r.clip.id == id) {
            if let Some(retiring) = inner.retiring.take() {
                retiring.clip.voice.stop();
            }
            debug!("Fade complete, replaced clip #{id} stopped");
        }
    }
}

impl Drop for PlaybackInner {
    fn drop(&mut self) {
        if let Some(ramp) = self.ramp.take() {
            ramp.abort();
        }
        if let Some(active) = self.active.take() {
            active.voice.stop();
        }
        self.stop_retiring();
    }
}

/// Exponential ramp from `from` towards `floor`; `progress` runs 0.0..=1.0.
pub fn ramp_gain(from: f32, floor: f32, progress: f32) -> f32 {
    let floor = floor.max(f32::MIN_POSITIVE);
    if from <= floor {
        return floor;
    }
    let progress = progress.clamp(0.0, 1.0);
    from * (floor / from).powf(progress)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
