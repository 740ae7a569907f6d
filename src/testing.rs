//! Test doubles for the synthesis service and the audio device.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::message::Message;
use crate::playback::{AudioOutput, Clip, PlaybackError, Voice};
use crate::synth::{SynthError, Synthesizer};

#[derive(Default)]
pub struct FakeSynth {
    single_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    fail: AtomicBool,
    delay: Option<Duration>,
}

impl FakeSynth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    async fn respond(&self, payload: String) -> Result<Clip, SynthError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SynthError::Status(503));
        }
        Ok(Clip::from_bytes(payload.into_bytes()))
    }
}

#[async_trait]
impl Synthesizer for FakeSynth {
    async fn synthesize(&self, text: &str) -> Result<Clip, SynthError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.respond(text.to_string()).await
    }

    async fn synthesize_batch(&self, messages: &[Message]) -> Result<Clip, SynthError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let joined: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        self.respond(joined.join(" ")).await
    }
}

pub struct FakeVoiceState {
    gain: Mutex<f32>,
    stop_calls: AtomicUsize,
    finished: AtomicBool,
    pub clip: Clip,
}

impl FakeVoiceState {
    pub fn gain(&self) -> f32 {
        *self.gain.lock().unwrap()
    }

    pub fn stopped(&self) -> bool {
        self.stop_calls() > 0
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

struct FakeVoice(Arc<FakeVoiceState>);

impl Voice for FakeVoice {
    fn set_gain(&self, gain: f32) {
        *self.0.gain.lock().unwrap() = gain;
    }

    fn stop(&self) {
        self.0.stop_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::SeqCst) || self.0.stopped()
    }
}

#[derive(Default)]
pub struct FakeOutput {
    voices: Mutex<Vec<Arc<FakeVoiceState>>>,
    releases: AtomicUsize,
    fail: bool,
}

impl FakeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn started(&self) -> usize {
        self.voices.lock().unwrap().len()
    }

    pub fn voice(&self, index: usize) -> Arc<FakeVoiceState> {
        self.voices.lock().unwrap()[index].clone()
    }

    pub fn finish_all(&self) {
        for voice in self.voices.lock().unwrap().iter() {
            voice.finish();
        }
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl AudioOutput for FakeOutput {
    fn start(&self, clip: &Clip) -> Result<Box<dyn Voice>, PlaybackError> {
        if self.fail {
            return Err(PlaybackError::Device("no device".into()));
        }
        let state = Arc::new(FakeVoiceState {
            gain: Mutex::new(1.0),
            stop_calls: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            clip: clip.clone(),
        });
        self.voices.lock().unwrap().push(state.clone());
        Ok(Box::new(FakeVoice(state)))
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
