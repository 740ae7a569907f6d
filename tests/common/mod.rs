//! Shared fixtures for integration tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tutor_narrator::api::{router, ApiState};
use tutor_narrator::config::Config;
use tutor_narrator::engine::{self, EngineHandle, EngineSnapshot};
use tutor_narrator::gate::UnlockGate;
use tutor_narrator::message::Message;
use tutor_narrator::playback::{AudioOutput, Clip, PlaybackError, Voice};
use tutor_narrator::synth::{SynthError, Synthesizer};

/// Synthesizer that answers instantly with the text as "audio".
pub struct EchoSynth;

#[async_trait]
impl Synthesizer for EchoSynth {
    async fn synthesize(&self, text: &str) -> Result<Clip, SynthError> {
        Ok(Clip::from_bytes(text.as_bytes().to_vec()))
    }

    async fn synthesize_batch(&self, messages: &[Message]) -> Result<Clip, SynthError> {
        let joined: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        Ok(Clip::from_bytes(joined.join(" ").into_bytes()))
    }
}

struct SilentVoice;

impl Voice for SilentVoice {
    fn set_gain(&self, _gain: f32) {}
    fn stop(&self) {}
    fn is_finished(&self) -> bool {
        true
    }
}

/// Audio device whose clips end as soon as they start.
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn start(&self, _clip: &Clip) -> Result<Box<dyn Voice>, PlaybackError> {
        Ok(Box::new(SilentVoice))
    }

    fn release(&self) {}
}

pub fn test_app() -> (axum::Router, EngineHandle) {
    let config = Config::default();
    let (handle, _task) = engine::spawn(
        &config,
        Arc::new(EchoSynth),
        Arc::new(NullOutput),
        UnlockGate::new(),
    );
    let app = router(ApiState {
        engine: handle.clone(),
        history_dir: None,
    });
    (app, handle)
}

/// Wait until the engine publishes a snapshot satisfying `condition`.
pub async fn wait_for(
    handle: &EngineHandle,
    condition: impl Fn(&EngineSnapshot) -> bool,
) -> EngineSnapshot {
    let mut rx = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if condition(&snapshot) {
                    return snapshot.clone();
                }
            }
            rx.changed().await.expect("engine stopped");
        }
    })
    .await
    .expect("condition not reached")
}
