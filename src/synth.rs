//! Speech synthesis client.
//!
//! The synthesis service turns text into encoded audio. Single mode asks for
//! one clip per message; bulk mode asks for one clip covering a whole batch.
//! No timeout is imposed here unless the config sets one on the HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::SynthesisConfig;
use crate::message::{narratable_text, Message};
use crate::playback::Clip;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("synthesis request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("synthesis service returned status {0}")]
    Status(u16),
    #[error("synthesis service returned no audio")]
    EmptyAudio,
    #[error("nothing to narrate")]
    NothingToSay,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Clip, SynthError>;
    async fn synthesize_batch(&self, messages: &[Message]) -> Result<Clip, SynthError>;
}

pub struct HttpSynthesizer {
    config: SynthesisConfig,
    client: Client,
}

impl HttpSynthesizer {
    pub fn new(config: SynthesisConfig) -> Result<Self, SynthError> {
        let mut builder = Client::builder();
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_secs));
        }
        let client = builder.build()?;

        Ok(Self { config, client })
    }

    async fn post_for_audio(&self, path: &str, body: serde_json::Value) -> Result<Clip, SynthError> {
        let url = format!("{}{path}", self.config.host.trim_end_matches('/'));
        let resp = self.client.post(&url).json(&body).send().await?;

        if !resp.status().is_success() {
            return Err(SynthError::Status(resp.status().as_u16()));
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(SynthError::EmptyAudio);
        }
        debug!("Synthesized {} bytes from {url}", bytes.len());
        Ok(Clip::from_bytes(bytes.to_vec()))
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Clip, SynthError> {
        let body = json!({
            "text": text,
            "voice": self.config.voice,
            "speed": self.config.speed,
        });
        self.post_for_audio("/synthesize", body).await
    }

    async fn synthesize_batch(&self, messages: &[Message]) -> Result<Clip, SynthError> {
        let segments: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(|m| narratable_text(&m.text).map(|text| json!({ "id": m.key(), "text": text })))
            .collect();

        if segments.is_empty() {
            return Err(SynthError::NothingToSay);
        }

        let body = json!({
            "segments": segments,
            "voice": self.config.voice,
            "speed": self.config.speed,
        });
        self.post_for_audio("/synthesize/batch", body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_without_narratable_text_is_rejected_locally() {
        let synth = HttpSynthesizer::new(SynthesisConfig {
            host: "http://127.0.0.1:9".into(),
            ..SynthesisConfig::default()
        })
        .unwrap();

        let batch = vec![Message::agent("```\ncode only\n```"), Message::agent("   ")];
        let result = synth.synthesize_batch(&batch).await;
        assert!(matches!(result, Err(SynthError::NothingToSay)));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_request_error() {
        let synth = HttpSynthesizer::new(SynthesisConfig {
            host: "http://127.0.0.1:9".into(),
            request_timeout_secs: 2,
            ..SynthesisConfig::default()
        })
        .unwrap();

        let result = synth.synthesize("hello").await;
        assert!(matches!(result, Err(SynthError::Request(_))));
    }
}
