use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// The synthesis API caps input length; anything longer is cut, not split.
const MAX_SPEECH_CHARS: usize = 500;
const MODEL_ID: &str = "eleven_multilingual_v2";
const OUTPUT_FORMAT: &str = "mp3_44100_128";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    voice_id: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        voice_id: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            voice_id: voice_id.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let text = text.trim();
        if text.is_empty() {
            bail!("Refusing to synthesize empty text");
        }
        let clipped: String = text.chars().take(MAX_SPEECH_CHARS).collect();

        let url = format!("{}/v1/text-to-speech/{}", self.base_url, self.voice_id);
        let req = SpeechRequest {
            text: &clipped,
            model_id: MODEL_ID,
        };

        let res = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .header("xi-api-key", &self.api_key)
            .query(&[("output_format", OUTPUT_FORMAT)])
            .json(&req)
            .send()
            .await
            .context("Failed to reach speech synthesis API")?;

        if !res.status().is_success() {
            return Err(anyhow!(
                "Speech synthesis API Error: {}",
                res.text().await.unwrap_or_default()
            ));
        }

        let audio = res.bytes().await.context("Failed to read synthesized audio")?;
        debug!("Synthesized {} chars into {} audio bytes", clipped.chars().count(), audio.len());
        Ok(audio)
    }
}
