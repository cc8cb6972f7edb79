//! Speech-to-text (STT) engines
//!
//! Engines consume forwarded mic frames and report [`TranscriptEvent`]s on a
//! channel. Streaming engines emit partials followed by a final; the batch
//! engine here buffers an utterance and emits a single final.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::{SttConfig, SttProvider};
use crate::{Error, Result};

use super::{AudioFrame, samples_to_wav};

/// A recognition result for one utterance
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    /// Recognized text
    pub text: String,

    /// Whether the engine considers the utterance complete
    pub is_final: bool,

    /// Engine confidence in `[0, 1]`, when reported
    pub confidence: Option<f32>,

    /// Identifies the utterance across partials and its final
    pub utterance_id: String,
}

impl TranscriptEvent {
    /// An interim result
    pub fn partial(text: impl Into<String>, utterance_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: None,
            utterance_id: utterance_id.into(),
        }
    }

    /// A complete result
    pub fn final_result(text: impl Into<String>, utterance_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence: None,
            utterance_id: utterance_id.into(),
        }
    }

    /// Attach a confidence score
    #[must_use]
    pub const fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// A speech recognizer fed with mic frames
#[async_trait]
pub trait SttEngine: Send {
    /// Engine name for logs
    fn name(&self) -> &'static str;

    /// Begin recognition, reporting results on `events`
    ///
    /// Returns whether the engine is ready to accept audio.
    async fn start(&mut self, events: mpsc::Sender<TranscriptEvent>) -> Result<bool>;

    /// Feed one frame of forwarded mic audio
    async fn feed_audio(&mut self, frame: &AudioFrame) -> Result<()>;

    /// Drop any buffered audio (called when playback starts)
    fn clear(&mut self) {}

    /// Level at which a frame counts as voiced, for engines that segment locally
    fn set_speech_rms(&mut self, _rms: f32) {}

    /// Stop recognition and release resources
    async fn stop(&mut self);
}

/// Text recognized from a complete audio clip
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    /// Recognized text
    pub text: String,

    /// Provider confidence, when reported
    pub confidence: Option<f32>,
}

/// Transcribes a complete WAV clip
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV bytes
    async fn transcribe(&self, wav: &[u8]) -> Result<Transcription>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Transcribes clips through a hosted STT API
pub struct HttpTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
    provider: SttProvider,
}

impl HttpTranscriber {
    /// Create a transcriber for the configured provider
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(provider: SttProvider, api_key: Option<String>, model: String) -> Result<Self> {
        let api_key = api_key.filter(|k| !k.is_empty()).ok_or_else(|| {
            Error::Config(match provider {
                SttProvider::Whisper => "OpenAI API key required for Whisper".to_string(),
                SttProvider::Deepgram => "Deepgram API key required".to_string(),
            })
        })?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            provider,
        })
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(&self, audio: &[u8]) -> Result<Transcription> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;
        Ok(Transcription {
            text: result.text,
            confidence: None,
        })
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: &[u8]) -> Result<Transcription> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&punctuate=true",
            self.model
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;
        Ok(result
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| Transcription {
                text: a.transcript,
                confidence: a.confidence,
            })
            .unwrap_or(Transcription {
                text: String::new(),
                confidence: None,
            }))
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<Transcription> {
        match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(wav).await,
            SttProvider::Deepgram => self.transcribe_deepgram(wav).await,
        }
    }
}

/// Buffers an utterance until trailing silence, then transcribes it whole
pub struct BatchSttEngine {
    transcriber: Arc<dyn Transcriber>,
    config: SttConfig,
    speech_rms: f32,
    events: Option<mpsc::Sender<TranscriptEvent>>,
    buffer: Vec<i16>,
    sample_rate: u32,
    voiced: Duration,
    trailing_silence: Duration,
    in_flight: JoinSet<()>,
}

impl BatchSttEngine {
    /// Create a batch engine
    ///
    /// `speech_rms` is the level at which a frame counts as voiced.
    #[must_use]
    pub fn new(transcriber: Arc<dyn Transcriber>, config: SttConfig, speech_rms: f32) -> Self {
        Self {
            transcriber,
            config,
            speech_rms,
            events: None,
            buffer: Vec::new(),
            sample_rate: 0,
            voiced: Duration::ZERO,
            trailing_silence: Duration::ZERO,
            in_flight: JoinSet::new(),
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.voiced = Duration::ZERO;
        self.trailing_silence = Duration::ZERO;
    }

    fn buffered(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.buffer.len() as u64 * 1_000_000 / u64::from(self.sample_rate))
    }

    fn finish_utterance(&mut self, reason: &'static str) -> Result<()> {
        let samples = std::mem::take(&mut self.buffer);
        let voiced = self.voiced;
        self.reset();

        if voiced < self.config.min_utterance {
            tracing::trace!(voiced_ms = voiced.as_millis(), "utterance too short, ignored");
            return Ok(());
        }
        let Some(events) = self.events.clone() else {
            return Ok(());
        };

        let wav = samples_to_wav(&samples, self.sample_rate)?;
        let transcriber = Arc::clone(&self.transcriber);
        let timeout = self.config.transcribe_timeout;
        let utterance_id = uuid::Uuid::new_v4().to_string();

        tracing::debug!(
            utterance_id = %utterance_id,
            reason,
            samples = samples.len(),
            "utterance captured, transcribing"
        );

        // Reap finished transcriptions so the set stays small
        while self.in_flight.try_join_next().is_some() {}

        self.in_flight.spawn(async move {
            let text = match tokio::time::timeout(timeout, transcriber.transcribe(&wav)).await {
                Ok(Ok(t)) => {
                    tracing::info!(utterance_id = %utterance_id, transcript = %t.text, "transcription complete");
                    Some(t)
                }
                Ok(Err(e)) => {
                    tracing::warn!(utterance_id = %utterance_id, error = %e, "transcription failed");
                    None
                }
                Err(_) => {
                    tracing::warn!(
                        utterance_id = %utterance_id,
                        timeout_ms = timeout.as_millis(),
                        "transcription timed out"
                    );
                    None
                }
            };

            // A failed clip still closes the utterance, as an empty final
            let event = text.map_or_else(
                || TranscriptEvent::final_result("", utterance_id.clone()),
                |t| TranscriptEvent {
                    text: t.text,
                    is_final: true,
                    confidence: t.confidence,
                    utterance_id: utterance_id.clone(),
                },
            );
            if events.send(event).await.is_err() {
                tracing::debug!("transcript receiver dropped");
            }
        });

        Ok(())
    }
}

#[async_trait]
impl SttEngine for BatchSttEngine {
    fn name(&self) -> &'static str {
        "batch"
    }

    async fn start(&mut self, events: mpsc::Sender<TranscriptEvent>) -> Result<bool> {
        self.events = Some(events);
        self.reset();
        tracing::debug!(model = %self.config.model, "batch STT started");
        Ok(true)
    }

    async fn feed_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        if self.events.is_none() || frame.is_empty() {
            return Ok(());
        }
        if self.sample_rate != frame.sample_rate() {
            // Rate changed under us (device reopen); the old buffer is unusable
            self.reset();
            self.sample_rate = frame.sample_rate();
        }

        let voiced = frame.rms() >= self.speech_rms;
        if self.buffer.is_empty() && !voiced {
            return Ok(());
        }

        self.buffer.extend_from_slice(frame.samples());
        if voiced {
            self.voiced += frame.duration();
            self.trailing_silence = Duration::ZERO;
        } else {
            self.trailing_silence += frame.duration();
        }

        if self.trailing_silence >= self.config.end_silence {
            self.finish_utterance("trailing silence")?;
        } else if self.buffered() >= self.config.max_utterance {
            self.finish_utterance("max length")?;
        }
        Ok(())
    }

    fn set_speech_rms(&mut self, rms: f32) {
        if (rms - self.speech_rms).abs() > f32::EPSILON {
            tracing::debug!(from = self.speech_rms, to = rms, "batch STT speech level changed");
            self.speech_rms = rms;
        }
    }

    fn clear(&mut self) {
        if !self.buffer.is_empty() {
            tracing::debug!(samples = self.buffer.len(), "discarding buffered STT audio");
        }
        self.reset();
    }

    async fn stop(&mut self) {
        self.reset();
        self.events = None;
        self.in_flight.abort_all();
        while self.in_flight.join_next().await.is_some() {}
        tracing::debug!("batch STT stopped");
    }
}
