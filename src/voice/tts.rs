//! Text-to-speech (TTS) processing
//!
//! Engines turn text into a stream of PCM frames at the playback rate.
//! Dropping the stream cancels delivery; a request already on the wire may
//! finish in the background but its audio goes nowhere.

use std::io::Cursor;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{TtsConfig, TtsProvider};
use crate::{Error, Result};

use super::AudioFrame;

/// Length of each synthesized frame handed to playback
const FRAME_MS: u32 = 40;

/// Frames buffered between the synthesis task and playback
const STREAM_BUFFER: usize = 16;

/// Synthesized audio, frame by frame
pub type AudioStream = BoxStream<'static, Result<AudioFrame>>;

/// A speech synthesizer
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Synthesize `text` into frames at `sample_rate`
    async fn synthesize(&self, text: &str, sample_rate: u32) -> Result<AudioStream>;
}

/// Synthesizes speech through a hosted TTS API
#[derive(Clone)]
pub struct HttpTts {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    speed: f32,
    model: String,
    provider: TtsProvider,
}

impl HttpTts {
    /// Create a synthesizer for the configured provider
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &TtsConfig, api_key: Option<String>) -> Result<Self> {
        let api_key = api_key.filter(|k| !k.is_empty()).ok_or_else(|| {
            Error::Config(match config.provider {
                TtsProvider::OpenAi => "OpenAI API key required for TTS".to_string(),
                TtsProvider::ElevenLabs => "ElevenLabs API key required for TTS".to_string(),
            })
        })?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice: config.voice.clone(),
            speed: config.speed,
            model: config.model.clone(),
            provider: config.provider,
        })
    }

    /// Fetch MP3 audio for `text`
    async fn fetch(&self, text: &str) -> Result<Vec<u8>> {
        match self.provider {
            TtsProvider::OpenAi => self.fetch_openai(text).await,
            TtsProvider::ElevenLabs => self.fetch_elevenlabs(text).await,
        }
    }

    /// Synthesize using OpenAI TTS
    async fn fetch_openai(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Synthesize using ElevenLabs TTS
    async fn fetch_elevenlabs(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}",
            self.voice
        );

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&ElevenLabsRequest {
                text,
                model_id: &self.model,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl TtsEngine for HttpTts {
    async fn synthesize(&self, text: &str, sample_rate: u32) -> Result<AudioStream> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let engine = self.clone();
        let text = text.to_string();

        tokio::spawn(async move {
            let frames = match engine.fetch(&text).await.and_then(|mp3| {
                let (samples, source_rate) = decode_mp3(&mp3)?;
                let samples = if source_rate == sample_rate {
                    samples
                } else {
                    resample_audio(&samples, source_rate, sample_rate)?
                };
                Ok(split_frames(&samples, sample_rate))
            }) {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::warn!(error = %e, "speech synthesis failed");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            tracing::debug!(frames = frames.len(), "speech synthesized");
            for frame in frames {
                if tx.send(Ok(frame)).await.is_err() {
                    tracing::debug!("synthesis stream dropped, discarding audio");
                    return;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Cut samples into playback-sized frames
#[must_use]
pub fn split_frames(samples: &[f32], sample_rate: u32) -> Vec<AudioFrame> {
    let frame_len = (sample_rate * FRAME_MS / 1000).max(1) as usize;
    samples
        .chunks(frame_len)
        .map(|chunk| AudioFrame::from_f32(chunk, sample_rate))
        .collect()
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                if frame.channels == 2 {
                    // Stereo: average channels
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Tts(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Tts("MP3 stream contained no frames".to_string()));
    }
    Ok((samples, sample_rate))
}

/// Resample audio using rubato
#[allow(clippy::cast_possible_truncation)]
fn resample_audio(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    let mut resampler = FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, 1024, 2, 1)
        .map_err(|e| Error::Tts(format!("resampler init failed: {e}")))?;
    let chunk_size = resampler.input_frames_next();

    let mut output = Vec::with_capacity(samples.len() * to_rate as usize / from_rate as usize + 1);
    for chunk in samples.chunks(chunk_size) {
        // Pad the tail so the last partial chunk is not lost
        let mut input: Vec<f64> = chunk.iter().map(|&s| f64::from(s)).collect();
        input.resize(chunk_size, 0.0);

        let result = resampler
            .process(&[input], None)
            .map_err(|e| Error::Tts(format!("resample failed: {e}")))?;
        output.extend(result[0].iter().map(|&s| s as f32));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_frames_sizes() {
        let samples = vec![0.1f32; 24_000];
        let frames = split_frames(&samples, 24_000);
        // 40ms frames at 24kHz
        assert_eq!(frames.len(), 25);
        assert!(frames.iter().all(|f| f.len() == 960));
    }

    #[test]
    fn test_resample_changes_length() {
        let samples = vec![0.0f32; 4096];
        let out = resample_audio(&samples, 24_000, 16_000).unwrap();
        assert!((2600..=2900).contains(&out.len()), "got {}", out.len());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_mp3(b"definitely not an mp3").is_err());
    }
}
