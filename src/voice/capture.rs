//! Audio capture from microphone

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

use super::AudioFrame;

/// Captures audio from the default input device
///
/// The cpal stream is not `Send`, so the capture lives on the task that
/// opened it.
pub struct AudioCapture {
    config: StreamConfig,
    sample_rate: u32,
    chunk_frames: usize,
    buffer: Arc<Mutex<Vec<f32>>>,
    /// Samples left over from the last `frames()` call
    pending: Vec<f32>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device at `sample_rate`, cut into `chunk_frames` frames
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open(sample_rate: u32, chunk_frames: usize) -> Result<Self> {
        let config = input_config(sample_rate)?;
        Ok(Self {
            config,
            sample_rate,
            chunk_frames: chunk_frames.max(1),
            buffer: Arc::new(Mutex::new(Vec::new())),
            pending: Vec::new(),
            stream: None,
        })
    }

    /// Reopen at a new rate or chunk size, restarting capture if it was running
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened with the new settings
    pub fn reopen(&mut self, sample_rate: u32, chunk_frames: usize) -> Result<()> {
        let chunk_frames = chunk_frames.max(1);
        if sample_rate == self.sample_rate && chunk_frames == self.chunk_frames {
            return Ok(());
        }

        let was_capturing = self.is_capturing();
        self.stop();
        self.config = input_config(sample_rate)?;
        tracing::info!(
            from = self.sample_rate,
            to = sample_rate,
            chunk_frames,
            "audio capture reopened"
        );
        self.sample_rate = sample_rate;
        self.chunk_frames = chunk_frames;
        self.clear_buffer();

        if was_capturing {
            self.start()?;
        }
        Ok(())
    }

    /// Start capturing audio
    ///
    /// # Errors
    ///
    /// Returns error if capture fails
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device".to_string()))?;

        let config = self.config.clone();
        let channels = usize::from(config.channels).max(1);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = buffer.lock() {
                        if channels == 1 {
                            buf.extend_from_slice(data);
                        } else {
                            #[allow(clippy::cast_precision_loss)]
                            buf.extend(
                                data.chunks(channels)
                                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                            );
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Get captured audio buffer and clear it
    ///
    /// Returns the audio samples captured since last call
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// Drain captured audio as whole frames of `chunk_frames` samples
    ///
    /// A partial tail is kept for the next call.
    pub fn frames(&mut self) -> Vec<AudioFrame> {
        self.pending.extend(self.take_buffer());
        let whole = self.pending.len() / self.chunk_frames * self.chunk_frames;
        let frames = self.pending[..whole]
            .chunks_exact(self.chunk_frames)
            .map(|chunk| AudioFrame::from_f32(chunk, self.sample_rate))
            .collect();
        self.pending.drain(..whole);
        frames
    }

    /// Clear the audio buffer
    pub fn clear_buffer(&mut self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
        self.pending.clear();
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Samples per frame returned by [`frames`](Self::frames)
    #[must_use]
    pub const fn chunk_frames(&self) -> usize {
        self.chunk_frames
    }
}

fn input_config(sample_rate: u32) -> Result<StreamConfig> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let rate = SampleRate(sample_rate);
    let supports = |channels: u16| {
        device.supported_input_configs().ok()?.find(|c| {
            c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        })
    };

    // Fallback: stereo, downmixed in the callback
    let supported = supports(1)
        .or_else(|| supports(2))
        .ok_or_else(|| Error::Audio(format!("no input config supports {sample_rate} Hz")))?;

    let config = supported.with_sample_rate(rate).config();

    tracing::debug!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "audio capture initialized"
    );

    Ok(config)
}
