//! Audio playback to speakers
//!
//! Speech is written into a [`PlaybackQueue`] that the output callback
//! drains. The queue is `Send + Sync` and outlives device reopens; the cpal
//! stream itself is not `Send` and stays with whoever opened it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

use super::AudioFrame;

/// Destination for synthesized speech
pub trait PlaybackSink: Send + Sync {
    /// Queue a frame for playback
    ///
    /// # Errors
    ///
    /// Returns error if the frame cannot be played at the sink's rate
    fn write(&self, frame: &AudioFrame) -> Result<()>;

    /// Drop everything not yet played
    fn clear(&self);

    /// Samples queued but not yet played
    fn pending_samples(&self) -> usize;

    /// Rate frames must be written at
    fn sample_rate(&self) -> u32;
}

#[derive(Debug)]
struct QueueInner {
    samples: VecDeque<f32>,
    sample_rate: u32,
}

/// Sample queue shared between writers and the output callback
#[derive(Debug, Clone)]
pub struct PlaybackQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl PlaybackQueue {
    /// Create an empty queue for `sample_rate`
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                samples: VecDeque::new(),
                sample_rate,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_sample_rate(&self, sample_rate: u32) {
        let mut inner = self.lock();
        inner.samples.clear();
        inner.sample_rate = sample_rate;
    }

    /// Fill an interleaved output buffer, padding with silence
    fn fill(&self, data: &mut [f32], channels: usize) {
        let mut inner = self.lock();
        for frame in data.chunks_mut(channels.max(1)) {
            let sample = inner.samples.pop_front().unwrap_or(0.0);
            frame.fill(sample);
        }
    }
}

impl PlaybackSink for PlaybackQueue {
    fn write(&self, frame: &AudioFrame) -> Result<()> {
        let mut inner = self.lock();
        if frame.sample_rate() != inner.sample_rate {
            return Err(Error::Audio(format!(
                "frame at {} Hz written to {} Hz playback",
                frame.sample_rate(),
                inner.sample_rate
            )));
        }
        inner.samples.extend(frame.to_f32());
        Ok(())
    }

    fn clear(&self) {
        let dropped = {
            let mut inner = self.lock();
            let n = inner.samples.len();
            inner.samples.clear();
            n
        };
        if dropped > 0 {
            tracing::debug!(dropped, "playback queue cleared");
        }
    }

    fn pending_samples(&self) -> usize {
        self.lock().samples.len()
    }

    fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }
}

/// Plays queued audio on the default output device
pub struct AudioPlayback {
    queue: PlaybackQueue,
    // Held for its lifetime; dropping it stops output
    #[allow(dead_code)]
    stream: Stream,
    sample_rate: u32,
}

impl AudioPlayback {
    /// Open the default output device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open(sample_rate: u32) -> Result<Self> {
        let queue = PlaybackQueue::new(sample_rate);
        let stream = build_stream(&queue, sample_rate)?;
        Ok(Self {
            queue,
            stream,
            sample_rate,
        })
    }

    /// Reopen the device at a new rate
    ///
    /// The queue handle stays valid; anything still queued is dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened at the new rate
    pub fn reopen(&mut self, sample_rate: u32) -> Result<()> {
        if sample_rate == self.sample_rate {
            return Ok(());
        }

        self.queue.set_sample_rate(sample_rate);
        self.stream = build_stream(&self.queue, sample_rate)?;
        tracing::info!(from = self.sample_rate, to = sample_rate, "audio playback reopened");
        self.sample_rate = sample_rate;
        Ok(())
    }

    /// Handle for writing audio
    #[must_use]
    pub fn queue(&self) -> PlaybackQueue {
        self.queue.clone()
    }

    /// Current output rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn build_stream(queue: &PlaybackQueue, sample_rate: u32) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let config = output_config(&device, sample_rate)?;
    let channels = usize::from(config.channels);

    let callback_queue = queue.clone();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                callback_queue.fill(data, channels);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    tracing::debug!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );
    Ok(stream)
}

fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let supports = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        })
    };

    // Fallback: stereo with the mono signal on both channels
    let supported = supports(1)
        .or_else(|| supports(2))
        .ok_or_else(|| Error::Audio(format!("no output config supports {sample_rate} Hz")))?;

    Ok(supported.with_sample_rate(rate).config())
}
