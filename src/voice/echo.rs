//! Echo-aware voice activity gate
//!
//! Classifies microphone frames as speech or silence with energy hysteresis
//! and enforces half-duplex capture: while the assistant is talking (and for
//! a short grace period afterwards) mic frames only reach the recognizer once
//! they clear a threshold raised above the measured playback level.

use std::sync::Mutex;
use std::time::Instant;

use crate::config::EchoConfig;

use super::AudioFrame;

/// Shared view of playback and user activity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EchoState {
    /// Assistant audio is being played
    pub tts_active: bool,

    /// User speech is currently detected
    pub user_speaking: bool,

    /// Smoothed RMS of recent playback frames
    pub playback_rms_ema: f32,

    /// Last time a frame counted as user voice
    pub last_user_voice_time: Option<Instant>,

    /// When playback last finished
    pub tts_ended_at: Option<Instant>,
}

/// What to do with a microphone frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MicAction {
    /// Send the frame to the recognizer
    Forward,
    /// Send this silence frame instead, to keep a streaming connection alive
    Keepalive(AudioFrame),
    /// Discard the frame
    Drop,
}

#[derive(Debug)]
struct GateInner {
    config: EchoConfig,
    state: EchoState,
    loud_frames: u32,
    last_keepalive: Option<Instant>,
}

impl GateInner {
    fn in_grace(&self, now: Instant) -> bool {
        self.state
            .tts_ended_at
            .is_some_and(|ended| now.saturating_duration_since(ended) < self.config.post_speech_grace)
    }

    fn suppressed(&self, now: Instant) -> bool {
        self.state.tts_active || self.in_grace(now)
    }

    fn dynamic_threshold(&self) -> f32 {
        (self.state.playback_rms_ema * self.config.playback_scale).max(self.config.start_rms)
    }

    fn hold_elapsed(&self, now: Instant) -> bool {
        self.state
            .last_user_voice_time
            .is_none_or(|t| now.saturating_duration_since(t) >= self.config.hold)
    }

    fn set_speaking(&mut self, speaking: bool, rms: f32) {
        if self.state.user_speaking != speaking {
            self.state.user_speaking = speaking;
            tracing::debug!(
                speaking,
                rms,
                tts_active = self.state.tts_active,
                "user speech edge"
            );
        }
    }
}

/// Voice activity gate with playback-aware thresholds
#[derive(Debug)]
pub struct EchoGate {
    inner: Mutex<GateInner>,
}

impl EchoGate {
    /// Create a gate with the given thresholds
    #[must_use]
    pub fn new(config: EchoConfig) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                config,
                state: EchoState::default(),
                loud_frames: 0,
                last_keepalive: None,
            }),
        }
    }

    /// Swap thresholds, keeping the current state
    pub fn reconfigure(&self, config: EchoConfig) {
        self.with_inner(|inner| inner.config = config);
    }

    /// Classify a microphone frame
    pub fn observe_mic_frame(&self, frame: &AudioFrame) {
        self.observe_mic_frame_at(frame, Instant::now());
    }

    /// Classify a microphone frame captured at `now`
    ///
    /// Returns whether the user is speaking afterwards.
    pub fn observe_mic_frame_at(&self, frame: &AudioFrame, now: Instant) -> bool {
        let rms = frame.rms();
        self.with_inner(|inner| {
            if inner.suppressed(now) {
                let threshold = inner.dynamic_threshold();
                if rms >= threshold {
                    inner.loud_frames = inner.loud_frames.saturating_add(1);
                    if inner.loud_frames >= inner.config.debounce_frames {
                        inner.state.last_user_voice_time = Some(now);
                        inner.set_speaking(true, rms);
                    }
                } else {
                    inner.loud_frames = 0;
                    if inner.state.user_speaking && inner.hold_elapsed(now) {
                        inner.set_speaking(false, rms);
                    }
                }
            } else {
                inner.loud_frames = 0;
                if rms >= inner.config.start_rms {
                    inner.state.last_user_voice_time = Some(now);
                    inner.set_speaking(true, rms);
                } else if inner.state.user_speaking && rms >= inner.config.stop_rms {
                    inner.state.last_user_voice_time = Some(now);
                } else if inner.state.user_speaking && inner.hold_elapsed(now) {
                    inner.set_speaking(false, rms);
                }
            }
            inner.state.user_speaking
        })
    }

    /// Feed a frame that is about to be played, updating the far-end level
    pub fn observe_playback_frame(&self, frame: &AudioFrame) {
        let rms = frame.rms();
        self.with_inner(|inner| {
            let w = inner.config.ema_weight;
            inner.state.playback_rms_ema = w.mul_add(inner.state.playback_rms_ema, (1.0 - w) * rms);
        });
    }

    /// Whether a mic frame observed at `now` may reach the recognizer
    #[must_use]
    pub fn should_forward_at(&self, now: Instant) -> bool {
        self.with_inner(|inner| !inner.suppressed(now) || inner.state.user_speaking)
    }

    /// Whether a mic frame may reach the recognizer right now
    #[must_use]
    pub fn should_forward(&self) -> bool {
        self.should_forward_at(Instant::now())
    }

    /// Classify a frame and decide where it goes
    pub fn process_mic_frame(&self, frame: &AudioFrame) -> MicAction {
        self.process_mic_frame_at(frame, Instant::now())
    }

    /// Classify a frame captured at `now` and decide where it goes
    pub fn process_mic_frame_at(&self, frame: &AudioFrame, now: Instant) -> MicAction {
        self.observe_mic_frame_at(frame, now);
        self.with_inner(|inner| {
            if !inner.suppressed(now) || inner.state.user_speaking {
                return MicAction::Forward;
            }

            let Some(interval) = inner.config.keepalive_interval else {
                return MicAction::Drop;
            };
            let due = inner
                .last_keepalive
                .is_none_or(|t| now.saturating_duration_since(t) >= interval);
            if due {
                inner.last_keepalive = Some(now);
                MicAction::Keepalive(AudioFrame::silence(frame.len(), frame.sample_rate()))
            } else {
                MicAction::Drop
            }
        })
    }

    /// Mark playback as started
    pub fn playback_started(&self) {
        self.with_inner(|inner| {
            inner.state.tts_active = true;
            inner.loud_frames = 0;
            inner.set_speaking(false, 0.0);
        });
    }

    /// Mark playback as finished at `now`
    pub fn playback_finished_at(&self, now: Instant) {
        self.with_inner(|inner| {
            inner.state.tts_active = false;
            inner.state.tts_ended_at = Some(now);
            inner.loud_frames = 0;
        });
    }

    /// Mark playback as finished
    pub fn playback_finished(&self) {
        self.playback_finished_at(Instant::now());
    }

    /// Whether assistant audio is playing
    #[must_use]
    pub fn is_playback_active(&self) -> bool {
        self.with_inner(|inner| inner.state.tts_active)
    }

    /// Whether user speech is detected
    #[must_use]
    pub fn is_user_speaking(&self) -> bool {
        self.with_inner(|inner| inner.state.user_speaking)
    }

    /// Threshold applied to mic frames while playback is active
    #[must_use]
    pub fn playback_threshold(&self) -> f32 {
        self.with_inner(|inner| inner.dynamic_threshold())
    }

    /// Copy of the current state
    #[must_use]
    pub fn snapshot(&self) -> EchoState {
        self.with_inner(|inner| inner.state.clone())
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut GateInner) -> T) -> T {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}
