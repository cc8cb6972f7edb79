//! Token-gated speech playback
//!
//! Every reply is spoken through [`SpeechGate::speak`], which refuses to
//! synthesize unless the caller holds the turn's current [`TtsToken`] and
//! checks the token again before each frame reaches the speaker. A reply
//! for an abandoned turn therefore never makes a sound.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;

use crate::Result;
use crate::config::SpeechConfig;
use crate::turn::{IdleGuard, TtsToken, TurnStateMachine};
use crate::voice::{EchoGate, PlaybackSink, TtsEngine};

/// How often the drain wait checks the sink
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Result of a speak request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Token did not match the current turn; nothing was synthesized
    Blocked,
    /// Another reply is already playing; nothing was queued
    Busy,
    /// All audio was played
    Spoken,
    /// Token revoked or playback cancelled part way through
    Cancelled,
}

/// Playback lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEvent {
    /// Audio is about to be written to the speaker
    Started,
    /// Playback ended; `None` when synthesis or playback failed
    Finished {
        /// How it ended
        outcome: Option<SpeakOutcome>,
    },
}

/// Clears playback flags when speech ends, however it ends
struct ActiveSpeech<'a> {
    gate: &'a SpeechGate,
}

impl<'a> ActiveSpeech<'a> {
    fn begin(gate: &'a SpeechGate) -> Self {
        gate.echo.playback_started();
        Self { gate }
    }
}

impl Drop for ActiveSpeech<'_> {
    fn drop(&mut self) {
        self.gate.echo.playback_finished();
        self.gate.in_flight.store(false, Ordering::Release);
    }
}

/// Gate between reply text and the speaker
pub struct SpeechGate {
    turn: Arc<TurnStateMachine>,
    echo: Arc<EchoGate>,
    tts: Arc<dyn TtsEngine>,
    sink: Arc<dyn PlaybackSink>,
    events: broadcast::Sender<SpeechEvent>,
    config: Mutex<SpeechConfig>,
    in_flight: AtomicBool,
    /// Bumped by `cancel` so the playing reply notices
    generation: AtomicU64,
}

impl SpeechGate {
    /// Create a gate speaking through `tts` into `sink`
    #[must_use]
    pub fn new(
        turn: Arc<TurnStateMachine>,
        echo: Arc<EchoGate>,
        tts: Arc<dyn TtsEngine>,
        sink: Arc<dyn PlaybackSink>,
        config: SpeechConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            turn,
            echo,
            tts,
            sink,
            events,
            config: Mutex::new(config),
            in_flight: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Subscribe to playback notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SpeechEvent> {
        self.events.subscribe()
    }

    /// Swap playback settings
    pub fn reconfigure(&self, config: SpeechConfig) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Speak `text` if `token` still authorizes the current turn
    ///
    /// The turn is forced idle once playback ends, whether it completed,
    /// was cancelled or failed. Blocked and busy requests leave the turn
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or the playback sink fails
    pub async fn speak(&self, text: &str, token: Option<&TtsToken>) -> Result<SpeakOutcome> {
        let Some(token) = token.filter(|t| self.turn.authorize(Some(t))) else {
            self.log_blocked(token);
            return Ok(SpeakOutcome::Blocked);
        };

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("speech already playing, request dropped");
            return Ok(SpeakOutcome::Busy);
        }

        // Revoked between the check above and now
        if !self.turn.begin_speaking(token, "tts start") {
            self.in_flight.store(false, Ordering::Release);
            self.log_blocked(Some(token));
            return Ok(SpeakOutcome::Blocked);
        }

        // Declared after `active` so the turn is released while this
        // speech still holds the in-flight flag
        let active = ActiveSpeech::begin(self);
        let idle = IdleGuard::for_token(&self.turn, token.clone(), "speech finished");
        let generation = self.generation.load(Ordering::Acquire);

        let _ = self.events.send(SpeechEvent::Started);
        tracing::info!(chars = text.len(), token = %token, "speaking");

        let result = self.play(text, token, generation).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "speech failed");
            self.sink.clear();
        }

        drop(idle);
        drop(active);
        let _ = self.events.send(SpeechEvent::Finished {
            outcome: result.as_ref().ok().copied(),
        });
        result
    }

    fn log_blocked(&self, token: Option<&TtsToken>) {
        tracing::warn!(
            token = ?token.map(ToString::to_string),
            current = ?self.turn.current_token().map(|t| t.to_string()),
            state = %self.turn.state(),
            "blocked background speech"
        );
    }

    async fn play(
        &self,
        text: &str,
        token: &TtsToken,
        generation: u64,
    ) -> Result<SpeakOutcome> {
        let mut stream = self.tts.synthesize(text, self.sink.sample_rate()).await?;
        let mut written = Duration::ZERO;

        while let Some(frame) = stream.next().await {
            let frame = frame?;
            if !self.still_current(token, generation) {
                self.sink.clear();
                tracing::info!("speech cancelled mid-stream");
                return Ok(SpeakOutcome::Cancelled);
            }
            self.echo.observe_playback_frame(&frame);
            self.sink.write(&frame)?;
            written += frame.duration();
        }

        self.drain(written, token, generation).await
    }

    /// Wait for queued audio to play out, bounded by its duration plus slack
    async fn drain(
        &self,
        written: Duration,
        token: &TtsToken,
        generation: u64,
    ) -> Result<SpeakOutcome> {
        let slack = self
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain_slack;
        let deadline = tokio::time::Instant::now() + written + slack;

        while self.sink.pending_samples() > 0 {
            if !self.still_current(token, generation) {
                self.sink.clear();
                tracing::info!("speech cancelled while draining");
                return Ok(SpeakOutcome::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    pending = self.sink.pending_samples(),
                    "playback did not drain in time"
                );
                self.sink.clear();
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        Ok(SpeakOutcome::Spoken)
    }

    fn still_current(&self, token: &TtsToken, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation && self.turn.authorize(Some(token))
    }

    /// Stop whatever is playing
    ///
    /// The queue is cleared and the echo gate released immediately; the
    /// speaking task notices at its next frame and ends the turn.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.sink.clear();
        self.echo.playback_finished();
        tracing::info!("speech cancelled");
    }

    /// Nothing is being synthesized or played
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.in_flight.load(Ordering::Acquire) && self.sink.pending_samples() == 0
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::stream;

    use super::*;
    use crate::config::EchoConfig;
    use crate::turn::TurnState;
    use crate::voice::{AudioFrame, AudioStream};

    struct ToneTts {
        frames: usize,
    }

    #[async_trait]
    impl TtsEngine for ToneTts {
        async fn synthesize(&self, _text: &str, sample_rate: u32) -> Result<AudioStream> {
            let frames = (0..self.frames)
                .map(move |_| Ok(AudioFrame::new(vec![1000; 240], sample_rate)));
            Ok(stream::iter(frames).boxed())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        written: Mutex<usize>,
    }

    impl PlaybackSink for CountingSink {
        fn write(&self, _frame: &AudioFrame) -> Result<()> {
            *self.written.lock().unwrap() += 1;
            Ok(())
        }

        fn clear(&self) {}

        fn pending_samples(&self) -> usize {
            0
        }

        fn sample_rate(&self) -> u32 {
            24_000
        }
    }

    fn setup(frames: usize) -> (Arc<TurnStateMachine>, Arc<CountingSink>, SpeechGate) {
        let turn = Arc::new(TurnStateMachine::new());
        let sink = Arc::new(CountingSink::default());
        let gate = SpeechGate::new(
            Arc::clone(&turn),
            Arc::new(EchoGate::new(EchoConfig::default())),
            Arc::new(ToneTts { frames }),
            Arc::clone(&sink) as Arc<dyn PlaybackSink>,
            SpeechConfig::default(),
        );
        (turn, sink, gate)
    }

    fn decide(turn: &TurnStateMachine) -> TtsToken {
        turn.transition(TurnState::Listen, "test");
        turn.transition(TurnState::Final, "test");
        turn.decide("test").unwrap()
    }

    #[tokio::test]
    async fn test_speak_with_current_token() {
        let (turn, sink, gate) = setup(5);
        let mut events = gate.subscribe();
        let token = decide(&turn);

        let outcome = gate.speak("hello", Some(&token)).await.unwrap();
        assert_eq!(outcome, SpeakOutcome::Spoken);
        assert_eq!(*sink.written.lock().unwrap(), 5);
        assert_eq!(turn.state(), TurnState::Idle);
        assert!(turn.current_token().is_none());
        assert!(gate.is_idle());

        assert_eq!(events.recv().await.unwrap(), SpeechEvent::Started);
        assert_eq!(
            events.recv().await.unwrap(),
            SpeechEvent::Finished {
                outcome: Some(SpeakOutcome::Spoken)
            }
        );
    }

    #[tokio::test]
    async fn test_missing_token_is_blocked() {
        let (turn, sink, gate) = setup(5);
        decide(&turn);

        assert_eq!(gate.speak("hello", None).await.unwrap(), SpeakOutcome::Blocked);
        assert_eq!(*sink.written.lock().unwrap(), 0);
        // Blocked speech leaves the turn alone
        assert_eq!(turn.state(), TurnState::Decide);
    }

    #[tokio::test]
    async fn test_revoked_token_is_blocked() {
        let (turn, sink, gate) = setup(5);
        let stale = decide(&turn);
        turn.force_idle("superseded");
        decide(&turn);

        assert_eq!(gate.speak("late", Some(&stale)).await.unwrap(), SpeakOutcome::Blocked);
        assert_eq!(*sink.written.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_out_of_band_token() {
        let (turn, sink, gate) = setup(2);
        let token = turn.mint_tts_token("announcement");

        assert_eq!(gate.speak("ready", Some(&token)).await.unwrap(), SpeakOutcome::Spoken);
        assert_eq!(*sink.written.lock().unwrap(), 2);
        assert!(turn.current_token().is_none());
    }

    /// Hands out a stream the test feeds frame by frame
    struct ManualTts {
        rx: Mutex<Option<tokio::sync::mpsc::Receiver<Result<AudioFrame>>>>,
    }

    #[async_trait]
    impl TtsEngine for ManualTts {
        async fn synthesize(&self, _text: &str, _sample_rate: u32) -> Result<AudioStream> {
            let rx = self.rx.lock().unwrap().take().unwrap();
            Ok(tokio_stream::wrappers::ReceiverStream::new(rx).boxed())
        }
    }

    fn manual_setup() -> (
        Arc<TurnStateMachine>,
        Arc<CountingSink>,
        Arc<SpeechGate>,
        tokio::sync::mpsc::Sender<Result<AudioFrame>>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let turn = Arc::new(TurnStateMachine::new());
        let sink = Arc::new(CountingSink::default());
        let gate = Arc::new(SpeechGate::new(
            Arc::clone(&turn),
            Arc::new(EchoGate::new(EchoConfig::default())),
            Arc::new(ManualTts {
                rx: Mutex::new(Some(rx)),
            }),
            Arc::clone(&sink) as Arc<dyn PlaybackSink>,
            SpeechConfig::default(),
        ));
        (turn, sink, gate, tx)
    }

    #[tokio::test]
    async fn test_revoked_mid_stream_stops_writing() {
        let (turn, sink, gate, tx) = manual_setup();
        let token = decide(&turn);
        let mut events = gate.subscribe();

        let speaking = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.speak("long reply", Some(&token)).await })
        };
        assert_eq!(events.recv().await.unwrap(), SpeechEvent::Started);
        assert_eq!(turn.state(), TurnState::Speak);

        tx.send(Ok(AudioFrame::silence(240, 24_000))).await.unwrap();
        tokio::task::yield_now().await;
        turn.force_idle("shutdown");
        // The speaker may already have hung up
        let _ = tx.send(Ok(AudioFrame::silence(240, 24_000))).await;
        let _ = tx.send(Ok(AudioFrame::silence(240, 24_000))).await;
        drop(tx);

        let outcome = speaking.await.unwrap().unwrap();
        assert_eq!(outcome, SpeakOutcome::Cancelled);
        assert!(*sink.written.lock().unwrap() <= 1);
        assert!(gate.is_idle());
    }

    #[tokio::test]
    async fn test_second_request_is_busy() {
        let (turn, sink, gate, tx) = manual_setup();
        let token = decide(&turn);
        let mut events = gate.subscribe();

        let speaking = {
            let gate = Arc::clone(&gate);
            let token = token.clone();
            tokio::spawn(async move { gate.speak("first", Some(&token)).await })
        };
        assert_eq!(events.recv().await.unwrap(), SpeechEvent::Started);
        assert!(!gate.is_idle());

        assert_eq!(gate.speak("second", Some(&token)).await.unwrap(), SpeakOutcome::Busy);

        tx.send(Ok(AudioFrame::silence(240, 24_000))).await.unwrap();
        drop(tx);
        assert_eq!(speaking.await.unwrap().unwrap(), SpeakOutcome::Spoken);
        assert_eq!(*sink.written.lock().unwrap(), 1);
        assert_eq!(turn.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn test_announcement_minted_mid_reply() {
        let (turn, sink, gate, tx) = manual_setup();
        let token = decide(&turn);
        let mut events = gate.subscribe();

        let speaking = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.speak("long reply", Some(&token)).await })
        };
        assert_eq!(events.recv().await.unwrap(), SpeechEvent::Started);

        let announcement = turn.mint_tts_token("agent announcement");
        assert_eq!(
            gate.speak("heads up", Some(&announcement)).await.unwrap(),
            SpeakOutcome::Busy
        );

        let _ = tx.send(Ok(AudioFrame::silence(240, 24_000))).await;
        drop(tx);
        assert_eq!(speaking.await.unwrap().unwrap(), SpeakOutcome::Cancelled);
        assert_eq!(*sink.written.lock().unwrap(), 0);

        // The reply's cleanup released the lock and left the announcement usable
        assert_eq!(turn.state(), TurnState::Idle);
        assert!(turn.authorize(Some(&announcement)));
        assert!(gate.is_idle());
        assert!(turn.transition(TurnState::Listen, "speech start"));
    }

    #[tokio::test]
    async fn test_synthesis_error_still_ends_turn() {
        let (turn, sink, gate, tx) = manual_setup();
        let token = decide(&turn);

        tx.send(Err(crate::Error::Tts("boom".to_string()))).await.unwrap();
        assert!(gate.speak("oops", Some(&token)).await.is_err());
        assert_eq!(*sink.written.lock().unwrap(), 0);
        assert_eq!(turn.state(), TurnState::Idle);
        assert!(gate.is_idle());
    }
}
