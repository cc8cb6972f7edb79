//! Daemon - the voice assistant service
//!
//! Opens the audio devices, wires the STT engine, transcript pump,
//! coordinator and speech gate together, and runs the mic loop until
//! interrupted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use crate::backend::{HttpBackend, ResponseBackend};
use crate::config::{self, AudioConfig, Tunables};
use crate::coordinator::{Coordinator, CoordinatorEvent, CoordinatorHandle, TranscriptPump};
use crate::speech::{SpeechEvent, SpeechGate};
use crate::turn::TurnStateMachine;
use crate::voice::{
    AudioCapture, AudioPlayback, BatchSttEngine, EchoGate, HttpTranscriber, HttpTts, MicAction,
    PlaybackSink, SttEngine, TranscriptFilter, TtsEngine,
};
use crate::{Config, Error, Result};

/// How often the mic loop drains the capture buffer
const MIC_POLL: Duration = Duration::from_millis(50);

/// The voice daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    /// Create a new daemon instance
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if an audio device cannot be opened or an engine cannot
    /// be created
    #[allow(clippy::future_not_send)]
    pub async fn run(self) -> Result<()> {
        let tunables = self.config.tunables.clone();
        let audio = tunables.audio.clone();

        // Device failures are fatal
        let mut capture = AudioCapture::open(audio.capture_sample_rate, audio.chunk_frames)?;
        let playback = AudioPlayback::open(audio.playback_sample_rate)?;

        let turn = Arc::new(TurnStateMachine::new());
        let echo = Arc::new(EchoGate::new(tunables.echo.clone()));

        let tts: Arc<dyn TtsEngine> = Arc::new(HttpTts::new(
            &self.config.tts,
            self.config.api_keys.for_tts(self.config.tts.provider),
        )?);
        let speech = Arc::new(SpeechGate::new(
            Arc::clone(&turn),
            Arc::clone(&echo),
            tts,
            Arc::new(playback.queue()) as Arc<dyn PlaybackSink>,
            tunables.speech.clone(),
        ));
        let backend: Arc<dyn ResponseBackend> = Arc::new(HttpBackend::new(&self.config.backend)?);

        let coordinator = Coordinator::new(
            Arc::clone(&turn),
            Arc::clone(&speech),
            backend,
            &tunables,
        );
        let handle = coordinator.handle();
        let coordinator_task = tokio::spawn(coordinator.run());

        let (tunables_tx, tunables_rx) = watch::channel(tunables.clone());
        let watcher = self.config.config_path.clone().and_then(|path| {
            let base = self.config.clone();
            match config::spawn_reload_watcher(path.clone(), base, tunables_tx.clone()) {
                Ok(watcher) => {
                    tracing::info!(path = %path.display(), "watching config file");
                    Some(watcher)
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "config hot reload disabled");
                    None
                }
            }
        });

        let transcriber = Arc::new(HttpTranscriber::new(
            self.config.stt.provider,
            self.config.api_keys.for_stt(self.config.stt.provider),
            self.config.stt.model.clone(),
        )?);
        let mut engine: Box<dyn SttEngine> = Box::new(BatchSttEngine::new(
            transcriber,
            self.config.stt.clone(),
            tunables.echo.start_rms,
        ));

        let (transcript_tx, transcript_rx) = mpsc::channel(32);
        if !engine.start(transcript_tx).await? {
            return Err(Error::Stt(format!("{} engine not ready", engine.name())));
        }

        let pump = TranscriptPump::new(
            TranscriptFilter::new(tunables.transcript.clone()),
            transcript_rx,
            handle.clone(),
            tunables.coordinator.tick_interval,
        );
        let pump_task = tokio::spawn(pump.run(tunables_rx.clone()));

        // Set up shutdown signal
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });

        capture.start()?;
        tracing::info!(
            engine = engine.name(),
            capture_rate = audio.capture_sample_rate,
            playback_rate = audio.playback_sample_rate,
            "daemon running"
        );

        let mut mic = MicLoop {
            capture,
            playback,
            engine,
            echo,
            speech: Arc::clone(&speech),
            coordinator: handle.clone(),
            speech_events: speech.subscribe(),
            tunables: tunables_rx,
            audio,
            deferred_audio: None,
            user_speaking: false,
        };
        let result = mic.run(&mut shutdown_rx).await;

        tracing::info!("shutting down");
        mic.engine.stop().await;
        mic.capture.stop();
        handle.shutdown().await;
        if let Err(e) = coordinator_task.await {
            tracing::error!(error = %e, "coordinator task failed");
        }
        pump_task.abort();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        drop(tunables_tx);

        result
    }
}

/// Mic-side half of the daemon
///
/// Owns the capture device and STT engine. cpal streams are not `Send`,
/// so this runs on the task that opened them.
struct MicLoop {
    capture: AudioCapture,
    playback: AudioPlayback,
    engine: Box<dyn SttEngine>,
    echo: Arc<EchoGate>,
    speech: Arc<SpeechGate>,
    coordinator: CoordinatorHandle,
    speech_events: broadcast::Receiver<SpeechEvent>,
    tunables: watch::Receiver<Tunables>,
    audio: AudioConfig,
    /// Device settings waiting for playback to go idle
    deferred_audio: Option<AudioConfig>,
    user_speaking: bool,
}

impl MicLoop {
    #[allow(clippy::future_not_send)]
    async fn run(&mut self, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<()> {
        let mut reload_open = true;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                event = self.speech_events.recv() => match event {
                    Ok(SpeechEvent::Started) => {
                        // Anything buffered so far would be transcribed alongside our own voice
                        self.engine.clear();
                        self.capture.clear_buffer();
                    }
                    Ok(SpeechEvent::Finished { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "speech events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = self.tunables.changed(), if reload_open => {
                    if changed.is_err() {
                        reload_open = false;
                        continue;
                    }
                    let tunables = self.tunables.borrow_and_update().clone();
                    self.apply_tunables(tunables).await?;
                }
                () = tokio::time::sleep(MIC_POLL) => {
                    self.apply_deferred_audio()?;
                    self.process_frames().await;
                }
            }
        }

        Ok(())
    }

    /// Gate captured frames and feed the survivors to the engine
    #[allow(clippy::future_not_send)]
    async fn process_frames(&mut self) {
        for frame in self.capture.frames() {
            let action = self.echo.process_mic_frame(&frame);
            let fed = match &action {
                MicAction::Forward => Some(&frame),
                MicAction::Keepalive(silence) => Some(silence),
                MicAction::Drop => None,
            };
            if let Some(fed) = fed
                && let Err(e) = self.engine.feed_audio(fed).await
            {
                tracing::warn!(error = %e, "failed to feed STT engine");
            }

            let speaking = self.echo.is_user_speaking();
            if speaking && !self.user_speaking {
                self.coordinator
                    .send(CoordinatorEvent::SpeechStarted)
                    .await;
            }
            self.user_speaking = speaking;
        }
    }

    #[allow(clippy::future_not_send)]
    async fn apply_tunables(&mut self, tunables: Tunables) -> Result<()> {
        self.echo.reconfigure(tunables.echo.clone());
        self.engine.set_speech_rms(tunables.echo.start_rms);
        if tunables.audio != self.audio {
            self.deferred_audio = Some(tunables.audio.clone());
            self.apply_deferred_audio()?;
        }
        self.coordinator
            .send(CoordinatorEvent::Reconfigure(Box::new(tunables)))
            .await;
        Ok(())
    }

    /// Reopen devices for new settings once nothing is playing
    fn apply_deferred_audio(&mut self) -> Result<()> {
        let Some(audio) = self.deferred_audio.take() else {
            return Ok(());
        };
        if !self.speech.is_idle() {
            tracing::debug!("device reopen deferred until playback is idle");
            self.deferred_audio = Some(audio);
            return Ok(());
        }

        self.capture
            .reopen(audio.capture_sample_rate, audio.chunk_frames)?;
        self.playback.reopen(audio.playback_sample_rate)?;
        self.engine.clear();
        self.audio = audio;
        Ok(())
    }
}
