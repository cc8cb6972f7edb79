//! Voice turn coordinator
//!
//! A single task consumes [`CoordinatorEvent`]s from every producer (the
//! mic loop, the transcript pump, backend calls) and drives the turn state
//! machine. Backend requests and speech run as spawned tasks that report
//! back through the same channel, so routing decisions never race each other.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::backend::{BackendReply, BackendRequest, ResponseBackend};
use crate::config::{CoordinatorConfig, Tunables};
use crate::policy::{Route, ToolTriggerPolicy};
use crate::speech::{SpeakOutcome, SpeechGate};
use crate::turn::{TtsToken, TurnState, TurnStateMachine};
use crate::voice::{
    DiscardReason, FilterOutput, FinalTranscript, TranscriptEvent, TranscriptFilter,
};
use crate::{Error, Result};

/// Events queued for the coordinator
#[derive(Debug)]
pub enum CoordinatorEvent {
    /// The echo gate detected the start of user speech
    SpeechStarted,
    /// A final transcript passed the filter
    Transcript(FinalTranscript),
    /// The filter dropped an utterance's final
    UtteranceDiscarded {
        /// Engine utterance id
        utterance_id: String,
        /// Why it was dropped
        reason: DiscardReason,
    },
    /// A backend call finished
    Reply {
        /// Turn the request was made for
        turn_id: u64,
        /// Token minted when the request was made
        token: TtsToken,
        /// Reply, error or timeout
        result: Result<BackendReply>,
    },
    /// New tunables were loaded
    Reconfigure(Box<Tunables>),
    /// Periodic housekeeping
    Tick,
    /// Stop the loop
    Shutdown,
}

/// Cloneable sender into the coordinator loop
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    /// Queue an event
    ///
    /// Returns false once the coordinator has stopped.
    pub async fn send(&self, event: CoordinatorEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Ask the loop to stop
    pub async fn shutdown(&self) {
        let _ = self.tx.send(CoordinatorEvent::Shutdown).await;
    }
}

/// Owns routing for one assistant
pub struct Coordinator {
    turn: Arc<TurnStateMachine>,
    speech: Arc<SpeechGate>,
    backend: Arc<dyn ResponseBackend>,
    policy: ToolTriggerPolicy,
    config: CoordinatorConfig,
    tx: mpsc::Sender<CoordinatorEvent>,
    rx: mpsc::Receiver<CoordinatorEvent>,
    listen_since: Option<Instant>,
    tasks: JoinSet<()>,
}

impl Coordinator {
    /// Create a coordinator; events are accepted through [`Coordinator::handle`]
    #[must_use]
    pub fn new(
        turn: Arc<TurnStateMachine>,
        speech: Arc<SpeechGate>,
        backend: Arc<dyn ResponseBackend>,
        tunables: &Tunables,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            turn,
            speech,
            backend,
            policy: ToolTriggerPolicy::new(tunables.policy.clone()),
            config: tunables.coordinator.clone(),
            tx,
            rx,
            listen_since: None,
            tasks: JoinSet::new(),
        }
    }

    /// Sender for producers
    #[must_use]
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run until [`CoordinatorEvent::Shutdown`]
    pub async fn run(mut self) {
        let mut ticker = new_ticker(self.config.tick_interval);
        tracing::info!("coordinator started");

        loop {
            tokio::select! {
                Some(event) = self.rx.recv() => {
                    let tick_interval = self.config.tick_interval;
                    if !self.handle_event(event) {
                        break;
                    }
                    if self.config.tick_interval != tick_interval {
                        ticker = new_ticker(self.config.tick_interval);
                    }
                }
                _ = ticker.tick() => self.on_tick(),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        tracing::error!(error = %e, "coordinator task panicked");
                        self.turn.force_idle("task panicked");
                    }
                }
            }
        }

        self.speech.cancel();
        self.tasks.shutdown().await;
        self.turn.force_idle("shutdown");
        tracing::info!("coordinator stopped");
    }

    /// Apply one event; false means stop
    fn handle_event(&mut self, event: CoordinatorEvent) -> bool {
        match event {
            CoordinatorEvent::SpeechStarted => self.on_speech_started(),
            CoordinatorEvent::Transcript(transcript) => self.on_transcript(&transcript),
            CoordinatorEvent::UtteranceDiscarded {
                utterance_id,
                reason,
            } => self.on_discarded(&utterance_id, reason),
            CoordinatorEvent::Reply {
                turn_id,
                token,
                result,
            } => self.on_reply(turn_id, token, result),
            CoordinatorEvent::Reconfigure(tunables) => self.reconfigure(*tunables),
            CoordinatorEvent::Tick => self.on_tick(),
            CoordinatorEvent::Shutdown => return false,
        }
        true
    }

    fn on_speech_started(&mut self) {
        if self.turn.state() == TurnState::Idle
            && self.turn.transition(TurnState::Listen, "speech started")
        {
            self.listen_since = Some(Instant::now());
        }
    }

    fn on_transcript(&mut self, transcript: &FinalTranscript) {
        match self.turn.state() {
            TurnState::Speak => {
                tracing::debug!(
                    utterance_id = transcript.utterance_id(),
                    text = transcript.text(),
                    barge_in = TurnStateMachine::BARGE_IN_ENABLED,
                    "transcript dropped while speaking"
                );
                return;
            }
            TurnState::Final | TurnState::Decide => {
                tracing::info!(
                    turn_id = self.turn.turn_id(),
                    "pending turn superseded by new utterance"
                );
                self.turn.force_idle("superseded");
            }
            TurnState::Idle | TurnState::Listen => {}
        }

        if self.turn.state() == TurnState::Idle {
            self.turn.transition(TurnState::Listen, "final transcript");
        }
        self.listen_since = None;
        if !self.turn.transition(TurnState::Final, "final transcript") {
            return;
        }

        tracing::info!(
            turn_id = self.turn.turn_id(),
            utterance_id = transcript.utterance_id(),
            text = transcript.text(),
            early_commit = transcript.is_early_commit(),
            "final transcript"
        );

        match self.policy.route(transcript) {
            Route::Acknowledge(text) => {
                if let Some(token) = self.turn.decide("wake word") {
                    self.spawn_speak(text, token);
                }
            }
            Route::QuickReply(text) => {
                if let Some(token) = self.turn.decide("quick reply") {
                    self.spawn_speak(text, token);
                }
            }
            Route::Backend {
                text,
                tools_enabled,
            } => {
                if let Some(token) = self.turn.decide("backend request") {
                    self.spawn_backend(
                        BackendRequest {
                            text,
                            tools_enabled,
                        },
                        token,
                    );
                }
            }
        }
    }

    fn on_discarded(&mut self, utterance_id: &str, reason: DiscardReason) {
        if self.turn.state() == TurnState::Listen {
            tracing::debug!(utterance_id, ?reason, "utterance discarded, ending turn");
            self.turn.transition(TurnState::Idle, "utterance discarded");
            self.listen_since = None;
        }
    }

    fn on_reply(&mut self, turn_id: u64, token: TtsToken, result: Result<BackendReply>) {
        if !self.turn.authorize(Some(&token)) {
            tracing::info!(
                turn_id,
                current_turn = self.turn.turn_id(),
                token = %token,
                "stale backend reply dropped"
            );
            return;
        }

        match result {
            Ok(reply) if !reply.reply_text.trim().is_empty() => {
                self.spawn_speak(reply.reply_text, token);
            }
            Ok(_) => {
                tracing::info!(turn_id, "backend returned empty reply");
                self.turn.force_idle("empty reply");
            }
            Err(e) => {
                tracing::warn!(turn_id, error = %e, "backend request failed");
                self.turn.force_idle("backend error");
            }
        }
    }

    fn on_tick(&mut self) {
        if self.turn.state() != TurnState::Listen {
            self.listen_since = None;
            return;
        }

        let now = Instant::now();
        let since = *self.listen_since.get_or_insert(now);
        if now.saturating_duration_since(since) >= self.config.listen_timeout {
            tracing::info!(
                turn_id = self.turn.turn_id(),
                timeout = ?self.config.listen_timeout,
                "listen timed out"
            );
            self.turn.force_idle("listen timeout");
            self.listen_since = None;
        }
    }

    fn reconfigure(&mut self, tunables: Tunables) {
        self.policy.reconfigure(tunables.policy);
        self.speech.reconfigure(tunables.speech);
        self.config = tunables.coordinator;
        tracing::debug!("coordinator reconfigured");
    }

    fn spawn_backend(&mut self, request: BackendRequest, token: TtsToken) {
        let backend = Arc::clone(&self.backend);
        let tx = self.tx.clone();
        let timeout = self.config.reply_timeout;
        let turn_id = self.turn.turn_id();

        self.tasks.spawn(async move {
            let result = match tokio::time::timeout(timeout, backend.respond(request)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(timeout)),
            };
            let _ = tx
                .send(CoordinatorEvent::Reply {
                    turn_id,
                    token,
                    result,
                })
                .await;
        });
    }

    fn spawn_speak(&mut self, text: String, token: TtsToken) {
        let speech = Arc::clone(&self.speech);
        let turn = Arc::clone(&self.turn);

        self.tasks.spawn(async move {
            match speech.speak(&text, Some(&token)).await {
                Ok(SpeakOutcome::Busy) => {
                    // The turn would otherwise sit in DECIDE
                    if turn.authorize(Some(&token)) {
                        turn.force_idle("speech busy");
                    }
                }
                Ok(outcome) => tracing::debug!(?outcome, "speech finished"),
                Err(e) => tracing::warn!(error = %e, "speech failed"),
            }
        });
    }
}

fn new_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Feeds engine events through the transcript filter into the coordinator
///
/// Partials stop here. Stable short partials are promoted on each poll.
pub struct TranscriptPump {
    filter: TranscriptFilter,
    events: mpsc::Receiver<TranscriptEvent>,
    coordinator: CoordinatorHandle,
    poll_interval: Duration,
}

impl TranscriptPump {
    /// Create a pump
    #[must_use]
    pub const fn new(
        filter: TranscriptFilter,
        events: mpsc::Receiver<TranscriptEvent>,
        coordinator: CoordinatorHandle,
        poll_interval: Duration,
    ) -> Self {
        Self {
            filter,
            events,
            coordinator,
            poll_interval,
        }
    }

    /// Run until the engine's sender or the coordinator goes away
    pub async fn run(mut self, mut tunables: tokio::sync::watch::Receiver<Tunables>) {
        let mut ticker = new_ticker(self.poll_interval);
        let mut reload_open = true;

        loop {
            let output = tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.filter.accept(event),
                    None => break,
                },
                _ = ticker.tick() => self.filter.poll(),
                changed = tunables.changed(), if reload_open => {
                    if changed.is_err() {
                        reload_open = false;
                        continue;
                    }
                    let transcript = tunables.borrow_and_update().transcript.clone();
                    self.filter.reconfigure(transcript);
                    None
                }
            };

            let Some(output) = output else {
                continue;
            };
            let event = match output {
                FilterOutput::Final(transcript) => CoordinatorEvent::Transcript(transcript),
                FilterOutput::Discarded {
                    utterance_id,
                    reason,
                } => CoordinatorEvent::UtteranceDiscarded {
                    utterance_id,
                    reason,
                },
            };
            if !self.coordinator.send(event).await {
                break;
            }
        }

        tracing::debug!("transcript pump stopped");
    }
}
