//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use tokio::sync::Notify;

use ava_voice::config::EchoConfig;
use ava_voice::voice::{
    AudioFrame, AudioStream, EchoGate, FilterOutput, FinalTranscript, PlaybackSink,
    TranscriptEvent, TranscriptFilter, TtsEngine,
};
use ava_voice::{
    BackendReply, BackendRequest, Coordinator, CoordinatorHandle, Error, ResponseBackend, Result,
    SpeechGate, Tunables, TurnState, TurnStateMachine,
};

pub const SAMPLE_RATE: u32 = 24_000;

/// Backend that answers "reply to <text>" unless told otherwise
#[derive(Default)]
pub struct FakeBackend {
    requests: Mutex<Vec<BackendRequest>>,
    replies: Mutex<HashMap<String, String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    failing: Mutex<bool>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reply with `reply` when asked `text`
    pub fn reply_with(&self, text: &str, reply: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(text.to_string(), reply.to_string());
    }

    /// Hold requests for `text` until the returned notify fires
    pub fn gate(&self, text: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(text.to_string(), Arc::clone(&notify));
        notify
    }

    /// Fail requests until switched back
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseBackend for FakeBackend {
    async fn respond(&self, request: BackendRequest) -> Result<BackendReply> {
        self.requests.lock().unwrap().push(request.clone());

        let gate = self.gates.lock().unwrap().get(&request.text).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if *self.failing.lock().unwrap() {
            return Err(Error::Backend("backend unavailable".to_string()));
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&request.text)
            .cloned()
            .unwrap_or_else(|| format!("reply to {}", request.text));
        Ok(BackendReply { reply_text: reply })
    }
}

/// TTS that records what it was asked to say and emits `frames` tone frames
pub struct FakeTts {
    spoken: Mutex<Vec<String>>,
    frames: usize,
}

impl FakeTts {
    pub fn new(frames: usize) -> Arc<Self> {
        Arc::new(Self {
            spoken: Mutex::new(Vec::new()),
            frames,
        })
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl TtsEngine for FakeTts {
    async fn synthesize(&self, text: &str, sample_rate: u32) -> Result<AudioStream> {
        self.spoken.lock().unwrap().push(text.to_string());
        let frames = (0..self.frames).map(move |_| Ok(AudioFrame::new(vec![800; 480], sample_rate)));
        Ok(stream::iter(frames).boxed())
    }
}

/// Sink that plays instantly and counts frames
#[derive(Default)]
pub struct RecordingSink {
    written: Mutex<usize>,
}

impl RecordingSink {
    pub fn written(&self) -> usize {
        *self.written.lock().unwrap()
    }
}

impl PlaybackSink for RecordingSink {
    fn write(&self, _frame: &AudioFrame) -> Result<()> {
        *self.written.lock().unwrap() += 1;
        Ok(())
    }

    fn clear(&self) {}

    fn pending_samples(&self) -> usize {
        0
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

/// Run `text` through a fresh filter to get a forwardable final
pub fn final_transcript(text: &str, utterance_id: &str) -> FinalTranscript {
    let mut filter = TranscriptFilter::new(Tunables::default().transcript);
    match filter.accept(TranscriptEvent::final_result(text, utterance_id)) {
        Some(FilterOutput::Final(transcript)) => transcript,
        other => panic!("expected a final for {text:?}, got {other:?}"),
    }
}

/// A running coordinator wired to fakes
pub struct Harness {
    pub turn: Arc<TurnStateMachine>,
    pub echo: Arc<EchoGate>,
    pub backend: Arc<FakeBackend>,
    pub tts: Arc<FakeTts>,
    pub sink: Arc<RecordingSink>,
    pub speech: Arc<SpeechGate>,
    pub handle: CoordinatorHandle,
    pub task: tokio::task::JoinHandle<()>,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_tunables(Tunables::default())
    }

    pub fn with_tunables(tunables: Tunables) -> Self {
        let turn = Arc::new(TurnStateMachine::new());
        let echo = Arc::new(EchoGate::new(EchoConfig::default()));
        let backend = FakeBackend::new();
        let tts = FakeTts::new(3);
        let sink = Arc::new(RecordingSink::default());
        let speech = Arc::new(SpeechGate::new(
            Arc::clone(&turn),
            Arc::clone(&echo),
            Arc::clone(&tts) as Arc<dyn TtsEngine>,
            Arc::clone(&sink) as Arc<dyn PlaybackSink>,
            tunables.speech.clone(),
        ));
        let coordinator = Coordinator::new(
            Arc::clone(&turn),
            Arc::clone(&speech),
            Arc::clone(&backend) as Arc<dyn ResponseBackend>,
            &tunables,
        );
        let handle = coordinator.handle();
        let task = tokio::spawn(coordinator.run());

        Self {
            turn,
            echo,
            backend,
            tts,
            sink,
            speech,
            handle,
            task,
        }
    }

    /// Wait until the turn is idle with nothing playing
    pub async fn settle(&self) {
        self.wait_for(|h| h.turn.state() == TurnState::Idle && h.speech.is_idle())
            .await;
    }

    /// Poll `condition` for up to two seconds
    pub async fn wait_for(&self, condition: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition(self) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached, turn is {}",
                self.turn.state()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn stop(self) {
        self.handle.shutdown().await;
        self.task.await.unwrap();
    }
}
