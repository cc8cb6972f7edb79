//! Ava Voice - half-duplex voice turn coordinator
//!
//! This library provides the core of a voice assistant front-end:
//! - Audio capture and playback with an echo-aware VAD gate
//! - STT/TTS adapters (partial/final normalization, early commit, dedupe)
//! - An explicit turn state machine with token-gated speech
//! - A tool-trigger policy in front of the response backend
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌────────────┐
//! │ Capture  │──▶│ Echo gate │──▶│   STT   │──▶│ Transcript │
//! └──────────┘   └───────────┘   └─────────┘   │   filter   │
//!                                              └─────┬──────┘
//!                                                    │ finals only
//! ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌─────▼──────┐
//! │ Speaker  │◀──│  Speech   │◀──│ Backend │◀──│Coordinator │
//! └──────────┘   │   gate    │   └─────────┘   │ + policy   │
//!                └───────────┘                 └────────────┘
//! ```
//!
//! Only the coordinator task routes utterances. The [`turn::TurnStateMachine`]
//! is shared with the speech gate so a reply can only play while its turn's
//! token is current.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod policy;
pub mod speech;
pub mod turn;
pub mod voice;

pub use backend::{BackendReply, BackendRequest, HttpBackend, ResponseBackend};
pub use config::{Config, Tunables};
pub use coordinator::{Coordinator, CoordinatorEvent, CoordinatorHandle, TranscriptPump};
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use policy::{Route, ToolTriggerPolicy};
pub use speech::{SpeakOutcome, SpeechEvent, SpeechGate};
pub use turn::{IdleGuard, TtsToken, TurnState, TurnStateMachine};
