//! Voice processing module
//!
//! Audio devices and frames, the echo-aware VAD gate, and the STT/TTS
//! adapters. Turn logic lives in `turn` and `coordinator`.

mod capture;
pub mod echo;
mod frame;
mod playback;
pub mod stt;
pub mod transcript;
pub mod tts;

pub use capture::AudioCapture;
pub use echo::{EchoGate, EchoState, MicAction};
pub use frame::{AudioFrame, pcm16_rms, rms_i16, samples_to_wav};
pub use playback::{AudioPlayback, PlaybackQueue, PlaybackSink};
pub use stt::{
    BatchSttEngine, HttpTranscriber, SttEngine, Transcriber, TranscriptEvent, Transcription,
};
pub use transcript::{
    DiscardReason, DuplicateTranscriptCache, FilterOutput, FinalTranscript, TranscriptFilter,
};
pub use tts::{AudioStream, HttpTts, TtsEngine};
