//! TOML configuration file loading
//!
//! Supports `~/.config/ava/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{PolicyMode, SttProvider, TtsProvider};
use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct AvaConfigFile {
    /// Audio device configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Echo/VAD gate thresholds
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Transcript filtering
    #[serde(default)]
    pub transcript: TranscriptFileConfig,

    /// Tool-trigger policy
    #[serde(default)]
    pub policy: PolicyFileConfig,

    /// Speech playback
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Coordinator timeouts
    #[serde(default)]
    pub coordinator: CoordinatorFileConfig,

    /// Speech-to-text engine
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Text-to-speech engine
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Response backend
    #[serde(default)]
    pub backend: BackendFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Audio device configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub capture_sample_rate: Option<u32>,
    pub chunk_frames: Option<usize>,
    pub playback_sample_rate: Option<u32>,
}

/// Echo/VAD gate thresholds
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub start_rms: Option<f32>,
    pub stop_rms: Option<f32>,
    pub hold_ms: Option<u64>,
    pub playback_scale: Option<f32>,
    pub debounce_frames: Option<u32>,
    pub ema_weight: Option<f32>,
    /// Post-speech mic suppression
    pub tts_cooldown_ms: Option<u64>,
    /// `0` disables keepalive frames
    pub keepalive_ms: Option<u64>,
}

/// Transcript filtering
#[derive(Debug, Default, Deserialize)]
pub struct TranscriptFileConfig {
    pub min_confidence: Option<f32>,
    pub duplicate_window_ms: Option<u64>,
    pub early_commit: Option<bool>,
    pub stable_for_ms: Option<u64>,
    pub max_words: Option<usize>,
    pub require_command_word: Option<bool>,
    pub command_words: Option<Vec<String>>,
}

/// Tool-trigger policy
#[derive(Debug, Default, Deserialize)]
pub struct PolicyFileConfig {
    pub mode: Option<PolicyMode>,
    pub command_verbs: Option<Vec<String>>,
    pub wake_words: Option<Vec<String>>,
    pub acknowledgement: Option<String>,
    pub quick_replies: Option<BTreeMap<String, String>>,
}

/// Speech playback
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    pub drain_slack_ms: Option<u64>,
}

/// Coordinator timeouts
#[derive(Debug, Default, Deserialize)]
pub struct CoordinatorFileConfig {
    pub listen_timeout_ms: Option<u64>,
    pub reply_timeout_ms: Option<u64>,
    pub tick_interval_ms: Option<u64>,
}

/// Speech-to-text engine
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    pub provider: Option<SttProvider>,
    pub model: Option<String>,
    pub transcribe_timeout_ms: Option<u64>,
    pub end_silence_ms: Option<u64>,
    pub min_utterance_ms: Option<u64>,
    pub max_utterance_ms: Option<u64>,
}

/// Text-to-speech engine
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub provider: Option<TtsProvider>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
}

/// Response backend
#[derive(Debug, Default, Deserialize)]
pub struct BackendFileConfig {
    pub url: Option<String>,
    pub route: Option<String>,
    pub fallback_route: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Read and parse a config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<AvaConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load the TOML config file at `path`
///
/// Returns `AvaConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: &Path) -> AvaConfigFile {
    if !path.exists() {
        return AvaConfigFile::default();
    }

    match read_config_file(path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            AvaConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/ava/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("ava").join("config.toml"))
}
