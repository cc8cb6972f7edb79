//! Configuration management for the voice coordinator
//!
//! Values are layered env > TOML file > defaults. The subset that may change
//! while the process runs lives in [`Tunables`] and is republished by
//! [`spawn_reload_watcher`] whenever the config file changes on disk.

pub mod file;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, DebouncedEvent, new_debouncer};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::{Error, Result};

use file::AvaConfigFile;

/// Quiet period before a burst of file events counts as one change
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

/// Accepted bounds for a single batch transcription
const TRANSCRIBE_TIMEOUT_RANGE: std::ops::RangeInclusive<Duration> =
    Duration::from_secs(3)..=Duration::from_secs(10);

/// Voice coordinator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Hot-reloadable tunables
    pub tunables: Tunables,

    /// Speech-to-text engine settings
    pub stt: SttConfig,

    /// Text-to-speech engine settings
    pub tts: TtsConfig,

    /// Response backend settings
    pub backend: BackendConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Config file the values were read from, if any
    pub config_path: Option<PathBuf>,
}

/// Values that may be swapped at runtime
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tunables {
    /// Audio device settings
    pub audio: AudioConfig,

    /// Echo/VAD gate thresholds
    pub echo: EchoConfig,

    /// Transcript filtering
    pub transcript: TranscriptConfig,

    /// Tool-trigger policy
    pub policy: PolicyConfig,

    /// Speech playback
    pub speech: SpeechConfig,

    /// Coordinator timeouts
    pub coordinator: CoordinatorConfig,
}

/// Audio device settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    /// Microphone sample rate in Hz
    pub capture_sample_rate: u32,

    /// Samples per microphone frame
    pub chunk_frames: usize,

    /// Speaker sample rate in Hz
    pub playback_sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            chunk_frames: 1600,
            playback_sample_rate: 24_000,
        }
    }
}

/// Echo/VAD gate thresholds
///
/// RMS values are on the PCM16 scale (0..=32767).
#[derive(Debug, Clone, PartialEq)]
pub struct EchoConfig {
    /// RMS at which user speech starts
    pub start_rms: f32,

    /// RMS below which user speech may stop
    pub stop_rms: f32,

    /// How long RMS must stay low before speech stops
    pub hold: Duration,

    /// Multiplier applied to the playback RMS average while speaking
    pub playback_scale: f32,

    /// Consecutive loud frames required while playback is active
    pub debounce_frames: u32,

    /// Weight of the previous value in the playback RMS average
    pub ema_weight: f32,

    /// Mic stays suppressed this long after playback ends
    pub post_speech_grace: Duration,

    /// Interval for silence keepalive frames while the mic is suppressed
    pub keepalive_interval: Option<Duration>,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            start_rms: 600.0,
            stop_rms: 350.0,
            hold: Duration::from_millis(300),
            playback_scale: 1.8,
            debounce_frames: 3,
            ema_weight: 0.85,
            post_speech_grace: Duration::from_millis(700),
            keepalive_interval: Some(Duration::from_secs(1)),
        }
    }
}

/// Transcript filtering between the STT engine and the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptConfig {
    /// Finals below this confidence are discarded
    pub min_confidence: f32,

    /// Identical finals inside this window are discarded
    pub duplicate_window: Duration,

    /// Promote short stable partials to finals
    pub early_commit: bool,

    /// How long a partial must stay unchanged before early commit
    pub stable_for: Duration,

    /// Longest partial eligible for early commit, in words
    pub max_words: usize,

    /// Only commit partials that contain one of `command_words`
    pub require_command_word: bool,

    /// Short confirmation/interruption words
    pub command_words: Vec<String>,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            duplicate_window: Duration::from_secs(5),
            early_commit: true,
            stable_for: Duration::from_millis(500),
            max_words: 3,
            require_command_word: false,
            command_words: ["stop", "yes", "no", "cancel", "pause", "okay"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Tool-trigger policy operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Command verb required
    #[default]
    Normal,
    /// Command verb and wake phrase required
    Validation,
}

/// Tool-trigger policy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Operating mode
    pub mode: PolicyMode,

    /// Action-indicating words that permit tool execution
    pub command_verbs: Vec<String>,

    /// Wake phrases, longest match wins when stripping
    pub wake_phrases: Vec<String>,

    /// Spoken when the user says only the wake phrase
    pub acknowledgement: String,

    /// Local replies for small talk, keyed by normalized utterance
    pub quick_replies: BTreeMap<String, String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let quick_replies = [
            ("hello", "Hey there!"),
            ("hi", "Hi!"),
            ("hey", "Hey!"),
            ("thanks", "You're welcome."),
            ("thank you", "You're welcome."),
            ("good morning", "Good morning!"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            mode: PolicyMode::Normal,
            command_verbs: [
                "open", "close", "create", "send", "delete", "turn", "set", "stop", "start",
                "remember", "remind", "play", "pause", "search", "schedule", "launch",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            wake_phrases: vec!["hey ava".to_string(), "ava".to_string()],
            acknowledgement: "Yeah?".to_string(),
            quick_replies,
        }
    }
}

/// Speech playback settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechConfig {
    /// Extra time allowed for the sink to drain past the audio duration
    pub drain_slack: Duration,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            drain_slack: Duration::from_millis(500),
        }
    }
}

/// Coordinator timeouts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// A turn stuck in LISTEN longer than this is abandoned
    pub listen_timeout: Duration,

    /// Upper bound on waiting for a backend reply
    pub reply_timeout: Duration,

    /// Housekeeping tick interval
    pub tick_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(25),
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// STT provider backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    /// `OpenAI` Whisper
    #[default]
    Whisper,
    /// Deepgram
    Deepgram,
}

/// Speech-to-text configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Provider
    pub provider: SttProvider,

    /// Model identifier (e.g. "whisper-1", "nova-2")
    pub model: String,

    /// Bound on a single batch transcription
    pub transcribe_timeout: Duration,

    /// Trailing silence that ends an utterance
    pub end_silence: Duration,

    /// Utterances shorter than this are ignored
    pub min_utterance: Duration,

    /// Utterances are cut at this length
    pub max_utterance: Duration,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: SttProvider::Whisper,
            model: "whisper-1".to_string(),
            transcribe_timeout: Duration::from_secs(8),
            end_silence: Duration::from_millis(600),
            min_utterance: Duration::from_millis(300),
            max_utterance: Duration::from_secs(15),
        }
    }
}

/// TTS provider backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    /// `OpenAI` speech
    #[default]
    OpenAi,
    /// `ElevenLabs`
    ElevenLabs,
}

/// Text-to-speech configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Provider
    pub provider: TtsProvider,

    /// Model identifier
    pub model: String,

    /// Voice identifier
    pub voice: String,

    /// Speed multiplier (0.25 to 4.0)
    pub speed: f32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: TtsProvider::OpenAi,
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            speed: 1.0,
        }
    }
}

/// Response backend configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the backend service
    pub base_url: String,

    /// Primary route
    pub route: String,

    /// Route tried when the primary route fails
    pub fallback_route: Option<String>,

    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            route: "/respond".to_string(),
            fallback_route: Some("/chat".to_string()),
            timeout: Duration::from_secs(12),
        }
    }
}

impl BackendConfig {
    /// Longest a single reply can take when every route times out in turn
    #[must_use]
    pub fn request_budget(&self) -> Duration {
        if self.fallback_route.is_some() {
            self.timeout.saturating_mul(2)
        } else {
            self.timeout
        }
    }
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper and TTS)
    pub openai: Option<String>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<String>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<String>,
}

impl ApiKeys {
    /// Key for the given STT provider
    #[must_use]
    pub fn for_stt(&self, provider: SttProvider) -> Option<String> {
        match provider {
            SttProvider::Whisper => self.openai.clone(),
            SttProvider::Deepgram => self.deepgram.clone(),
        }
    }

    /// Key for the given TTS provider
    #[must_use]
    pub fn for_tts(&self, provider: TtsProvider) -> Option<String> {
        match provider {
            TtsProvider::OpenAi => self.openai.clone(),
            TtsProvider::ElevenLabs => self.elevenlabs.clone(),
        }
    }
}

impl Config {
    /// Load configuration from the default (or given) config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load(path_override: Option<&Path>) -> Result<Self> {
        let config_path = path_override
            .map(Path::to_path_buf)
            .or_else(file::config_file_path);
        let fc = config_path
            .as_deref()
            .map(file::load_config_file)
            .unwrap_or_default();

        let tunables = Tunables::from_file(&fc);

        let api_keys = ApiKeys {
            openai: std::env::var("OPENAI_API_KEY").ok().or(fc.api_keys.openai),
            deepgram: std::env::var("DEEPGRAM_API_KEY")
                .ok()
                .or(fc.api_keys.deepgram),
            elevenlabs: std::env::var("ELEVENLABS_API_KEY")
                .ok()
                .or(fc.api_keys.elevenlabs),
        };

        let stt_defaults = SttConfig::default();
        let stt = SttConfig {
            provider: fc.stt.provider.unwrap_or_default(),
            model: std::env::var("AVA_STT_MODEL")
                .ok()
                .or(fc.stt.model)
                .unwrap_or(stt_defaults.model),
            transcribe_timeout: fc
                .stt
                .transcribe_timeout_ms
                .map_or(stt_defaults.transcribe_timeout, Duration::from_millis),
            end_silence: fc
                .stt
                .end_silence_ms
                .map_or(stt_defaults.end_silence, Duration::from_millis),
            min_utterance: fc
                .stt
                .min_utterance_ms
                .map_or(stt_defaults.min_utterance, Duration::from_millis),
            max_utterance: fc
                .stt
                .max_utterance_ms
                .map_or(stt_defaults.max_utterance, Duration::from_millis),
        };

        let tts_defaults = TtsConfig::default();
        let tts = TtsConfig {
            provider: fc.tts.provider.unwrap_or_default(),
            model: std::env::var("AVA_TTS_MODEL")
                .ok()
                .or(fc.tts.model)
                .unwrap_or(tts_defaults.model),
            voice: fc.tts.voice.unwrap_or(tts_defaults.voice),
            speed: fc.tts.speed.unwrap_or(tts_defaults.speed),
        };

        let backend_defaults = BackendConfig::default();
        let backend = BackendConfig {
            base_url: std::env::var("AVA_BACKEND_URL")
                .ok()
                .or(fc.backend.url)
                .unwrap_or(backend_defaults.base_url),
            route: fc.backend.route.unwrap_or(backend_defaults.route),
            fallback_route: fc.backend.fallback_route.or(backend_defaults.fallback_route),
            timeout: fc
                .backend
                .timeout_ms
                .map_or(backend_defaults.timeout, Duration::from_millis),
        };

        tracing::debug!(
            backend = %backend.base_url,
            stt_model = %stt.model,
            tts_model = %tts.model,
            "configuration loaded"
        );

        let config = Self {
            tunables,
            stt,
            tts,
            backend,
            api_keys,
            config_path,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the tunables and the fixed engine settings
    ///
    /// # Errors
    ///
    /// Returns a config error describing the first violated constraint
    pub fn validate(&self) -> Result<()> {
        self.check_tunables(&self.tunables)?;

        let timeout = self.stt.transcribe_timeout;
        if !TRANSCRIBE_TIMEOUT_RANGE.contains(&timeout) {
            return Err(Error::Config(format!(
                "stt.transcribe_timeout_ms ({}) must be between {} and {}",
                timeout.as_millis(),
                TRANSCRIBE_TIMEOUT_RANGE.start().as_millis(),
                TRANSCRIBE_TIMEOUT_RANGE.end().as_millis()
            )));
        }
        Ok(())
    }

    /// Check `tunables` on their own and against the settings fixed at startup
    ///
    /// The reply timeout has to leave the fallback route its full request
    /// timeout after the primary route used up its own.
    ///
    /// # Errors
    ///
    /// Returns a config error describing the first violated constraint
    pub fn check_tunables(&self, tunables: &Tunables) -> Result<()> {
        tunables.validate()?;

        let reply_timeout = tunables.coordinator.reply_timeout;
        let budget = self.backend.request_budget();
        if reply_timeout < budget {
            return Err(Error::Config(format!(
                "coordinator.reply_timeout_ms ({}) must cover backend.timeout_ms on every route ({})",
                reply_timeout.as_millis(),
                budget.as_millis()
            )));
        }
        Ok(())
    }
}

impl Tunables {
    /// Build tunables from a parsed config file, filling gaps with defaults
    #[must_use]
    pub fn from_file(fc: &AvaConfigFile) -> Self {
        let audio_defaults = AudioConfig::default();
        let audio = AudioConfig {
            capture_sample_rate: fc
                .audio
                .capture_sample_rate
                .unwrap_or(audio_defaults.capture_sample_rate),
            chunk_frames: fc.audio.chunk_frames.unwrap_or(audio_defaults.chunk_frames),
            playback_sample_rate: fc
                .audio
                .playback_sample_rate
                .unwrap_or(audio_defaults.playback_sample_rate),
        };

        let e = EchoConfig::default();
        let v = &fc.vad;
        let echo = EchoConfig {
            start_rms: v.start_rms.unwrap_or(e.start_rms),
            stop_rms: v.stop_rms.unwrap_or(e.stop_rms),
            hold: v.hold_ms.map_or(e.hold, Duration::from_millis),
            playback_scale: v.playback_scale.unwrap_or(e.playback_scale),
            debounce_frames: v.debounce_frames.unwrap_or(e.debounce_frames),
            ema_weight: v.ema_weight.unwrap_or(e.ema_weight),
            post_speech_grace: v
                .tts_cooldown_ms
                .map_or(e.post_speech_grace, Duration::from_millis),
            keepalive_interval: match v.keepalive_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => e.keepalive_interval,
            },
        };

        let t = TranscriptConfig::default();
        let tf = &fc.transcript;
        let transcript = TranscriptConfig {
            min_confidence: tf.min_confidence.unwrap_or(t.min_confidence),
            duplicate_window: tf
                .duplicate_window_ms
                .map_or(t.duplicate_window, Duration::from_millis),
            early_commit: tf.early_commit.unwrap_or(t.early_commit),
            stable_for: tf.stable_for_ms.map_or(t.stable_for, Duration::from_millis),
            max_words: tf.max_words.unwrap_or(t.max_words),
            require_command_word: tf.require_command_word.unwrap_or(t.require_command_word),
            command_words: tf.command_words.clone().unwrap_or(t.command_words),
        };

        let p = PolicyConfig::default();
        let pf = &fc.policy;
        let policy = PolicyConfig {
            mode: pf.mode.unwrap_or(p.mode),
            command_verbs: pf.command_verbs.clone().unwrap_or(p.command_verbs),
            wake_phrases: pf.wake_words.clone().unwrap_or(p.wake_phrases),
            acknowledgement: pf.acknowledgement.clone().unwrap_or(p.acknowledgement),
            quick_replies: pf.quick_replies.clone().unwrap_or(p.quick_replies),
        };

        let s = SpeechConfig::default();
        let speech = SpeechConfig {
            drain_slack: fc
                .speech
                .drain_slack_ms
                .map_or(s.drain_slack, Duration::from_millis),
        };

        let c = CoordinatorConfig::default();
        let cf = &fc.coordinator;
        let coordinator = CoordinatorConfig {
            listen_timeout: cf
                .listen_timeout_ms
                .map_or(c.listen_timeout, Duration::from_millis),
            reply_timeout: cf
                .reply_timeout_ms
                .map_or(c.reply_timeout, Duration::from_millis),
            tick_interval: cf
                .tick_interval_ms
                .map_or(c.tick_interval, Duration::from_millis),
        };

        Self {
            audio,
            echo,
            transcript,
            policy,
            speech,
            coordinator,
        }
    }

    /// Check relationships between values
    ///
    /// The playback-aware threshold must never fall below the plain one, so
    /// `playback_scale` may not shrink the playback average and
    /// `stop_rms` may not exceed `start_rms`.
    ///
    /// # Errors
    ///
    /// Returns a config error describing the first violated constraint
    pub fn validate(&self) -> Result<()> {
        let e = &self.echo;
        if e.start_rms <= 0.0 || e.stop_rms < 0.0 {
            return Err(Error::Config("vad thresholds must be positive".to_string()));
        }
        if e.stop_rms > e.start_rms {
            return Err(Error::Config(format!(
                "vad.stop_rms ({}) must not exceed vad.start_rms ({})",
                e.stop_rms, e.start_rms
            )));
        }
        if e.playback_scale < 1.0 {
            return Err(Error::Config(format!(
                "vad.playback_scale ({}) must be at least 1.0",
                e.playback_scale
            )));
        }
        if e.debounce_frames == 0 {
            return Err(Error::Config(
                "vad.debounce_frames must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&e.ema_weight) {
            return Err(Error::Config(format!(
                "vad.ema_weight ({}) must be in [0, 1)",
                e.ema_weight
            )));
        }
        if !(0.0..=1.0).contains(&self.transcript.min_confidence) {
            return Err(Error::Config(
                "transcript.min_confidence must be in [0, 1]".to_string(),
            ));
        }
        if self.audio.capture_sample_rate == 0
            || self.audio.playback_sample_rate == 0
            || self.audio.chunk_frames == 0
        {
            return Err(Error::Config(
                "audio sample rates and chunk size must be non-zero".to_string(),
            ));
        }
        if self.policy.wake_phrases.iter().any(|w| w.trim().is_empty()) {
            return Err(Error::Config("wake words must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Watch the config file and publish changed tunables
///
/// The file's directory is watched so editors that save through a rename
/// are still seen. Reloaded tunables are checked against `base` before
/// they are published; invalid or unreadable files are logged and the
/// previous tunables kept.
///
/// # Errors
///
/// Returns error if the directory cannot be watched
pub fn spawn_reload_watcher(
    path: PathBuf,
    base: Config,
    tx: watch::Sender<Tunables>,
) -> Result<JoinHandle<()>> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut debouncer = new_debouncer(RELOAD_DEBOUNCE, None, move |result: DebounceEventResult| {
        let _ = event_tx.send(result);
    })?;
    debouncer.watch(&dir, RecursiveMode::NonRecursive)?;

    Ok(tokio::spawn(async move {
        // The watch ends when the debouncer is dropped
        let _debouncer = debouncer;

        loop {
            let result = tokio::select! {
                () = tx.closed() => break,
                result = event_rx.recv() => match result {
                    Some(result) => result,
                    None => break,
                },
            };

            match result {
                Ok(events) => {
                    if events.iter().any(|event| touches(event, &path)) {
                        reload(&path, &base, &tx);
                    }
                }
                Err(errors) => {
                    for e in errors {
                        tracing::warn!(path = %path.display(), error = %e, "config watch error");
                    }
                }
            }
        }
        tracing::debug!(path = %path.display(), "config watcher stopped");
    }))
}

fn touches(event: &DebouncedEvent, path: &Path) -> bool {
    (event.kind.is_create() || event.kind.is_modify())
        && event
            .paths
            .iter()
            .any(|changed| changed.file_name() == path.file_name())
}

fn reload(path: &Path, base: &Config, tx: &watch::Sender<Tunables>) {
    let fc = match file::read_config_file(path) {
        Ok(fc) => fc,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "config reload failed");
            return;
        }
    };

    let tunables = Tunables::from_file(&fc);
    if let Err(e) = base.check_tunables(&tunables) {
        tracing::warn!(path = %path.display(), error = %e, "rejected reloaded config");
        return;
    }

    let changed = tx.send_if_modified(|current| {
        if *current == tunables {
            false
        } else {
            *current = tunables;
            true
        }
    });
    if changed {
        tracing::info!(path = %path.display(), "config reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Tunables::default().validate().is_ok());
    }

    #[test]
    fn test_stop_above_start_rejected() {
        let mut t = Tunables::default();
        t.echo.stop_rms = t.echo.start_rms + 1.0;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_playback_scale_below_one_rejected() {
        let mut t = Tunables::default();
        t.echo.playback_scale = 0.5;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_from_file_overrides() {
        let fc: AvaConfigFile = toml::from_str(
            r#"
            [vad]
            start_rms = 900.0
            debounce_frames = 5
            keepalive_ms = 0

            [policy]
            mode = "validation"
            wake_words = ["computer"]
            "#,
        )
        .unwrap();

        let t = Tunables::from_file(&fc);
        assert!((t.echo.start_rms - 900.0).abs() < f32::EPSILON);
        assert_eq!(t.echo.debounce_frames, 5);
        assert_eq!(t.echo.keepalive_interval, None);
        assert_eq!(t.policy.mode, PolicyMode::Validation);
        assert_eq!(t.policy.wake_phrases, vec!["computer".to_string()]);
        // Untouched sections keep their defaults
        assert_eq!(t.transcript, TranscriptConfig::default());
    }

    fn base_config() -> Config {
        Config {
            tunables: Tunables::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            backend: BackendConfig::default(),
            api_keys: ApiKeys::default(),
            config_path: None,
        }
    }

    #[test]
    fn test_default_config_validates() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_reply_timeout_covers_fallback_route() {
        let mut config = base_config();
        config.backend.timeout = Duration::from_secs(20);
        config.tunables.coordinator.reply_timeout = Duration::from_secs(25);
        assert!(config.validate().is_err());

        config.tunables.coordinator.reply_timeout = Duration::from_secs(40);
        assert!(config.validate().is_ok());

        // Without a fallback one request timeout is enough
        config.backend.fallback_route = None;
        config.tunables.coordinator.reply_timeout = Duration::from_secs(20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transcribe_timeout_range() {
        let mut config = base_config();
        for (secs, ok) in [(2, false), (3, true), (10, true), (11, false)] {
            config.stt.transcribe_timeout = Duration::from_secs(secs);
            assert_eq!(config.validate().is_ok(), ok, "{secs}s");
        }
    }

    fn reload_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ava-reload-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_reload_watcher_publishes_changes() {
        let dir = reload_dir();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[vad]\nstart_rms = 700.0\n").unwrap();

        let (tx, mut rx) = watch::channel(Tunables::default());
        let handle = spawn_reload_watcher(path.clone(), base_config(), tx).unwrap();

        std::fs::write(&path, "[vad]\nstart_rms = 800.0\n").unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!((rx.borrow().echo.start_rms - 800.0).abs() < f32::EPSILON);

        handle.abort();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_reload_rejects_short_reply_timeout() {
        let dir = reload_dir();
        let path = dir.join("config.toml");
        std::fs::write(&path, "").unwrap();

        let (tx, mut rx) = watch::channel(Tunables::default());
        let handle = spawn_reload_watcher(path.clone(), base_config(), tx).unwrap();

        std::fs::write(&path, "[coordinator]\nreply_timeout_ms = 5000\n").unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!rx.has_changed().unwrap());

        std::fs::write(&path, "[coordinator]\nreply_timeout_ms = 30000\n").unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            rx.borrow().coordinator.reply_timeout,
            Duration::from_secs(30)
        );

        handle.abort();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_provider_keys() {
        let keys = ApiKeys {
            openai: Some("sk-openai".to_string()),
            deepgram: Some("dg".to_string()),
            elevenlabs: None,
        };
        assert_eq!(keys.for_stt(SttProvider::Whisper).as_deref(), Some("sk-openai"));
        assert_eq!(keys.for_stt(SttProvider::Deepgram).as_deref(), Some("dg"));
        assert_eq!(keys.for_tts(TtsProvider::OpenAi).as_deref(), Some("sk-openai"));
        assert_eq!(keys.for_tts(TtsProvider::ElevenLabs), None);
    }
}
