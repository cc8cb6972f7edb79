//! Tool-trigger policy
//!
//! Decides what a final transcript is allowed to do. Only utterances that
//! carry a command verb (and, in validation mode, a wake phrase) reach the
//! backend with tool execution enabled; everything else is answered as chat.

use crate::config::{PolicyConfig, PolicyMode};
use crate::voice::FinalTranscript;

/// Where a final transcript should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The user only said the wake phrase
    Acknowledge(String),
    /// Small talk answered locally
    QuickReply(String),
    /// Forward to the response backend
    Backend {
        /// Utterance with any leading wake phrase removed
        text: String,
        /// Whether the backend may execute tools for this request
        tools_enabled: bool,
    },
}

/// Gate between recognized speech and tool execution
#[derive(Debug, Clone)]
pub struct ToolTriggerPolicy {
    config: PolicyConfig,
    /// Lowercased wake phrases, longest first
    wake_phrases: Vec<String>,
}

impl ToolTriggerPolicy {
    /// Create a policy from configuration
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        let wake_phrases = sorted_wake_phrases(&config.wake_phrases);
        Self {
            config,
            wake_phrases,
        }
    }

    /// Swap vocabulary and mode
    pub fn reconfigure(&mut self, config: PolicyConfig) {
        if config != self.config {
            tracing::info!(mode = ?config.mode, "policy reconfigured");
        }
        self.wake_phrases = sorted_wake_phrases(&config.wake_phrases);
        self.config = config;
    }

    /// Current operating mode
    #[must_use]
    pub const fn mode(&self) -> PolicyMode {
        self.config.mode
    }

    /// Whether `text` may trigger tool execution
    #[must_use]
    pub fn should_allow_tools(&self, text: &str) -> bool {
        let words = words(text);
        let verb = words
            .iter()
            .find(|w| self.config.command_verbs.iter().any(|v| v == *w));
        let wake_ok = match self.config.mode {
            PolicyMode::Normal => true,
            PolicyMode::Validation => self.contains_wake_phrase(&words),
        };
        let allowed = verb.is_some() && wake_ok;

        tracing::info!(
            allowed,
            mode = ?self.config.mode,
            verb = verb.map_or("", String::as_str),
            "tool policy decision"
        );
        allowed
    }

    /// Whether `text` is nothing but a wake phrase
    #[must_use]
    pub fn is_bare_wake_word(&self, text: &str) -> bool {
        self.match_wake_prefix(text)
            .is_some_and(|rest| trim_filler(rest).is_empty())
    }

    /// Remove a leading wake phrase, returning the command that follows it
    #[must_use]
    pub fn strip_wake_word<'a>(&self, text: &'a str) -> &'a str {
        self.match_wake_prefix(text).map_or(text, trim_filler)
    }

    /// Local reply for small talk, if the whole utterance matches one
    #[must_use]
    pub fn quick_reply(&self, text: &str) -> Option<&str> {
        let key = words(self.strip_wake_word(text)).join(" ");
        self.config.quick_replies.get(&key).map(String::as_str)
    }

    /// Decide where a final transcript goes
    #[must_use]
    pub fn route(&self, transcript: &FinalTranscript) -> Route {
        let text = transcript.text();

        if self.is_bare_wake_word(text) {
            return Route::Acknowledge(self.config.acknowledgement.clone());
        }
        if let Some(reply) = self.quick_reply(text) {
            return Route::QuickReply(reply.to_string());
        }

        Route::Backend {
            text: self.strip_wake_word(text).to_string(),
            tools_enabled: self.should_allow_tools(text),
        }
    }

    fn contains_wake_phrase(&self, words: &[String]) -> bool {
        self.wake_phrases.iter().any(|phrase| {
            let needle: Vec<&str> = phrase.split_whitespace().collect();
            !needle.is_empty()
                && words
                    .windows(needle.len())
                    .any(|window| window.iter().zip(&needle).all(|(a, b)| a == b))
        })
    }

    /// Text following a wake phrase at the start of `text`
    fn match_wake_prefix<'a>(&self, text: &'a str) -> Option<&'a str> {
        let trimmed = trim_filler(text);
        self.wake_phrases.iter().find_map(|phrase| {
            let head = trimmed.get(..phrase.len())?;
            if !head.eq_ignore_ascii_case(phrase) {
                return None;
            }
            let rest = trimmed.get(phrase.len()..)?;
            // "avatar" does not start with the wake word "ava"
            rest.chars()
                .next()
                .is_none_or(|c| !c.is_alphanumeric())
                .then_some(rest)
        })
    }
}

fn sorted_wake_phrases(phrases: &[String]) -> Vec<String> {
    let mut sorted: Vec<String> = phrases
        .iter()
        .map(|p| words(p).join(" "))
        .filter(|p| !p.is_empty())
        .collect();
    sorted.sort_by_key(|p| std::cmp::Reverse(p.len()));
    sorted
}

/// Lowercased words with surrounding punctuation removed
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || (c.is_ascii_punctuation() && c != '\''))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn trim_filler(text: &str) -> &str {
    text.trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | '!' | '?'))
}
