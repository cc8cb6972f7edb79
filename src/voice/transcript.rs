//! Transcript filtering between the STT engine and the coordinator
//!
//! Partial results never leave this module as anything the coordinator can
//! act on: the only actionable output is [`FinalTranscript`], which has no
//! public constructor. Short partials that stop changing can be promoted to a
//! final early, to answer quick confirmations without waiting on the engine.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::TranscriptConfig;

use super::TranscriptEvent;

/// How many early-committed utterance ids are remembered
const COMMITTED_HISTORY: usize = 32;

/// Partials not updated for this long belong to an utterance the engine abandoned
const PENDING_TTL: Duration = Duration::from_secs(30);

/// A finished utterance, eligible for routing
#[derive(Debug, Clone, PartialEq)]
pub struct FinalTranscript {
    text: String,
    confidence: Option<f32>,
    utterance_id: String,
    early_commit: bool,
}

impl FinalTranscript {
    /// Recognized text, trimmed
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Engine confidence, when reported
    #[must_use]
    pub const fn confidence(&self) -> Option<f32> {
        self.confidence
    }

    /// Utterance the text belongs to
    #[must_use]
    pub fn utterance_id(&self) -> &str {
        &self.utterance_id
    }

    /// Whether this was promoted from a stable partial
    #[must_use]
    pub const fn is_early_commit(&self) -> bool {
        self.early_commit
    }
}

/// Why a final was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Nothing was recognized
    Empty,
    /// Confidence under the configured minimum
    LowConfidence,
    /// Same text seen within the duplicate window
    Duplicate,
}

/// Result of filtering a transcript event
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutput {
    /// Forward to the coordinator
    Final(FinalTranscript),
    /// The utterance ended without usable text
    Discarded {
        /// Utterance that was dropped
        utterance_id: String,
        /// Why it was dropped
        reason: DiscardReason,
    },
}

/// Remembers recently accepted finals to absorb repeated deliveries
#[derive(Debug)]
pub struct DuplicateTranscriptCache {
    window: Duration,
    entries: HashMap<String, Instant>,
}

impl DuplicateTranscriptCache {
    /// Create a cache with the given expiry window
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// Case- and whitespace-insensitive form of `text`
    #[must_use]
    pub fn normalize(text: &str) -> String {
        text.split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Record `text` at `now`
    ///
    /// Returns false when the same text was recorded within the window.
    pub fn check_and_record(&mut self, text: &str, now: Instant) -> bool {
        let window = self.window;
        self.entries
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);

        let key = Self::normalize(text);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, now);
        true
    }

    /// Change the expiry window
    pub const fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
struct PendingPartial {
    text: String,
    /// When the text last changed
    since: Instant,
    /// When the engine last reported it
    seen: Instant,
}

/// Turns raw engine events into forwardable finals
#[derive(Debug)]
pub struct TranscriptFilter {
    config: TranscriptConfig,
    duplicates: DuplicateTranscriptCache,
    pending: HashMap<String, PendingPartial>,
    committed: VecDeque<String>,
}

impl TranscriptFilter {
    /// Create a filter
    #[must_use]
    pub fn new(config: TranscriptConfig) -> Self {
        let duplicates = DuplicateTranscriptCache::new(config.duplicate_window);
        Self {
            config,
            duplicates,
            pending: HashMap::new(),
            committed: VecDeque::with_capacity(COMMITTED_HISTORY),
        }
    }

    /// Swap settings, keeping pending partials and the duplicate cache
    pub fn reconfigure(&mut self, config: TranscriptConfig) {
        self.duplicates.set_window(config.duplicate_window);
        self.config = config;
    }

    /// Filter an event received now
    pub fn accept(&mut self, event: TranscriptEvent) -> Option<FilterOutput> {
        self.accept_at(event, Instant::now())
    }

    /// Filter an event received at `now`
    pub fn accept_at(&mut self, event: TranscriptEvent, now: Instant) -> Option<FilterOutput> {
        if !event.is_final {
            self.track_partial(event, now);
            return None;
        }

        self.pending.remove(&event.utterance_id);
        if let Some(pos) = self.committed.iter().position(|id| *id == event.utterance_id) {
            self.committed.remove(pos);
            tracing::debug!(
                utterance_id = %event.utterance_id,
                text = %event.text,
                "final superseded by early commit"
            );
            return None;
        }

        Some(self.finish(event.text, event.confidence, event.utterance_id, false, now))
    }

    /// Promote a stable short partial, if one is due
    pub fn poll(&mut self) -> Option<FilterOutput> {
        self.poll_at(Instant::now())
    }

    /// Promote a partial that has been stable as of `now`, if one is due
    pub fn poll_at(&mut self, now: Instant) -> Option<FilterOutput> {
        self.prune_pending(now);
        if !self.config.early_commit {
            return None;
        }

        let utterance_id = self
            .pending
            .iter()
            .find(|(_, p)| {
                now.saturating_duration_since(p.since) >= self.config.stable_for
                    && self.eligible_for_early_commit(&p.text)
            })
            .map(|(id, _)| id.clone())?;

        let partial = self.pending.remove(&utterance_id)?;
        if self.committed.len() >= COMMITTED_HISTORY {
            self.committed.pop_front();
        }
        self.committed.push_back(utterance_id.clone());

        tracing::debug!(
            utterance_id = %utterance_id,
            text = %partial.text,
            "early commit of stable partial"
        );
        Some(self.finish(partial.text, None, utterance_id, true, now))
    }

    fn prune_pending(&mut self, now: Instant) {
        let before = self.pending.len();
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.seen) < PENDING_TTL);
        let pruned = before - self.pending.len();
        if pruned > 0 {
            tracing::debug!(pruned, "dropped partials that never got a final");
        }
    }

    fn track_partial(&mut self, event: TranscriptEvent, now: Instant) {
        if self.committed.contains(&event.utterance_id) {
            return;
        }

        let text = event.text.trim();
        match self.pending.get_mut(&event.utterance_id) {
            Some(p) if p.text == text => p.seen = now,
            Some(p) => {
                p.text = text.to_string();
                p.since = now;
                p.seen = now;
            }
            None => {
                self.pending.insert(
                    event.utterance_id,
                    PendingPartial {
                        text: text.to_string(),
                        since: now,
                        seen: now,
                    },
                );
            }
        }
    }

    fn eligible_for_early_commit(&self, text: &str) -> bool {
        let words: Vec<String> = text
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect();

        if words.is_empty() || words.len() > self.config.max_words {
            return false;
        }
        !self.config.require_command_word
            || words
                .iter()
                .any(|w| self.config.command_words.iter().any(|c| c == w))
    }

    fn finish(
        &mut self,
        text: String,
        confidence: Option<f32>,
        utterance_id: String,
        early_commit: bool,
        now: Instant,
    ) -> FilterOutput {
        let text = text.trim().to_string();

        if text.is_empty() {
            tracing::debug!(utterance_id = %utterance_id, "empty final discarded");
            return FilterOutput::Discarded {
                utterance_id,
                reason: DiscardReason::Empty,
            };
        }

        if let Some(c) = confidence
            && c < self.config.min_confidence
        {
            tracing::info!(
                utterance_id = %utterance_id,
                text = %text,
                confidence = c,
                "low-confidence final discarded"
            );
            return FilterOutput::Discarded {
                utterance_id,
                reason: DiscardReason::LowConfidence,
            };
        }

        if !self.duplicates.check_and_record(&text, now) {
            tracing::info!(utterance_id = %utterance_id, text = %text, "duplicate final discarded");
            return FilterOutput::Discarded {
                utterance_id,
                reason: DiscardReason::Duplicate,
            };
        }

        FilterOutput::Final(FinalTranscript {
            text,
            confidence,
            utterance_id,
            early_commit,
        })
    }
}
