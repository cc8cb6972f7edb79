//! Turn state machine
//!
//! One conversational turn walks `Idle → Listen → Final → Decide → Speak → Idle`.
//! Entering `Decide` mints a [`TtsToken`]; speech is only played for the
//! current token, so a reply that arrives after its turn was abandoned stays
//! silent. `Speak` is a hard lock: only the end of speech ([`TurnStateMachine::release`])
//! or [`TurnStateMachine::force_idle`] leaves it, which is why barge-in is unsupported.

use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Phase of the current turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    /// Waiting for the user
    Idle,
    /// User is speaking
    Listen,
    /// A final transcript is in hand
    Final,
    /// Working out (or fetching) the reply
    Decide,
    /// Playing the reply
    Speak,
}

impl TurnState {
    /// All states, in turn order
    pub const ALL: [Self; 5] = [
        Self::Idle,
        Self::Listen,
        Self::Final,
        Self::Decide,
        Self::Speak,
    ];

    /// Whether `self → to` is an edge of the turn graph
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Listen)
                | (Self::Listen, Self::Final | Self::Idle)
                | (Self::Final, Self::Decide | Self::Idle)
                | (Self::Decide, Self::Speak | Self::Idle)
                | (Self::Speak, Self::Idle)
        )
    }

    /// Lowercase name used in logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listen => "listen",
            Self::Final => "final",
            Self::Decide => "decide",
            Self::Speak => "speak",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization for exactly one speech synthesis
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TtsToken(String);

impl TtsToken {
    fn mint() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Token value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TtsToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to correlate log lines
        f.write_str(self.0.get(..8).unwrap_or(&self.0))
    }
}

#[derive(Debug)]
struct Inner {
    state: TurnState,
    turn_id: u64,
    tts_token: Option<TtsToken>,
}

/// Lock-guarded turn state shared by the mic loop, the coordinator and speech
#[derive(Debug)]
pub struct TurnStateMachine {
    inner: Mutex<Inner>,
}

impl Default for TurnStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnStateMachine {
    /// Interrupting the assistant mid-reply is not supported
    pub const BARGE_IN_ENABLED: bool = false;

    /// Create a machine in `Idle` with no turns taken
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: TurnState::Idle,
                turn_id: 0,
                tts_token: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempt a transition
    ///
    /// Returns false, leaving the state untouched, when the edge is not in the
    /// turn graph or the machine is speaking.
    pub fn transition(&self, to: TurnState, reason: &str) -> bool {
        let mut inner = self.lock();
        Self::apply(&mut inner, to, reason)
    }

    /// Move `Final → Decide` and hand back the token minted for it
    pub fn decide(&self, reason: &str) -> Option<TtsToken> {
        let mut inner = self.lock();
        if Self::apply(&mut inner, TurnState::Decide, reason) {
            inner.tts_token.clone()
        } else {
            None
        }
    }

    fn apply(inner: &mut Inner, to: TurnState, reason: &str) -> bool {
        let from = inner.state;

        if from == TurnState::Speak {
            tracing::debug!(
                from = %from,
                to = %to,
                reason,
                turn_id = inner.turn_id,
                "transition dropped while speaking"
            );
            return false;
        }

        if !from.can_transition_to(to) {
            tracing::error!(
                from = %from,
                to = %to,
                reason,
                turn_id = inner.turn_id,
                "invalid turn transition"
            );
            return false;
        }

        match to {
            TurnState::Listen => inner.turn_id += 1,
            TurnState::Decide => inner.tts_token = Some(TtsToken::mint()),
            TurnState::Idle => inner.tts_token = None,
            TurnState::Final | TurnState::Speak => {}
        }
        inner.state = to;

        tracing::info!(
            from = %from,
            to = %to,
            reason,
            turn_id = inner.turn_id,
            "turn transition"
        );
        true
    }

    /// Return to `Idle` from any state and revoke the current token
    pub fn force_idle(&self, reason: &str) {
        let mut inner = self.lock();
        Self::idle(&mut inner, reason);
    }

    fn idle(inner: &mut Inner, reason: &str) {
        let from = inner.state;
        inner.state = TurnState::Idle;
        inner.tts_token = None;

        if from == TurnState::Idle {
            tracing::trace!(reason, "force idle while idle");
        } else {
            tracing::info!(
                from = %from,
                to = %TurnState::Idle,
                reason,
                turn_id = inner.turn_id,
                "turn forced idle"
            );
        }
    }

    /// Enter `Speak` for the turn `token` belongs to
    ///
    /// Returns false when the token has been revoked. Out-of-band speech,
    /// which has a token but no `Decide`, is authorized without a transition.
    pub fn begin_speaking(&self, token: &TtsToken, reason: &str) -> bool {
        let mut inner = self.lock();
        if inner.tts_token.as_ref() != Some(token) {
            return false;
        }
        if inner.state == TurnState::Decide {
            Self::apply(&mut inner, TurnState::Speak, reason);
        }
        true
    }

    /// End the speech `token` authorized
    ///
    /// Forces idle when `token` is still current. When the token was
    /// replaced mid-speech (an out-of-band [`Self::mint_tts_token`]) and
    /// the machine is still in `Speak`, the lock is released but the newer
    /// token survives for its own speech. Only one reply plays at a time,
    /// so a `Speak` state seen here belongs to the speech ending now. In
    /// any other state the machine has moved on and is left alone.
    pub fn release(&self, token: &TtsToken, reason: &str) -> bool {
        let mut inner = self.lock();
        if inner.tts_token.as_ref() == Some(token) {
            Self::idle(&mut inner, reason);
            true
        } else if inner.state == TurnState::Speak {
            inner.state = TurnState::Idle;
            tracing::info!(
                from = %TurnState::Speak,
                to = %TurnState::Idle,
                reason,
                token = %token,
                turn_id = inner.turn_id,
                "speak lock released, token replaced during speech"
            );
            true
        } else {
            tracing::debug!(reason, token = %token, "release skipped, turn already moved on");
            false
        }
    }

    /// Mint a token for speech outside the regular turn sequence
    ///
    /// Replaces (and so revokes) any token already in flight; a reply
    /// playing under the old token stops at its next frame.
    pub fn mint_tts_token(&self, reason: &str) -> TtsToken {
        let mut inner = self.lock();
        let token = TtsToken::mint();
        inner.tts_token = Some(token.clone());
        tracing::debug!(reason, token = %token, state = %inner.state, "tts token minted");
        token
    }

    /// Whether `token` is the one currently in flight
    #[must_use]
    pub fn authorize(&self, token: Option<&TtsToken>) -> bool {
        let inner = self.lock();
        matches!((token, inner.tts_token.as_ref()), (Some(a), Some(b)) if a == b)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TurnState {
        self.lock().state
    }

    /// Number of turns started so far
    #[must_use]
    pub fn turn_id(&self) -> u64 {
        self.lock().turn_id
    }

    /// Token in flight, if any
    #[must_use]
    pub fn current_token(&self) -> Option<TtsToken> {
        self.lock().tts_token.clone()
    }

    /// Whether the assistant is speaking
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.state() == TurnState::Speak
    }

    /// Whether a turn is in progress
    #[must_use]
    pub fn is_in_turn(&self) -> bool {
        self.state() != TurnState::Idle
    }
}

/// Forces the machine idle when dropped
///
/// Hold one across every speech attempt so that errors, early returns and
/// panics all end the turn.
#[must_use = "the machine is forced idle as soon as the guard is dropped"]
pub struct IdleGuard<'a> {
    machine: &'a TurnStateMachine,
    token: Option<TtsToken>,
    reason: &'static str,
}

impl<'a> IdleGuard<'a> {
    /// Arm a guard that forces `machine` idle unconditionally
    pub const fn new(machine: &'a TurnStateMachine, reason: &'static str) -> Self {
        Self {
            machine,
            token: None,
            reason,
        }
    }

    /// Arm a guard that only ends the turn `token` belongs to
    pub const fn for_token(
        machine: &'a TurnStateMachine,
        token: TtsToken,
        reason: &'static str,
    ) -> Self {
        Self {
            machine,
            token: Some(token),
            reason,
        }
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        match &self.token {
            Some(token) => {
                self.machine.release(token, self.reason);
            }
            None => self.machine.force_idle(self.reason),
        }
    }
}
