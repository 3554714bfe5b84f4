//! Conversation session state: the backend selector state machine, history,
//! pending attachment, engine slot, and the two in-flight locks.
//!
//! `ChatSession` is the single authority for which backend answers the next
//! message. It is driven by the runtime task and never touches the network
//! itself; bootstrap and generation results are fed back in through the
//! `finish_*` methods. Invariant: the mode is never `LocalReady` without an
//! engine handle.

use crate::agent::GenerateError;
use crate::attachment::AttachmentStore;
use crate::bootstrap::{ActiveEngine, BootstrapError};
use crate::history::{HistoryStore, Turn};

/// Apology appended when the cloud path fails.
pub const CLOUD_APOLOGY: &str = "Sorry, a connection error occurred. Please try again.";

/// Apology appended when the local path fails (the session also downgrades).
pub const LOCAL_APOLOGY: &str =
    "Sorry, the local model ran into a problem. Switching back to cloud mode.";

/// Which backend answers the next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    Cloud,
    LocalLoading,
    LocalReady,
}

impl ModeState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::LocalLoading => "local-loading",
            Self::LocalReady => "local-ready",
        }
    }
}

impl std::fmt::Display for ModeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// User-facing selector value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Cloud,
    Local,
}

/// Outcome of selecting the local backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSelect {
    /// Already ready, or a load is already in flight (idempotent wait).
    Noop,
    /// A previously loaded engine was reattached without a bootstrap.
    Reused,
    /// The caller must start a bootstrap.
    StartBootstrap,
}

/// Outcome of selecting the cloud backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudSelect {
    Noop,
    Switched,
    /// A load was in flight; the caller must cancel it. The mode settles to
    /// `Cloud` when the cancelled bootstrap resolves.
    CancelLoad,
}

/// A user turn accepted for processing: what to show/persist, and the engine
/// to use when the local path was selected (`None` means cloud).
pub struct PreparedTurn {
    pub user_turn: Turn,
    pub local: Option<ActiveEngine>,
}

/// What the controller should do after a turn settles.
pub struct TurnCompletion {
    pub bot_turn: Turn,
    /// The selector was reverted to cloud.
    pub downgraded: bool,
    /// A bootstrap was in flight and must be cancelled.
    pub cancel_bootstrap: bool,
}

pub struct ChatSession {
    mode: ModeState,
    engine: Option<ActiveEngine>,
    pub history: HistoryStore,
    pub attachment: AttachmentStore,
    generating: bool,
    loading: bool,
}

impl ChatSession {
    pub fn new(history: HistoryStore) -> Self {
        Self {
            mode: ModeState::Cloud,
            engine: None,
            history,
            attachment: AttachmentStore::new(),
            generating: false,
            loading: false,
        }
    }

    pub fn mode(&self) -> ModeState {
        self.mode
    }

    /// Model id of the engine that actually loaded, while one is held.
    pub fn active_model(&self) -> Option<&str> {
        self.engine.as_ref().map(|a| a.model_id.as_str())
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Accept a user message for processing. Returns `None` (a no-op for the
    /// caller) when a generation is already in flight, or when both the text
    /// and the pending attachment are empty. Otherwise captures the pending
    /// attachment, appends the user turn, and takes the generation lock.
    pub fn begin_turn(&mut self, text: &str) -> Option<PreparedTurn> {
        if self.generating {
            log::debug!("send ignored: a generation is already in flight");
            return None;
        }
        let text = text.trim();
        if text.is_empty() && self.attachment.pending().is_none() {
            return None;
        }

        let attachment = self.attachment.take();
        let user_turn = Turn::user(text, attachment.map(|a| a.data_uri));
        self.history.append(user_turn.clone());
        self.generating = true;

        let local = if self.mode == ModeState::LocalReady {
            self.engine.clone()
        } else {
            None
        };
        Some(PreparedTurn { user_turn, local })
    }

    /// Settle a turn: append the bot reply or a mode-specific apology, apply
    /// the downgrade rules, and release the generation lock.
    pub fn finish_turn(&mut self, outcome: Result<String, GenerateError>) -> TurnCompletion {
        self.generating = false;

        let (bot_turn, downgraded, cancel_bootstrap) = match outcome {
            Ok(text) => (Turn::bot(text), false, false),
            Err(GenerateError::Local(e)) => {
                log::warn!("local generation failed: {}", e);
                // Discard the handle so a future local selection restarts the bootstrap.
                self.engine = None;
                self.mode = ModeState::Cloud;
                (Turn::bot(LOCAL_APOLOGY), true, false)
            }
            Err(GenerateError::Cloud(e)) => {
                log::warn!("cloud generation failed: {}", e);
                let was_loading = self.mode == ModeState::LocalLoading;
                let downgraded = self.mode != ModeState::Cloud;
                if downgraded {
                    // Same contract as a local failure: re-entering local mode
                    // must go back through the bootstrap.
                    self.engine = None;
                }
                self.mode = ModeState::Cloud;
                (Turn::bot(CLOUD_APOLOGY), downgraded, was_loading)
            }
        };

        self.history.append(bot_turn.clone());
        TurnCompletion {
            bot_turn,
            downgraded,
            cancel_bootstrap,
        }
    }

    pub fn select_local(&mut self) -> LocalSelect {
        match self.mode {
            ModeState::LocalReady | ModeState::LocalLoading => LocalSelect::Noop,
            ModeState::Cloud => {
                if self.engine.is_some() {
                    self.mode = ModeState::LocalReady;
                    LocalSelect::Reused
                } else {
                    self.mode = ModeState::LocalLoading;
                    self.loading = true;
                    LocalSelect::StartBootstrap
                }
            }
        }
    }

    pub fn select_cloud(&mut self) -> CloudSelect {
        match self.mode {
            ModeState::Cloud => CloudSelect::Noop,
            ModeState::LocalReady => {
                // Engine handle retained for possible reuse.
                self.mode = ModeState::Cloud;
                CloudSelect::Switched
            }
            ModeState::LocalLoading => CloudSelect::CancelLoad,
        }
    }

    /// Settle a bootstrap. On success records the engine and enters
    /// `LocalReady`; on any failure (including cancellation) reverts to
    /// `Cloud` with the partial handle discarded. Returns the active model id
    /// or the error for the caller to surface.
    pub fn finish_bootstrap(
        &mut self,
        outcome: Result<ActiveEngine, BootstrapError>,
    ) -> Result<String, BootstrapError> {
        self.loading = false;
        match outcome {
            Ok(active) => {
                let model_id = active.model_id.clone();
                self.engine = Some(active);
                self.mode = ModeState::LocalReady;
                Ok(model_id)
            }
            Err(e) => {
                self.engine = None;
                self.mode = ModeState::Cloud;
                Err(e)
            }
        }
    }

    /// Clear history and any pending attachment. Caller must have confirmed.
    pub fn reset(&mut self) {
        self.history.reset();
        self.attachment.clear();
    }
}
