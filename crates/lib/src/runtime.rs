//! Conversation turn controller: one actor task per session.
//!
//! The task owns the `ChatSession` and is the single cooperative scheduling
//! domain: commands, the in-flight generation, and the in-flight bootstrap
//! interleave through one `select!` loop and never run in parallel. At most
//! one generation and one bootstrap are in flight; extra requests are no-ops.
//! Front-ends talk to the task through a `SessionHandle` and render the event
//! stream.

use crate::agent::{self, GenerateError, Route};
use crate::attachment::PendingAttachment;
use crate::bootstrap::{self, ActiveEngine, BootstrapError, BootstrapProgress};
use crate::config::Config;
use crate::engine::{EngineProvider, GenOptions, LoadPhase};
use crate::history::Turn;
use crate::llm::CloudBackend;
use crate::session::{BackendChoice, ChatSession, CloudSelect, LocalSelect, ModeState};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Commands accepted by a session task.
pub enum Command {
    /// Submit a user message. Ignored while a generation is in flight or when
    /// both the text and the pending attachment are empty.
    Send { text: String },
    Attach(PendingAttachment),
    ClearAttachment,
    SelectBackend(BackendChoice),
    CancelLoad,
    /// Clear the conversation. The front-end must have confirmed with the user.
    ResetHistory,
    State { respond_to: oneshot::Sender<Snapshot> },
    History { respond_to: oneshot::Sender<Vec<Turn>> },
    Shutdown,
}

/// Events emitted toward the front-end.
#[derive(Debug, Clone)]
pub enum Event {
    UserTurn(Turn),
    /// A generation started (typing-indicator hint).
    TurnStarted,
    BotTurn(Turn),
    ModeChanged {
        mode: ModeState,
        model: Option<String>,
    },
    LoadProgress {
        model_id: String,
        phase: Option<LoadPhase>,
        text: String,
        progress: Option<f32>,
    },
    /// Transient, user-visible error notice.
    Notice(String),
    HistoryCleared,
}

/// Point-in-time view of the session for status displays.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub mode: ModeState,
    pub active_model: Option<String>,
    /// Whether the local engine capability was detected at startup; front-ends
    /// disable the local option when false.
    pub local_available: bool,
    pub generating: bool,
    pub loading: bool,
    pub turns: usize,
}

/// Bootstrap and generation knobs, usually read from config.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Candidate model ids, tried in order.
    pub candidates: Vec<String>,
    /// Per-candidate load timeout.
    pub load_timeout: Duration,
    pub gen_options: GenOptions,
}

impl RuntimeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            candidates: config.local.models.clone(),
            load_timeout: Duration::from_secs(config.local.load_timeout_secs),
            gen_options: GenOptions::from_config(&config.local),
        }
    }
}

/// Cheap cloneable handle for driving a session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    fn command(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            log::debug!("session task is gone, command dropped");
        }
    }

    pub fn send(&self, text: impl Into<String>) {
        self.command(Command::Send { text: text.into() });
    }

    pub fn attach(&self, attachment: PendingAttachment) {
        self.command(Command::Attach(attachment));
    }

    pub fn clear_attachment(&self) {
        self.command(Command::ClearAttachment);
    }

    pub fn select_backend(&self, choice: BackendChoice) {
        self.command(Command::SelectBackend(choice));
    }

    pub fn cancel_load(&self) {
        self.command(Command::CancelLoad);
    }

    pub fn reset_history(&self) {
        self.command(Command::ResetHistory);
    }

    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    pub async fn state(&self) -> Option<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::State { respond_to: tx });
        rx.await.ok()
    }

    pub async fn history(&self) -> Vec<Turn> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::History { respond_to: tx });
        rx.await.unwrap_or_default()
    }
}

/// Spawn a session task. Returns the command handle and the event stream.
pub fn spawn_session(
    session: ChatSession,
    cloud: Arc<dyn CloudBackend>,
    provider: Arc<dyn EngineProvider>,
    options: RuntimeOptions,
) -> (SessionHandle, mpsc::UnboundedReceiver<Event>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_session(session, cloud, provider, options, cmd_rx, event_tx));
    (SessionHandle { tx: cmd_tx }, event_rx)
}

type GenFuture = Pin<Box<dyn Future<Output = Result<String, GenerateError>> + Send>>;
type BootFuture = Pin<Box<dyn Future<Output = Result<ActiveEngine, BootstrapError>> + Send>>;

/// Await the in-flight future if there is one; otherwise park forever so the
/// surrounding `select!` only resolves on the other branches.
async fn in_flight<T>(slot: &mut Option<Pin<Box<dyn Future<Output = T> + Send>>>) -> T {
    match slot.as_mut() {
        Some(f) => f.as_mut().await,
        None => std::future::pending().await,
    }
}

fn mode_event(session: &ChatSession) -> Event {
    Event::ModeChanged {
        mode: session.mode(),
        model: session.active_model().map(|s| s.to_string()),
    }
}

async fn run_session(
    mut session: ChatSession,
    cloud: Arc<dyn CloudBackend>,
    provider: Arc<dyn EngineProvider>,
    options: RuntimeOptions,
    mut rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
) {
    // Feature detection, sampled once per session.
    let mut local_available = provider.available().await;
    if !local_available {
        log::info!("local engine capability not detected; local mode disabled");
    }

    let mut gen_fut: Option<GenFuture> = None;
    let mut boot_fut: Option<BootFuture> = None;
    let mut boot_cancel: Option<CancellationToken> = None;

    loop {
        tokio::select! {
            maybe_cmd = rx.recv() => {
                let Some(cmd) = maybe_cmd else { break };
                match cmd {
                    Command::Send { text } => {
                        let Some(prepared) = session.begin_turn(&text) else {
                            continue;
                        };
                        let _ = events.send(Event::UserTurn(prepared.user_turn.clone()));
                        let _ = events.send(Event::TurnStarted);
                        let route = match prepared.local {
                            Some(active) => Route::Local {
                                engine: active.engine,
                                model_id: active.model_id,
                            },
                            None => Route::Cloud { backend: cloud.clone() },
                        };
                        let message = prepared.user_turn.text.clone();
                        gen_fut = Some(Box::pin(agent::generate_reply(
                            route,
                            message,
                            options.gen_options,
                        )));
                    }
                    Command::Attach(attachment) => session.attachment.set(attachment),
                    Command::ClearAttachment => session.attachment.clear(),
                    Command::SelectBackend(BackendChoice::Local) => match session.select_local() {
                        LocalSelect::Noop => {}
                        LocalSelect::Reused => {
                            let _ = events.send(mode_event(&session));
                        }
                        LocalSelect::StartBootstrap => {
                            let _ = events.send(mode_event(&session));
                            let cancel = CancellationToken::new();
                            boot_cancel = Some(cancel.clone());
                            let progress_tx = events.clone();
                            boot_fut = Some(Box::pin(bootstrap::bootstrap(
                                provider.clone(),
                                options.candidates.clone(),
                                options.load_timeout,
                                cancel,
                                move |p: BootstrapProgress| {
                                    let _ = progress_tx.send(Event::LoadProgress {
                                        model_id: p.model_id,
                                        phase: p.phase,
                                        text: p.report.text,
                                        progress: p.report.progress,
                                    });
                                },
                            )));
                        }
                    },
                    Command::SelectBackend(BackendChoice::Cloud) => match session.select_cloud() {
                        CloudSelect::Noop => {}
                        CloudSelect::Switched => {
                            let _ = events.send(mode_event(&session));
                        }
                        CloudSelect::CancelLoad => {
                            if let Some(cancel) = &boot_cancel {
                                cancel.cancel();
                            }
                        }
                    },
                    Command::CancelLoad => {
                        if session.is_loading() {
                            if let Some(cancel) = &boot_cancel {
                                cancel.cancel();
                            }
                        }
                    }
                    Command::ResetHistory => {
                        session.reset();
                        let _ = events.send(Event::HistoryCleared);
                    }
                    Command::State { respond_to } => {
                        let _ = respond_to.send(Snapshot {
                            mode: session.mode(),
                            active_model: session.active_model().map(|s| s.to_string()),
                            local_available,
                            generating: session.is_generating(),
                            loading: session.is_loading(),
                            turns: session.history.len(),
                        });
                    }
                    Command::History { respond_to } => {
                        let _ = respond_to.send(session.history.all().to_vec());
                    }
                    Command::Shutdown => break,
                }
            }
            outcome = in_flight(&mut gen_fut) => {
                gen_fut = None;
                let done = session.finish_turn(outcome);
                let _ = events.send(Event::BotTurn(done.bot_turn));
                if done.cancel_bootstrap {
                    if let Some(cancel) = &boot_cancel {
                        cancel.cancel();
                    }
                }
                if done.downgraded {
                    let _ = events.send(mode_event(&session));
                }
            }
            outcome = in_flight(&mut boot_fut) => {
                boot_fut = None;
                boot_cancel = None;
                match session.finish_bootstrap(outcome) {
                    Ok(model) => {
                        log::info!("local engine ready with model {}", model);
                        let _ = events.send(mode_event(&session));
                    }
                    Err(e) => {
                        if matches!(e, BootstrapError::Unavailable) {
                            local_available = false;
                        }
                        let _ = events.send(Event::Notice(e.to_string()));
                        let _ = events.send(mode_event(&session));
                    }
                }
            }
        }
    }

    log::debug!("session task stopped");
}
