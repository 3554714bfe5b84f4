//! Local engine bootstrap: walk the candidate model list in order, enforcing a
//! per-candidate load timeout, forwarding progress, and honoring cooperative
//! cancellation.
//!
//! Failures accumulate per attempt; the terminal error distinguishes an
//! unavailable engine capability, cancellation, every-candidate-timed-out, and
//! the general exhausted case.

use crate::engine::{classify_phase, Engine, EngineProvider, LoadEvent, LoadPhase, ProgressReport};
use futures_util::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A loaded engine plus the model id that actually loaded (the active model).
#[derive(Clone)]
pub struct ActiveEngine {
    pub model_id: String,
    pub engine: Arc<dyn Engine>,
}

impl fmt::Debug for ActiveEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveEngine")
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

/// Progress from an in-flight bootstrap attempt. The phase is a best-effort
/// classification of the raw report text.
#[derive(Debug, Clone)]
pub struct BootstrapProgress {
    pub model_id: String,
    pub phase: Option<LoadPhase>,
    pub report: ProgressReport,
}

/// Why a single candidate attempt did not produce an engine.
#[derive(Debug)]
pub enum AttemptError {
    TimedOut,
    Engine(String),
}

#[derive(Debug)]
pub struct AttemptFailure {
    pub model_id: String,
    pub reason: AttemptError,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            AttemptError::TimedOut => write!(f, "{}: timed out", self.model_id),
            AttemptError::Engine(e) => write!(f, "{}: {}", self.model_id, e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("local engine is unavailable")]
    Unavailable,
    #[error("model load timed out after {} candidate attempt(s)", .attempts.len())]
    Timeout { attempts: Vec<AttemptFailure> },
    #[error("all {} candidate model(s) failed to load", .attempts.len())]
    Exhausted { attempts: Vec<AttemptFailure> },
    #[error("model load cancelled")]
    Cancelled,
}

/// Try candidates in order until one engine comes up. Each attempt gets its own
/// `attempt_timeout`; a timed-out or failed attempt moves on to the next
/// candidate. Cancellation is observed at every suspension point and never
/// lets the next candidate start.
pub async fn bootstrap(
    provider: Arc<dyn EngineProvider>,
    candidates: Vec<String>,
    attempt_timeout: Duration,
    cancel: CancellationToken,
    mut on_progress: impl FnMut(BootstrapProgress),
) -> Result<ActiveEngine, BootstrapError> {
    if !provider.available().await {
        return Err(BootstrapError::Unavailable);
    }

    let mut attempts: Vec<AttemptFailure> = Vec::new();
    for model_id in candidates {
        if cancel.is_cancelled() {
            return Err(BootstrapError::Cancelled);
        }

        log::info!("bootstrap: loading model {}", model_id);
        let mut stream = provider.load(&model_id);
        let deadline = tokio::time::Instant::now() + attempt_timeout;

        let failure = loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BootstrapError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    log::warn!("bootstrap: model {} timed out", model_id);
                    break AttemptError::TimedOut;
                }
                ev = stream.next() => match ev {
                    Some(LoadEvent::Progress(report)) => {
                        on_progress(BootstrapProgress {
                            model_id: model_id.clone(),
                            phase: classify_phase(&report.text),
                            report,
                        });
                    }
                    Some(LoadEvent::Ready(engine)) => {
                        if cancel.is_cancelled() {
                            return Err(BootstrapError::Cancelled);
                        }
                        log::info!("bootstrap: model {} ready", model_id);
                        return Ok(ActiveEngine { model_id, engine });
                    }
                    Some(LoadEvent::Failed(e)) => {
                        log::warn!("bootstrap: model {} failed: {}", model_id, e);
                        break AttemptError::Engine(e.to_string());
                    }
                    None => {
                        break AttemptError::Engine(
                            "load stream ended without a terminal event".to_string(),
                        );
                    }
                }
            }
        };

        attempts.push(AttemptFailure {
            model_id,
            reason: failure,
        });
    }

    if !attempts.is_empty()
        && attempts
            .iter()
            .all(|a| matches!(a.reason, AttemptError::TimedOut))
    {
        Err(BootstrapError::Timeout { attempts })
    } else {
        Err(BootstrapError::Exhausted { attempts })
    }
}
