//! Response generation: dispatch one user message to the selected backend.
//!
//! The local path builds a model-specific prompt, invokes the engine with the
//! session's fixed sampling parameters, and cleans template markers out of the
//! raw output. The cloud path forwards the raw message. No retries here; the
//! turn controller owns fallback policy.

use crate::engine::{Engine, EngineError, GenOptions};
use crate::llm::{prompt, CloudBackend, CloudError};
use std::sync::Arc;

/// Substituted when local output is empty after cleanup.
pub const EMPTY_REPLY_FALLBACK: &str =
    "Sorry, I could not come up with a response. Please try rephrasing.";

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("local generation failed: {0}")]
    Local(#[source] EngineError),
    #[error("cloud generation failed: {0}")]
    Cloud(#[source] CloudError),
}

/// Which backend answers this turn. A `Local` route can only be built from a
/// live engine handle, so the local-path precondition holds by construction.
pub enum Route {
    Local {
        engine: Arc<dyn Engine>,
        model_id: String,
    },
    Cloud {
        backend: Arc<dyn CloudBackend>,
    },
}

impl Route {
    pub fn is_local(&self) -> bool {
        matches!(self, Route::Local { .. })
    }
}

/// Produce a reply for one user message on the given route.
pub async fn generate_reply(
    route: Route,
    message: String,
    options: GenOptions,
) -> Result<String, GenerateError> {
    match route {
        Route::Local { engine, model_id } => {
            let prompt_text = prompt::build_prompt(&model_id, &message);
            let raw = engine
                .generate(&prompt_text, &options)
                .await
                .map_err(GenerateError::Local)?;
            let cleaned = prompt::clean_response(&raw);
            if cleaned.is_empty() {
                Ok(EMPTY_REPLY_FALLBACK.to_string())
            } else {
                Ok(cleaned)
            }
        }
        Route::Cloud { backend } => backend
            .complete(&message)
            .await
            .map_err(GenerateError::Cloud),
    }
}
