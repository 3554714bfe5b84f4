//! Local inference engine abstraction.
//!
//! A provider loads a model as a lazy, finite stream of progress reports
//! terminated by exactly one `Ready` or `Failed` event, and hands back an
//! engine that generates completions with fixed sampling parameters. Free-text
//! progress reports can be classified into coarse display phases; the
//! classification is best-effort and never gates load success.

use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine load failed: {0}")]
    Load(String),
    #[error("engine generation failed: {0}")]
    Generate(String),
}

/// Fixed, non-adaptive generation parameters.
#[derive(Debug, Clone, Copy)]
pub struct GenOptions {
    pub max_length: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl GenOptions {
    pub fn from_config(local: &crate::config::LocalConfig) -> Self {
        Self {
            max_length: local.max_gen_length,
            temperature: local.temperature,
            top_p: local.top_p,
        }
    }
}

/// One free-text progress report from an engine load, with an optional
/// 0..=1 completion fraction.
#[derive(Debug, Clone)]
pub struct ProgressReport {
    pub text: String,
    pub progress: Option<f32>,
}

/// Item of a load stream: zero or more `Progress` reports, then exactly one
/// `Ready` or `Failed`, then end of stream.
pub enum LoadEvent {
    Progress(ProgressReport),
    Ready(Arc<dyn Engine>),
    Failed(EngineError),
}

pub type LoadStream = Pin<Box<dyn Stream<Item = LoadEvent> + Send>>;

/// A loaded model able to produce completions.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenOptions) -> Result<String, EngineError>;
}

/// Acquires engines for model ids.
#[async_trait]
pub trait EngineProvider: Send + Sync {
    /// Feature detection: whether the engine capability exists at all. A false
    /// result lets callers skip the load entirely instead of burning the
    /// timeout budget.
    async fn available(&self) -> bool;

    /// Begin loading the given model. The returned stream follows the
    /// `LoadEvent` contract.
    fn load(&self, model_id: &str) -> LoadStream;
}

/// Coarse user-facing load phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Fetching,
    LoadingIntoMemory,
    Initializing,
    LoadingWeights,
    PreparingCache,
    Ready,
}

impl LoadPhase {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Fetching => "downloading model",
            Self::LoadingIntoMemory => "loading into memory",
            Self::Initializing => "initializing",
            Self::LoadingWeights => "loading weights",
            Self::PreparingCache => "preparing cache",
            Self::Ready => "ready",
        }
    }
}

/// Map a free-text progress report onto a coarse phase by keyword. Returns
/// None when nothing matches; callers keep the previous phase in that case.
pub fn classify_phase(text: &str) -> Option<LoadPhase> {
    let t = text.to_ascii_lowercase();
    if t.contains("ready") || t.contains("complete") || t.contains("success") {
        Some(LoadPhase::Ready)
    } else if t.contains("weight") {
        Some(LoadPhase::LoadingWeights)
    } else if t.contains("cache") || t.contains("verify") {
        Some(LoadPhase::PreparingCache)
    } else if t.contains("fetch") || t.contains("download") || t.contains("pull") {
        Some(LoadPhase::Fetching)
    } else if t.contains("init") {
        Some(LoadPhase::Initializing)
    } else if t.contains("load") {
        Some(LoadPhase::LoadingIntoMemory)
    } else {
        None
    }
}
