//! LLM backends: cloud text-generation client, Ollama-served local engine
//! provider, and per-model prompt templating.

mod cloud;
mod ollama;
pub mod prompt;

pub use cloud::{CloudBackend, CloudClient, CloudError};
pub use ollama::OllamaProvider;
