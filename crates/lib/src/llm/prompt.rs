//! Per-model prompt templates and raw-output cleanup for the local path.
//!
//! Templates are keyed on the model identifier; an unmatched identifier falls
//! back to a generic instruction-style template. Cleanup strips every token of
//! the known template vocabulary and trims whitespace; picking the right turn
//! boundary is the template's job, the cleanup is deliberately blunt.

const SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer concisely and helpfully.";

/// Template vocabulary stripped from raw model output.
const CONTROL_TOKENS: &[&str] = &[
    "<|system|>",
    "<|user|>",
    "<|assistant|>",
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
    "<s>",
    "</s>",
    "[INST]",
    "[/INST]",
    "<<SYS>>",
    "<</SYS>>",
    "### Instruction:",
    "### Response:",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateFamily {
    Zephyr,
    ChatMl,
    Llama,
    Generic,
}

fn family_for(model_id: &str) -> TemplateFamily {
    let id = model_id.to_ascii_lowercase();
    // tinyllama ships the zephyr chat format; check it before the llama family.
    if id.contains("tinyllama") || id.contains("zephyr") || id.contains("stablelm") {
        TemplateFamily::Zephyr
    } else if id.contains("qwen") || id.contains("hermes") || id.contains("phi") {
        TemplateFamily::ChatMl
    } else if id.contains("llama") || id.contains("mistral") {
        TemplateFamily::Llama
    } else {
        TemplateFamily::Generic
    }
}

/// Build the model-specific prompt for a single user message.
pub fn build_prompt(model_id: &str, message: &str) -> String {
    match family_for(model_id) {
        TemplateFamily::Zephyr => format!(
            "<|system|>\n{}\n<|user|>\n{}\n<|assistant|>\n",
            SYSTEM_PROMPT, message
        ),
        TemplateFamily::ChatMl => format!(
            "<|im_start|>system\n{}<|im_end|>\n<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
            SYSTEM_PROMPT, message
        ),
        TemplateFamily::Llama => format!(
            "[INST] <<SYS>>\n{}\n<</SYS>>\n\n{} [/INST]",
            SYSTEM_PROMPT, message
        ),
        TemplateFamily::Generic => format!(
            "{}\n\n### Instruction:\n{}\n\n### Response:\n",
            SYSTEM_PROMPT, message
        ),
    }
}

/// Strip template control tokens from raw output and trim whitespace. An empty
/// result is the caller's cue to substitute a fallback reply.
pub fn clean_response(raw: &str) -> String {
    let mut out = raw.to_string();
    for token in CONTROL_TOKENS {
        if out.contains(token) {
            out = out.replace(token, "");
        }
    }
    out.trim().to_string()
}
