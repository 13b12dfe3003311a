//! Ollama exposes an OpenAI-compatible chat surface on its local daemon;
//! translation is shared with the OpenAI adapter. Runs credential-less by
//! default.

pub const DEFAULT_BASE: &str = "http://localhost:11434";
pub const CHAT_PATH: &str = "/v1/chat/completions";
