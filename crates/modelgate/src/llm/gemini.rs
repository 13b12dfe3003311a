//! Gemini is driven through its OpenAI compatibility surface, so request and
//! response translation is shared with the OpenAI adapter; only the endpoint
//! differs.

pub const DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com";
pub const CHAT_PATH: &str = "/v1beta/openai/chat/completions";
