use crate::llm::universal::{ChatCompletion, StreamChunk, StreamEvent};
use crate::llm::{AIError, StreamState};

pub const DEFAULT_BASE: &str = "https://api.openai.com";
pub const CHAT_PATH: &str = "/v1/chat/completions";

pub fn translate_response(bytes: &[u8]) -> Result<ChatCompletion, AIError> {
	serde_json::from_slice::<ChatCompletion>(bytes).map_err(AIError::ResponseParsing)
}

/// Translate one OpenAI-wire streaming chunk into neutral events. Shared by
/// every provider speaking the OpenAI format (OpenAI, Gemini compat, Ollama
/// compat). Finish reasons and usage are recorded on `state`; `Done` is
/// emitted by the stream driver once the native stream ends.
pub fn translate_chunk(chunk: StreamChunk, state: &mut StreamState) -> Vec<StreamEvent> {
	let mut out = Vec::new();
	if state.provider_model.is_none() && !chunk.model.is_empty() {
		state.provider_model = Some(chunk.model.clone());
	}
	for choice in &chunk.choices {
		if let Some(text) = &choice.delta.reasoning_content
			&& !text.is_empty()
		{
			out.push(StreamEvent::Reasoning { text: text.clone() });
		}
		if let Some(text) = &choice.delta.content
			&& !text.is_empty()
		{
			out.push(StreamEvent::ContentDelta { text: text.clone() });
		}
		if let Some(calls) = &choice.delta.tool_calls {
			for call in calls {
				out.push(StreamEvent::ToolCallDelta {
					index: call.index,
					id: call.id.clone(),
					name: call.function.as_ref().and_then(|f| f.name.clone()),
					args_chunk: call
						.function
						.as_ref()
						.and_then(|f| f.arguments.clone())
						.unwrap_or_default(),
				});
			}
		}
		if let Some(reason) = choice.finish_reason {
			state.finish = Some(reason);
		}
	}
	if let Some(usage) = chunk.usage {
		out.push(StreamEvent::Usage {
			input_tokens: usage.prompt_tokens,
			output_tokens: usage.completion_tokens,
			cached_input_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
		});
	}
	out
}
