use std::collections::HashMap;

use serde_json::Value;

use crate::llm::universal::{
	self, ChatCompletion, Choice, FinishReason, ResponseMessage, Role, StreamEvent, Usage,
};
use crate::llm::{AIError, StreamState};

pub const DEFAULT_BASE: &str = "https://api.anthropic.com";
pub const MESSAGES_PATH: &str = "/v1/messages";
// https://docs.anthropic.com/en/api/versioning
pub const DEFAULT_VERSION: &str = "2023-06-01";

const DEFAULT_MAX_TOKENS: u64 = 4096;
/// Anthropic has no native force-JSON mode; structured output is a forced
/// tool whose input schema is the caller's schema.
const SCHEMA_TOOL: &str = "emit_structured_output";

pub fn translate_request(req: &universal::Request, schema: Option<&Value>) -> types::MessagesRequest {
	// Anthropic has all system prompts in a single field. Join them.
	let system = req
		.messages
		.iter()
		.filter(|m| matches!(m.role, Role::System | Role::Developer))
		.filter_map(universal::message_text)
		.collect::<Vec<_>>()
		.join("\n");

	let messages = req
		.messages
		.iter()
		.filter(|m| !matches!(m.role, Role::System | Role::Developer))
		.filter_map(|msg| {
			let role = match msg.role {
				Role::Assistant => types::Role::Assistant,
				_ => types::Role::User,
			};
			let mut content = Vec::new();
			if msg.role == Role::Tool {
				// Tool results ride in a user turn.
				content.push(types::ContentBlock::ToolResult {
					tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
					content: universal::message_text(msg).unwrap_or_default().to_string(),
				});
			} else {
				if let Some(text) = universal::message_text(msg) {
					content.push(types::ContentBlock::Text {
						text: text.to_string(),
					});
				}
				for call in msg.tool_calls.iter().flatten() {
					content.push(types::ContentBlock::ToolUse {
						id: call.id.clone(),
						name: call.function.name.clone(),
						input: serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null),
					});
				}
			}
			if content.is_empty() {
				return None;
			}
			Some(types::Message { role, content })
		})
		.collect();

	let mut tools: Vec<types::ToolDef> = req
		.tools
		.iter()
		.flatten()
		.map(|t| types::ToolDef {
			name: t.function.name.clone(),
			description: t.function.description.clone(),
			input_schema: t
				.function
				.parameters
				.clone()
				.unwrap_or_else(|| serde_json::json!({"type": "object"})),
		})
		.collect();

	let mut tool_choice = req.tool_choice.as_ref().and_then(|tc| match tc {
		universal::ToolChoice::Mode(m) => match m.as_str() {
			"auto" => Some(serde_json::json!({"type": "auto"})),
			"required" => Some(serde_json::json!({"type": "any"})),
			_ => None,
		},
		universal::ToolChoice::Named { function, .. } => {
			Some(serde_json::json!({"type": "tool", "name": function.name}))
		},
	});

	if let Some(schema) = schema {
		tools.push(types::ToolDef {
			name: SCHEMA_TOOL.to_string(),
			description: Some("Return the final answer as structured output.".to_string()),
			input_schema: schema.clone(),
		});
		tool_choice = Some(serde_json::json!({"type": "tool", "name": SCHEMA_TOOL}));
	}

	types::MessagesRequest {
		model: req.model.clone(),
		messages,
		system: if system.is_empty() { None } else { Some(system) },
		max_tokens: universal::max_tokens(req).unwrap_or(DEFAULT_MAX_TOKENS),
		stop_sequences: universal::stop_sequences(req),
		stream: req.streaming(),
		temperature: req.temperature,
		top_p: req.top_p,
		tools: if tools.is_empty() { None } else { Some(tools) },
		tool_choice,
	}
}

pub fn translate_response(bytes: &[u8]) -> Result<ChatCompletion, AIError> {
	let resp =
		serde_json::from_slice::<types::MessagesResponse>(bytes).map_err(AIError::ResponseParsing)?;

	let mut content: Option<String> = None;
	let mut reasoning: Option<String> = None;
	let mut tool_calls = Vec::new();
	for block in &resp.content {
		match block {
			types::ContentBlock::Text { text } => {
				content.get_or_insert_default().push_str(text);
			},
			types::ContentBlock::Thinking { thinking } => {
				reasoning.get_or_insert_default().push_str(thinking);
			},
			types::ContentBlock::ToolUse { id, name, input } => {
				if name == SCHEMA_TOOL {
					// The forced structured-output tool: surface its input as content.
					content = serde_json::to_string(input).ok();
				} else {
					tool_calls.push(universal::ToolCall {
						id: id.clone(),
						kind: "function".to_string(),
						function: universal::FunctionCall {
							name: name.clone(),
							arguments: serde_json::to_string(input).unwrap_or_default(),
						},
					});
				}
			},
			types::ContentBlock::ToolResult { .. } => {},
		}
	}

	let usage = Usage {
		prompt_tokens: resp.usage.input_tokens,
		completion_tokens: resp.usage.output_tokens,
		total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
		prompt_tokens_details: resp.usage.cache_read_input_tokens.map(|c| {
			universal::PromptTokensDetails {
				cached_tokens: Some(c),
			}
		}),
	};

	Ok(ChatCompletion {
		id: resp.id,
		object: "chat.completion".to_string(),
		// No date in the anthropic response, so "now".
		created: chrono::Utc::now().timestamp(),
		model: resp.model,
		choices: vec![Choice {
			index: 0,
			message: ResponseMessage {
				role: Role::Assistant,
				content,
				reasoning_content: reasoning,
				tool_calls: if tool_calls.is_empty() {
					None
				} else {
					Some(tool_calls)
				},
			},
			finish_reason: resp.stop_reason.as_ref().map(translate_stop_reason),
		}],
		usage: Some(usage),
		system_fingerprint: None,
	})
}

fn translate_stop_reason(reason: &types::StopReason) -> FinishReason {
	match reason {
		types::StopReason::EndTurn => FinishReason::Stop,
		types::StopReason::MaxTokens => FinishReason::Length,
		types::StopReason::StopSequence => FinishReason::Stop,
		types::StopReason::ToolUse => FinishReason::ToolCalls,
		types::StopReason::Refusal => FinishReason::ContentFilter,
		types::StopReason::Other => FinishReason::Stop,
	}
}

#[derive(Debug, Clone, Copy)]
enum BlockKind {
	Text,
	Thinking,
	Tool { call_index: u32 },
}

/// Translates the Messages stream into neutral events.
/// https://docs.anthropic.com/en/docs/build-with-claude/streaming
#[derive(Default)]
pub struct StreamTranslator {
	input_tokens: u64,
	cached_input_tokens: Option<u64>,
	blocks: HashMap<usize, BlockKind>,
	tool_calls_seen: u32,
}

impl StreamTranslator {
	pub fn on_event(
		&mut self,
		event: types::MessagesStreamEvent,
		state: &mut StreamState,
	) -> Vec<StreamEvent> {
		match event {
			types::MessagesStreamEvent::MessageStart { message } => {
				self.input_tokens = message.usage.input_tokens;
				self.cached_input_tokens = message.usage.cache_read_input_tokens;
				state.provider_model = Some(message.model);
				vec![]
			},
			types::MessagesStreamEvent::ContentBlockStart {
				index,
				content_block,
			} => match content_block {
				types::ContentBlock::Text { .. } => {
					self.blocks.insert(index, BlockKind::Text);
					vec![]
				},
				types::ContentBlock::Thinking { .. } => {
					self.blocks.insert(index, BlockKind::Thinking);
					vec![]
				},
				types::ContentBlock::ToolUse { id, name, .. } => {
					let call_index = self.tool_calls_seen;
					self.tool_calls_seen += 1;
					self.blocks.insert(index, BlockKind::Tool { call_index });
					vec![StreamEvent::ToolCallDelta {
						index: call_index,
						id: Some(id),
						name: Some(name),
						args_chunk: String::new(),
					}]
				},
				types::ContentBlock::ToolResult { .. } => vec![],
			},
			types::MessagesStreamEvent::ContentBlockDelta { index, delta } => match delta {
				types::ContentBlockDelta::TextDelta { text } => {
					vec![StreamEvent::ContentDelta { text }]
				},
				types::ContentBlockDelta::ThinkingDelta { thinking } => {
					vec![StreamEvent::Reasoning { text: thinking }]
				},
				types::ContentBlockDelta::InputJsonDelta { partial_json } => {
					match self.blocks.get(&index) {
						Some(BlockKind::Tool { call_index }) => vec![StreamEvent::ToolCallDelta {
							index: *call_index,
							id: None,
							name: None,
							args_chunk: partial_json,
						}],
						// A forced structured-output tool streams without a
						// preceding tool block we track; treat as content.
						_ => vec![StreamEvent::ContentDelta { text: partial_json }],
					}
				},
				types::ContentBlockDelta::SignatureDelta { .. } => vec![],
			},
			types::MessagesStreamEvent::MessageDelta { delta, usage } => {
				if let Some(reason) = &delta.stop_reason {
					state.finish = Some(translate_stop_reason(reason));
				}
				vec![StreamEvent::Usage {
					input_tokens: self.input_tokens,
					output_tokens: usage.output_tokens,
					cached_input_tokens: self.cached_input_tokens,
				}]
			},
			types::MessagesStreamEvent::ContentBlockStop { .. }
			| types::MessagesStreamEvent::MessageStop
			| types::MessagesStreamEvent::Ping => vec![],
		}
	}
}

pub mod types {
	use serde::{Deserialize, Serialize};
	use serde_json::Value;

	#[derive(Copy, Clone, Deserialize, Serialize, Debug, PartialEq, Eq, Default)]
	#[serde(rename_all = "snake_case")]
	pub enum Role {
		#[default]
		User,
		Assistant,
	}

	#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
	#[serde(rename_all = "snake_case", tag = "type")]
	pub enum ContentBlock {
		Text {
			text: String,
		},
		Thinking {
			thinking: String,
		},
		ToolUse {
			id: String,
			name: String,
			input: Value,
		},
		ToolResult {
			tool_use_id: String,
			content: String,
		},
	}

	#[derive(Clone, Serialize, Debug)]
	pub struct Message {
		pub role: Role,
		pub content: Vec<ContentBlock>,
	}

	#[derive(Clone, Serialize, Debug)]
	pub struct ToolDef {
		pub name: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub description: Option<String>,
		pub input_schema: Value,
	}

	#[derive(Clone, Serialize, Debug)]
	pub struct MessagesRequest {
		pub model: String,
		pub messages: Vec<Message>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub system: Option<String>,
		pub max_tokens: u64,
		#[serde(skip_serializing_if = "Vec::is_empty")]
		pub stop_sequences: Vec<String>,
		#[serde(skip_serializing_if = "std::ops::Not::not")]
		pub stream: bool,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tools: Option<Vec<ToolDef>>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_choice: Option<Value>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct MessagesResponse {
		pub id: String,
		#[serde(rename = "type")]
		pub kind: String,
		#[allow(dead_code)]
		pub role: Role,
		pub content: Vec<ContentBlock>,
		pub model: String,
		pub stop_reason: Option<StopReason>,
		#[allow(dead_code)]
		pub stop_sequence: Option<String>,
		pub usage: Usage,
	}

	#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq)]
	#[serde(rename_all = "snake_case")]
	pub enum StopReason {
		EndTurn,
		MaxTokens,
		StopSequence,
		ToolUse,
		Refusal,
		#[serde(other)]
		Other,
	}

	#[derive(Copy, Clone, Debug, Deserialize, Default)]
	pub struct Usage {
		pub input_tokens: u64,
		pub output_tokens: u64,
		#[serde(default)]
		pub cache_read_input_tokens: Option<u64>,
	}

	#[derive(Clone, Deserialize, Debug)]
	#[serde(rename_all = "snake_case", tag = "type")]
	pub enum MessagesStreamEvent {
		MessageStart {
			message: MessagesResponse,
		},
		ContentBlockStart {
			index: usize,
			content_block: ContentBlock,
		},
		ContentBlockDelta {
			index: usize,
			delta: ContentBlockDelta,
		},
		ContentBlockStop {
			index: usize,
		},
		MessageDelta {
			delta: MessageDelta,
			usage: MessageDeltaUsage,
		},
		MessageStop,
		Ping,
	}

	#[derive(Clone, Deserialize, Debug)]
	#[serde(rename_all = "snake_case", tag = "type")]
	pub enum ContentBlockDelta {
		TextDelta { text: String },
		ThinkingDelta { thinking: String },
		InputJsonDelta { partial_json: String },
		SignatureDelta { signature: String },
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct MessageDelta {
		pub stop_reason: Option<StopReason>,
		#[allow(dead_code)]
		pub stop_sequence: Option<String>,
	}

	#[derive(Copy, Clone, Deserialize, Debug)]
	pub struct MessageDeltaUsage {
		pub output_tokens: u64,
	}
}
