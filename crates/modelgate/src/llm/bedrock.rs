use serde_json::Value;

use crate::llm::universal::{
	self, ChatCompletion, Choice, FinishReason, ResponseMessage, Role, StreamEvent, Usage,
};
use crate::llm::{AIError, StreamState};

pub fn base_url_for_region(region: &str) -> String {
	format!("https://bedrock-runtime.{region}.amazonaws.com")
}

pub fn translate_request(req: &universal::Request, schema: Option<&Value>) -> types::ConverseRequest {
	// Bedrock has system prompts in a separate field. Join them.
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
				content.push(types::ContentBlock::ToolResult(types::ToolResultBlock {
					tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
					content: vec![types::ToolResultContentBlock::Text(
						universal::message_text(msg).unwrap_or_default().to_string(),
					)],
				}));
			} else {
				if let Some(text) = universal::message_text(msg) {
					content.push(types::ContentBlock::Text(text.to_string()));
				}
				for call in msg.tool_calls.iter().flatten() {
					content.push(types::ContentBlock::ToolUse(types::ToolUseBlock {
						tool_use_id: call.id.clone(),
						name: call.function.name.clone(),
						input: serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null),
					}));
				}
			}
			if content.is_empty() {
				return None;
			}
			Some(types::Message { role, content })
		})
		.collect();

	let inference_config = types::InferenceConfiguration {
		max_tokens: universal::max_tokens(req),
		temperature: req.temperature,
		top_p: req.top_p,
		stop_sequences: universal::stop_sequences(req),
	};

	let tools: Vec<types::Tool> = req
		.tools
		.iter()
		.flatten()
		.map(|t| {
			types::Tool::ToolSpec(types::ToolSpecification {
				name: t.function.name.clone(),
				description: t.function.description.clone(),
				input_schema: t.function.parameters.clone().map(types::ToolInputSchema::Json),
			})
		})
		.collect();
	let tool_choice = match &req.tool_choice {
		Some(universal::ToolChoice::Named { function, .. }) => Some(types::ToolChoice::Tool {
			name: function.name.clone(),
		}),
		Some(universal::ToolChoice::Mode(m)) if m == "required" => Some(types::ToolChoice::Any),
		Some(universal::ToolChoice::Mode(m)) if m == "auto" => Some(types::ToolChoice::Auto),
		_ => None,
	};
	let tool_config = if tools.is_empty() {
		None
	} else {
		Some(types::ToolConfiguration { tools, tool_choice })
	};

	// The schema rides through the model-specific escape hatch.
	let additional_model_request_fields = schema.map(|s| {
		serde_json::json!({
			"response_format": {"type": "json_schema", "json_schema": {"name": "response", "schema": s}},
		})
	});

	types::ConverseRequest {
		messages,
		system: if system.is_empty() {
			None
		} else {
			Some(vec![types::SystemContentBlock::Text { text: system }])
		},
		inference_config: Some(inference_config),
		tool_config,
		additional_model_request_fields,
	}
}

/// Bedrock responses carry no model name or id; both are synthesized from
/// the request.
pub fn translate_response(bytes: &[u8], model: &str) -> Result<ChatCompletion, AIError> {
	let resp =
		serde_json::from_slice::<types::ConverseResponse>(bytes).map_err(AIError::ResponseParsing)?;
	let output = resp.output.ok_or(AIError::IncompleteResponse)?;
	let message = match output {
		types::ConverseOutput::Message(msg) => msg,
		types::ConverseOutput::Unknown => return Err(AIError::IncompleteResponse),
	};

	let mut content: Option<String> = None;
	let mut tool_calls = Vec::new();
	for block in &message.content {
		match block {
			types::ContentBlock::Text(text) => {
				content.get_or_insert_default().push_str(text);
			},
			types::ContentBlock::ToolUse(tu) => {
				let Ok(args) = serde_json::to_string(&tu.input) else {
					continue;
				};
				tool_calls.push(universal::ToolCall {
					id: tu.tool_use_id.clone(),
					kind: "function".to_string(),
					function: universal::FunctionCall {
						name: tu.name.clone(),
						arguments: args,
					},
				});
			},
			types::ContentBlock::ToolResult(_) => {},
		}
	}

	let usage = resp.usage.map(|u| Usage {
		prompt_tokens: u.input_tokens,
		completion_tokens: u.output_tokens,
		total_tokens: u.total_tokens,
		prompt_tokens_details: None,
	});

	Ok(ChatCompletion {
		id: format!("bedrock-{}", chrono::Utc::now().timestamp_millis()),
		object: "chat.completion".to_string(),
		created: chrono::Utc::now().timestamp(),
		model: model.to_string(),
		choices: vec![Choice {
			index: 0,
			message: ResponseMessage {
				role: Role::Assistant,
				content,
				reasoning_content: None,
				tool_calls: if tool_calls.is_empty() {
					None
				} else {
					Some(tool_calls)
				},
			},
			finish_reason: Some(translate_stop_reason(&resp.stop_reason)),
		}],
		usage,
		system_fingerprint: None,
	})
}

fn translate_stop_reason(reason: &types::StopReason) -> FinishReason {
	match reason {
		types::StopReason::EndTurn => FinishReason::Stop,
		types::StopReason::MaxTokens => FinishReason::Length,
		types::StopReason::StopSequence => FinishReason::Stop,
		types::StopReason::ContentFiltered => FinishReason::ContentFilter,
		types::StopReason::GuardrailIntervened => FinishReason::ContentFilter,
		types::StopReason::ToolUse => FinishReason::ToolCalls,
	}
}

pub fn translate_stream_event(
	event: types::ConverseStreamOutput,
	state: &mut StreamState,
) -> Vec<StreamEvent> {
	match event {
		types::ConverseStreamOutput::MessageStart(_) => vec![],
		types::ConverseStreamOutput::ContentBlockStart(start) => match start.start {
			Some(types::ContentBlockStart::ToolUse(tu)) => vec![StreamEvent::ToolCallDelta {
				index: start.content_block_index as u32,
				id: Some(tu.tool_use_id),
				name: Some(tu.name),
				args_chunk: String::new(),
			}],
			None => vec![],
		},
		types::ConverseStreamOutput::ContentBlockDelta(ev) => match ev.delta {
			Some(types::ContentBlockDelta::Text(text)) => vec![StreamEvent::ContentDelta { text }],
			Some(types::ContentBlockDelta::ToolUse(tu)) => vec![StreamEvent::ToolCallDelta {
				index: ev.content_block_index as u32,
				id: None,
				name: None,
				args_chunk: tu.input,
			}],
			Some(types::ContentBlockDelta::ReasoningContent(rc)) => match rc.text {
				Some(text) => vec![StreamEvent::Reasoning { text }],
				None => vec![],
			},
			None => vec![],
		},
		types::ConverseStreamOutput::ContentBlockStop(_) => vec![],
		types::ConverseStreamOutput::MessageStop(stop) => {
			state.finish = Some(translate_stop_reason(&stop.stop_reason));
			vec![]
		},
		types::ConverseStreamOutput::Metadata(metadata) => match metadata.usage {
			Some(u) => vec![StreamEvent::Usage {
				input_tokens: u.input_tokens,
				output_tokens: u.output_tokens,
				cached_input_tokens: None,
			}],
			None => vec![],
		},
	}
}

pub mod types {
	use serde::{Deserialize, Serialize};
	use serde_json::Value;

	#[derive(Copy, Clone, Deserialize, Serialize, Debug, Default)]
	#[serde(rename_all = "camelCase")]
	pub enum Role {
		#[default]
		User,
		Assistant,
	}

	#[derive(Clone, Deserialize, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub enum ContentBlock {
		Text(String),
		ToolResult(ToolResultBlock),
		ToolUse(ToolUseBlock),
	}

	#[derive(Clone, Deserialize, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolResultBlock {
		pub tool_use_id: String,
		pub content: Vec<ToolResultContentBlock>,
	}

	#[derive(Clone, Deserialize, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub enum ToolResultContentBlock {
		Text(String),
	}

	#[derive(Clone, Deserialize, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolUseBlock {
		pub tool_use_id: String,
		pub name: String,
		pub input: Value,
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct Message {
		pub role: Role,
		pub content: Vec<ContentBlock>,
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub enum SystemContentBlock {
		Text { text: String },
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct InferenceConfiguration {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Vec::is_empty")]
		pub stop_sequences: Vec<String>,
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolSpecification {
		pub name: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub description: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub input_schema: Option<ToolInputSchema>,
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub enum ToolInputSchema {
		Json(Value),
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub enum Tool {
		ToolSpec(ToolSpecification),
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub enum ToolChoice {
		Auto,
		Any,
		Tool { name: String },
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolConfiguration {
		pub tools: Vec<Tool>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_choice: Option<ToolChoice>,
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct ConverseRequest {
		pub messages: Vec<Message>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub system: Option<Vec<SystemContentBlock>>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub inference_config: Option<InferenceConfiguration>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_config: Option<ToolConfiguration>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub additional_model_request_fields: Option<Value>,
	}

	#[derive(Clone, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct ResponseMessage {
		#[allow(dead_code)]
		pub role: Role,
		pub content: Vec<ContentBlock>,
	}

	#[derive(Clone, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub enum ConverseOutput {
		Message(ResponseMessage),
		#[allow(dead_code)]
		Unknown,
	}

	#[derive(Copy, Clone, Debug, Deserialize)]
	#[serde(rename_all = "snake_case")]
	pub enum StopReason {
		EndTurn,
		ToolUse,
		MaxTokens,
		StopSequence,
		GuardrailIntervened,
		ContentFiltered,
	}

	#[derive(Copy, Clone, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct TokenUsage {
		pub input_tokens: u64,
		pub output_tokens: u64,
		pub total_tokens: u64,
	}

	#[derive(Clone, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct ConverseResponse {
		pub output: Option<ConverseOutput>,
		pub stop_reason: StopReason,
		pub usage: Option<TokenUsage>,
	}

	pub enum ConverseStreamOutput {
		ContentBlockDelta(ContentBlockDeltaEvent),
		ContentBlockStart(ContentBlockStartEvent),
		ContentBlockStop(ContentBlockStopEvent),
		MessageStart(MessageStartEvent),
		MessageStop(MessageStopEvent),
		Metadata(ConverseStreamMetadataEvent),
	}

	impl ConverseStreamOutput {
		/// Events arrive on the binary event stream; the `:event-type` header
		/// names the variant and the body is its JSON payload.
		pub fn deserialize(m: aws_event_stream_parser::Message) -> anyhow::Result<Self> {
			let Some(kind) = m
				.headers
				.headers
				.iter()
				.find(|h| h.key.as_str() == ":event-type")
				.and_then(|h| match &h.value {
					aws_event_stream_parser::HeaderValue::String(s) => Some(s.to_string()),
					_ => None,
				})
			else {
				anyhow::bail!("no event type header")
			};
			Ok(match kind.as_str() {
				"contentBlockDelta" => {
					ConverseStreamOutput::ContentBlockDelta(serde_json::from_slice(&m.body)?)
				},
				"contentBlockStart" => {
					ConverseStreamOutput::ContentBlockStart(serde_json::from_slice(&m.body)?)
				},
				"contentBlockStop" => {
					ConverseStreamOutput::ContentBlockStop(serde_json::from_slice(&m.body)?)
				},
				"messageStart" => ConverseStreamOutput::MessageStart(serde_json::from_slice(&m.body)?),
				"messageStop" => ConverseStreamOutput::MessageStop(serde_json::from_slice(&m.body)?),
				"metadata" => ConverseStreamOutput::Metadata(serde_json::from_slice(&m.body)?),
				other => anyhow::bail!("unexpected event type: {other}"),
			})
		}
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ContentBlockDeltaEvent {
		pub delta: Option<ContentBlockDelta>,
		pub content_block_index: i32,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub enum ContentBlockDelta {
		Text(String),
		ToolUse(ToolUseBlockDelta),
		ReasoningContent(ReasoningContentBlockDelta),
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolUseBlockDelta {
		pub input: String,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ReasoningContentBlockDelta {
		#[serde(default)]
		pub text: Option<String>,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ContentBlockStartEvent {
		pub start: Option<ContentBlockStart>,
		pub content_block_index: i32,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub enum ContentBlockStart {
		ToolUse(ToolUseBlockStart),
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolUseBlockStart {
		pub tool_use_id: String,
		pub name: String,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ContentBlockStopEvent {
		#[allow(dead_code)]
		pub content_block_index: i32,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct MessageStartEvent {
		#[allow(dead_code)]
		pub role: Role,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct MessageStopEvent {
		pub stop_reason: StopReason,
		#[serde(default)]
		#[allow(dead_code)]
		pub additional_model_response_fields: Option<Value>,
	}

	#[derive(Clone, Debug, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ConverseStreamMetadataEvent {
		pub usage: Option<TokenUsage>,
	}
}
