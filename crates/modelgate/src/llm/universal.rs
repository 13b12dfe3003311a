use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	System,
	Developer,
	User,
	Assistant,
	Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
	Text(String),
	Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
	pub role: Role,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<Content>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_call_id: Option<String>,
}

impl Message {
	pub fn text(role: Role, content: impl Into<String>) -> Self {
		Message {
			role,
			content: Some(Content::Text(content.into())),
			name: None,
			tool_calls: None,
			tool_call_id: None,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
	pub name: String,
	pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
	#[serde(rename = "type")]
	pub kind: String,
	pub function: FunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
	Mode(String),
	Named {
		#[serde(rename = "type")]
		kind: String,
		function: NamedFunction,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedFunction {
	pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stop {
	One(String),
	Many(Vec<String>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamOptions {
	pub include_usage: bool,
}

/// The neutral request: OpenAI chat-completion shape on the wire, with the
/// structured-output schema rider used by the `/v1/responses` surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	pub model: String,
	pub messages: Vec<Message>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_completion_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop: Option<Stop>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream_options: Option<StreamOptions>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<ToolChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_format: Option<Value>,
	/// JSON Schema (draft-07) the response must validate against.
	/// Accepted on `/v1/responses`; never forwarded upstream verbatim.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_schema: Option<Value>,
}

impl Request {
	pub fn streaming(&self) -> bool {
		self.stream.unwrap_or_default()
	}
}

pub fn max_tokens(req: &Request) -> Option<u64> {
	req.max_completion_tokens.or(req.max_tokens)
}

pub fn stop_sequences(req: &Request) -> Vec<String> {
	match &req.stop {
		Some(Stop::One(s)) => vec![s.clone()],
		Some(Stop::Many(s)) => s.clone(),
		None => vec![],
	}
}

pub fn message_text(msg: &Message) -> Option<&str> {
	match &msg.content {
		Some(Content::Text(t)) => Some(t.as_str()),
		Some(Content::Parts(parts)) => parts.iter().find_map(|p| p.text.as_deref()),
		None => None,
	}
}

/// Concatenation of user-role message contents, the input to prompt filters.
pub fn user_prompt_text(req: &Request) -> String {
	req
		.messages
		.iter()
		.filter(|m| m.role == Role::User)
		.filter_map(message_text)
		.collect::<Vec<_>>()
		.join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
	Stop,
	Length,
	ToolCalls,
	ContentFilter,
	Error,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub total_tokens: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PromptTokensDetails {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cached_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
	pub role: Role,
	#[serde(default)]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reasoning_content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
	pub index: u32,
	pub message: ResponseMessage,
	#[serde(default)]
	pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
	pub id: String,
	pub object: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<Choice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub system_fingerprint: Option<String>,
}

impl ChatCompletion {
	pub fn first_content(&self) -> Option<&str> {
		self.choices.first().and_then(|c| c.message.content.as_deref())
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<Role>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reasoning_content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallChunk {
	pub index: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function: Option<FunctionCallChunk>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCallChunk {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub arguments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
	pub index: u32,
	pub delta: Delta,
	#[serde(default)]
	pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
	pub id: String,
	pub object: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<StreamChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

/// Provider-agnostic streaming frame. Adapters translate each native frame
/// into one of these without buffering beyond a single frame; `Done` is
/// always the last event of a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
	ContentDelta {
		text: String,
	},
	ToolCallDelta {
		index: u32,
		id: Option<String>,
		name: Option<String>,
		args_chunk: String,
	},
	Reasoning {
		text: String,
	},
	Usage {
		input_tokens: u64,
		output_tokens: u64,
		cached_input_tokens: Option<u64>,
	},
	Done {
		reason: FinishReason,
	},
}

/// Error body shape the OpenAI family returns; adapters normalize into this
/// before the gateway maps it onto its own taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamErrorResponse {
	pub error: UpstreamError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamError {
	#[serde(default, rename = "type")]
	pub kind: Option<String>,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}
