use std::str::FromStr;
use std::time::Duration;

use bytes::BytesMut;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use rand::Rng;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::GatewayError;
use crate::llm::universal::{ChatCompletion, FinishReason, StreamEvent, StreamOptions, Usage};

pub mod anthropic;
pub mod bedrock;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod schema;
#[cfg(test)]
mod tests;
pub mod universal;

const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(120);
const RETRY_BASE: Duration = Duration::from_millis(200);
const RETRY_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
	OpenAI,
	Anthropic,
	Gemini,
	Bedrock,
	Ollama,
}

impl ProviderKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ProviderKind::OpenAI => "openai",
			ProviderKind::Anthropic => "anthropic",
			ProviderKind::Gemini => "gemini",
			ProviderKind::Bedrock => "bedrock",
			ProviderKind::Ollama => "ollama",
		}
	}

	pub const ALL: [ProviderKind; 5] = [
		ProviderKind::OpenAI,
		ProviderKind::Anthropic,
		ProviderKind::Gemini,
		ProviderKind::Bedrock,
		ProviderKind::Ollama,
	];
}

impl std::fmt::Display for ProviderKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ProviderKind {
	type Err = ();
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"openai" => Ok(ProviderKind::OpenAI),
			"anthropic" => Ok(ProviderKind::Anthropic),
			"gemini" => Ok(ProviderKind::Gemini),
			"bedrock" => Ok(ProviderKind::Bedrock),
			"ollama" => Ok(ProviderKind::Ollama),
			_ => Err(()),
		}
	}
}

/// Translation-layer failures inside an adapter.
#[derive(Debug, thiserror::Error)]
pub enum AIError {
	#[error("response was missing fields")]
	IncompleteResponse,
	#[error("unsupported content")]
	UnsupportedContent,
	#[error("failed to marshal request: {0}")]
	RequestMarshal(serde_json::Error),
	#[error("failed to parse response: {0}")]
	ResponseParsing(serde_json::Error),
	#[error("failed to parse stream frame: {0}")]
	FrameParsing(String),
}

impl From<AIError> for GatewayError {
	fn from(e: AIError) -> Self {
		GatewayError::Internal(e.to_string())
	}
}

/// A fully prepared provider call. `request.model` already carries the
/// provider-native name; the credential is plaintext for the duration of the
/// call only.
#[derive(Debug)]
pub struct CallRequest {
	pub request: universal::Request,
	pub credential: Option<String>,
	pub schema: Option<Value>,
}

#[derive(Debug)]
pub struct CallOutcome {
	/// Present for non-streaming calls.
	pub response: Option<ChatCompletion>,
	pub usage: Option<Usage>,
	pub finish: Option<FinishReason>,
	pub provider_model: Option<String>,
	/// Characters of content delivered; the fallback for output-token
	/// estimation when the provider reported no usage.
	pub content_chars: usize,
}

/// One upstream provider: endpoint resolution, wire translation, transport,
/// retry and error normalization. Owns its HTTP client; safe to share.
pub struct Adapter {
	kind: ProviderKind,
	base_url: String,
	api_version: String,
	client: reqwest::Client,
}

impl Adapter {
	pub fn new(
		kind: ProviderKind,
		base_url: Option<String>,
		region: Option<String>,
		api_version: Option<String>,
	) -> Result<Self, GatewayError> {
		let client = reqwest::Client::builder()
			.connect_timeout(Duration::from_secs(10))
			.pool_idle_timeout(Duration::from_secs(90))
			.pool_max_idle_per_host(32)
			.build()
			.map_err(|e| GatewayError::Internal(format!("http client: {e}")))?;
		let base_url = base_url
			.unwrap_or_else(|| default_base_url(kind, region.as_deref()))
			.trim_end_matches('/')
			.to_string();
		Ok(Adapter {
			kind,
			base_url,
			api_version: api_version.unwrap_or_else(|| anthropic::DEFAULT_VERSION.to_string()),
			client,
		})
	}

	pub fn kind(&self) -> ProviderKind {
		self.kind
	}

	fn endpoint(&self, streaming: bool, model: &str) -> String {
		match self.kind {
			ProviderKind::OpenAI => format!("{}{}", self.base_url, openai::CHAT_PATH),
			ProviderKind::Ollama => format!("{}{}", self.base_url, ollama::CHAT_PATH),
			ProviderKind::Gemini => format!("{}{}", self.base_url, gemini::CHAT_PATH),
			ProviderKind::Anthropic => format!("{}{}", self.base_url, anthropic::MESSAGES_PATH),
			ProviderKind::Bedrock => {
				if streaming {
					format!("{}/model/{model}/converse-stream", self.base_url)
				} else {
					format!("{}/model/{model}/converse", self.base_url)
				}
			},
		}
	}

	fn headers(&self, credential: Option<&str>) -> Result<HeaderMap, GatewayError> {
		let mut headers = HeaderMap::new();
		headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
		let Some(cred) = credential else {
			// Only Ollama may run credential-less.
			if self.kind == ProviderKind::Ollama {
				return Ok(headers);
			}
			return Err(GatewayError::ProviderAuth);
		};
		match self.kind {
			ProviderKind::Anthropic => {
				let mut key = HeaderValue::from_str(cred).map_err(|_| GatewayError::ProviderAuth)?;
				key.set_sensitive(true);
				headers.insert("x-api-key", key);
				headers.insert(
					"anthropic-version",
					HeaderValue::from_str(&self.api_version).map_err(|_| GatewayError::ProviderAuth)?,
				);
			},
			_ => {
				let mut bearer = HeaderValue::from_str(&format!("Bearer {cred}"))
					.map_err(|_| GatewayError::ProviderAuth)?;
				bearer.set_sensitive(true);
				headers.insert(AUTHORIZATION, bearer);
			},
		}
		Ok(headers)
	}

	/// Run the call. For streaming calls every translated frame is pushed
	/// into `events` in provider order and `Done` is the final event; the
	/// returned outcome carries whatever usage the stream reported.
	pub async fn execute(
		&self,
		mut call: CallRequest,
		events: Option<mpsc::Sender<StreamEvent>>,
		cancel: &CancellationToken,
	) -> Result<CallOutcome, GatewayError> {
		let streaming = call.request.streaming();
		// Always ask for usage on streams; the gate needs the token counts.
		if streaming && call.request.stream_options.is_none() {
			call.request.stream_options = Some(StreamOptions { include_usage: true });
		}
		let schema = call.schema.take();
		call.request.response_schema = None;
		if let Some(schema) = &schema {
			apply_schema_directive(self.kind, &mut call.request, schema);
		}

		let body: Value = match self.kind {
			ProviderKind::OpenAI | ProviderKind::Gemini | ProviderKind::Ollama => {
				serde_json::to_value(&call.request).map_err(AIError::RequestMarshal)?
			},
			ProviderKind::Anthropic => {
				serde_json::to_value(anthropic::translate_request(&call.request, schema.as_ref()))
					.map_err(AIError::RequestMarshal)?
			},
			ProviderKind::Bedrock => {
				serde_json::to_value(bedrock::translate_request(&call.request, schema.as_ref()))
					.map_err(AIError::RequestMarshal)?
			},
		};

		let url = self.endpoint(streaming, &call.request.model);
		let headers = self.headers(call.credential.as_deref())?;
		// The credential is not needed past this point.
		call.credential = None;

		let resp = self.send_with_retry(&url, headers, &body, cancel).await?;

		if streaming {
			let sink = events.ok_or_else(|| {
				GatewayError::Internal("streaming call without an event sink".to_string())
			})?;
			self.run_stream(resp, sink, cancel).await
		} else {
			let bytes = tokio::select! {
				b = resp.bytes() => b.map_err(|e| GatewayError::Transient(e.to_string()))?,
				_ = cancel.cancelled() => return Err(GatewayError::Cancelled),
			};
			let completion = match self.kind {
				ProviderKind::OpenAI | ProviderKind::Gemini | ProviderKind::Ollama => {
					openai::translate_response(&bytes)?
				},
				ProviderKind::Anthropic => anthropic::translate_response(&bytes)?,
				ProviderKind::Bedrock => bedrock::translate_response(&bytes, &call.request.model)?,
			};
			Ok(CallOutcome {
				usage: completion.usage,
				finish: completion.choices.first().and_then(|c| c.finish_reason),
				provider_model: Some(completion.model.clone()),
				content_chars: completion.first_content().map(str::len).unwrap_or_default(),
				response: Some(completion),
			})
		}
	}

	async fn send_with_retry(
		&self,
		url: &str,
		headers: HeaderMap,
		body: &Value,
		cancel: &CancellationToken,
	) -> Result<reqwest::Response, GatewayError> {
		let mut attempt = 0u32;
		loop {
			attempt += 1;
			let fut = self
				.client
				.post(url)
				.headers(headers.clone())
				.json(body)
				.send();
			let res = tokio::select! {
				r = tokio::time::timeout(FIRST_BYTE_TIMEOUT, fut) => r,
				_ = cancel.cancelled() => return Err(GatewayError::Cancelled),
			};

			let failure = match res {
				Ok(Ok(resp)) => {
					let status = resp.status();
					if status.is_success() {
						return Ok(resp);
					}
					if status == reqwest::StatusCode::UNAUTHORIZED
						|| status == reqwest::StatusCode::FORBIDDEN
					{
						return Err(GatewayError::ProviderAuth);
					}
					if status.is_client_error() {
						let message = upstream_error_message(resp).await;
						return Err(GatewayError::Client {
							status: status.as_u16(),
							message,
						});
					}
					// 5xx: retry, honoring Retry-After when present
					let retry_after = parse_retry_after(resp.headers());
					(format!("upstream returned {status}"), retry_after)
				},
				Ok(Err(e)) => {
					if e.is_builder() {
						return Err(GatewayError::Internal(e.to_string()));
					}
					(e.to_string(), None)
				},
				Err(_) => ("timed out waiting for first byte".to_string(), None),
			};

			let (message, retry_after) = failure;
			if attempt >= RETRY_MAX_ATTEMPTS {
				return Err(GatewayError::Transient(message));
			}
			let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt));
			debug!(provider = %self.kind, attempt, ?delay, "retrying upstream call: {message}");
			tokio::select! {
				_ = tokio::time::sleep(delay) => {},
				_ = cancel.cancelled() => return Err(GatewayError::Cancelled),
			}
		}
	}

	async fn run_stream(
		&self,
		resp: reqwest::Response,
		sink: mpsc::Sender<StreamEvent>,
		cancel: &CancellationToken,
	) -> Result<CallOutcome, GatewayError> {
		let mut state = StreamState::default();

		match self.kind {
			ProviderKind::OpenAI | ProviderKind::Gemini | ProviderKind::Ollama => {
				let mut frames = Box::pin(resp.bytes_stream().eventsource());
				loop {
					let frame = tokio::select! {
						f = frames.next() => f,
						_ = cancel.cancelled() => return Err(GatewayError::Cancelled),
					};
					let Some(frame) = frame else { break };
					let frame = frame.map_err(|e| GatewayError::Transient(e.to_string()))?;
					if frame.data == "[DONE]" {
						break;
					}
					match serde_json::from_str::<universal::StreamChunk>(&frame.data) {
						Ok(chunk) => {
							for ev in openai::translate_chunk(chunk, &mut state) {
								forward(&sink, &mut state, ev).await?;
							}
						},
						Err(e) => debug!("failed to parse streaming frame: {e}"),
					}
				}
			},
			ProviderKind::Anthropic => {
				let mut translator = anthropic::StreamTranslator::default();
				let mut frames = Box::pin(resp.bytes_stream().eventsource());
				loop {
					let frame = tokio::select! {
						f = frames.next() => f,
						_ = cancel.cancelled() => return Err(GatewayError::Cancelled),
					};
					let Some(frame) = frame else { break };
					let frame = frame.map_err(|e| GatewayError::Transient(e.to_string()))?;
					match serde_json::from_str::<anthropic::types::MessagesStreamEvent>(&frame.data) {
						Ok(ev) => {
							for ev in translator.on_event(ev, &mut state) {
								forward(&sink, &mut state, ev).await?;
							}
						},
						Err(e) => debug!("failed to parse streaming frame: {e}"),
					}
				}
			},
			ProviderKind::Bedrock => {
				// Binary event stream: decode frames out of a rolling buffer.
				let mut codec = aws_event_stream_parser::EventStreamCodec;
				let mut buf = BytesMut::new();
				let mut chunks = Box::pin(resp.bytes_stream());
				loop {
					let chunk = tokio::select! {
						c = chunks.next() => c,
						_ = cancel.cancelled() => return Err(GatewayError::Cancelled),
					};
					let Some(chunk) = chunk else { break };
					let chunk = chunk.map_err(|e| GatewayError::Transient(e.to_string()))?;
					buf.extend_from_slice(&chunk);
					loop {
						match codec.decode(&mut buf) {
							Ok(Some(message)) => match bedrock::types::ConverseStreamOutput::deserialize(message) {
								Ok(ev) => {
									for ev in bedrock::translate_stream_event(ev, &mut state) {
										forward(&sink, &mut state, ev).await?;
									}
								},
								Err(e) => debug!("failed to parse streaming frame: {e}"),
							},
							Ok(None) => break,
							Err(e) => return Err(GatewayError::Transient(e.to_string())),
						}
					}
				}
			},
		}

		// Done is always the final event, whatever the provider did last.
		let finish = state.finish.unwrap_or(FinishReason::Stop);
		if sink
			.send(StreamEvent::Done { reason: finish })
			.await
			.is_err()
		{
			return Err(GatewayError::Cancelled);
		}
		Ok(CallOutcome {
			response: None,
			usage: state.usage,
			finish: Some(finish),
			provider_model: state.provider_model,
			content_chars: state.content_chars,
		})
	}
}

/// Accumulated view of a stream: translators record the provider model,
/// finish reason and usage here as frames arrive.
#[derive(Debug, Default)]
pub struct StreamState {
	pub usage: Option<Usage>,
	pub finish: Option<FinishReason>,
	pub provider_model: Option<String>,
	pub content_chars: usize,
}

async fn forward(
	sink: &mpsc::Sender<StreamEvent>,
	state: &mut StreamState,
	ev: StreamEvent,
) -> Result<(), GatewayError> {
	if let StreamEvent::ContentDelta { text } = &ev {
		state.content_chars += text.len();
	}
	if let StreamEvent::Usage {
		input_tokens,
		output_tokens,
		cached_input_tokens,
	} = &ev
	{
		state.usage = Some(Usage {
			prompt_tokens: *input_tokens,
			completion_tokens: *output_tokens,
			total_tokens: input_tokens + output_tokens,
			prompt_tokens_details: cached_input_tokens.map(|c| universal::PromptTokensDetails {
				cached_tokens: Some(c),
			}),
		});
	}
	// A dropped receiver means the client went away; abort the upstream read.
	sink
		.send(ev)
		.await
		.map_err(|_| GatewayError::Cancelled)
}

fn default_base_url(kind: ProviderKind, region: Option<&str>) -> String {
	match kind {
		ProviderKind::OpenAI => openai::DEFAULT_BASE.to_string(),
		ProviderKind::Anthropic => anthropic::DEFAULT_BASE.to_string(),
		ProviderKind::Gemini => gemini::DEFAULT_BASE.to_string(),
		ProviderKind::Bedrock => bedrock::base_url_for_region(region.unwrap_or("us-east-1")),
		ProviderKind::Ollama => ollama::DEFAULT_BASE.to_string(),
	}
}

fn apply_schema_directive(kind: ProviderKind, req: &mut universal::Request, schema: &Value) {
	match kind {
		ProviderKind::OpenAI | ProviderKind::Gemini => {
			req.response_format = Some(serde_json::json!({
				"type": "json_schema",
				"json_schema": {"name": "response", "strict": true, "schema": schema},
			}));
		},
		// Ollama's OpenAI surface only understands json_object mode.
		ProviderKind::Ollama => {
			req.response_format = Some(serde_json::json!({"type": "json_object"}));
		},
		// Anthropic and Bedrock handle the schema during request translation.
		ProviderKind::Anthropic | ProviderKind::Bedrock => {},
	}
}

async fn upstream_error_message(resp: reqwest::Response) -> String {
	let Ok(bytes) = resp.bytes().await else {
		return "upstream rejected the request".to_string();
	};
	if let Ok(parsed) = serde_json::from_slice::<universal::UpstreamErrorResponse>(&bytes) {
		return parsed.error.message;
	}
	String::from_utf8_lossy(&bytes).chars().take(512).collect()
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
	headers
		.get(RETRY_AFTER)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<u64>().ok())
		.map(Duration::from_secs)
}

fn backoff_delay(attempt: u32) -> Duration {
	let base = RETRY_BASE.as_millis() as f64 * 2f64.powi(attempt as i32 - 1);
	let jitter = rand::rng().random_range(0.75..=1.25);
	Duration::from_millis((base * jitter) as u64)
}
