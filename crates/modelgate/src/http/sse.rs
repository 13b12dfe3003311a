use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::llm::universal::{
	Delta, FunctionCallChunk, StreamChoice, StreamChunk, StreamEvent, ToolCallChunk, Usage,
};

/// Wrap a neutral event stream as an OpenAI-compatible SSE response:
/// `data: {chunk}` frames, `data: [DONE]` terminator.
pub(super) fn response(rx: mpsc::Receiver<StreamEvent>, model: String) -> Response {
	let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
	let created = Utc::now().timestamp();
	let stream = ReceiverStream::new(rx)
		.flat_map(move |ev| futures::stream::iter(frames(ev, &id, &model, created)))
		.map(Ok::<String, std::convert::Infallible>);
	Response::builder()
		.header(header::CONTENT_TYPE, "text/event-stream")
		.header(header::CACHE_CONTROL, "no-cache")
		.body(Body::from_stream(stream))
		.expect("static response should build")
}

fn chunk(id: &str, model: &str, created: i64, choices: Vec<StreamChoice>, usage: Option<Usage>) -> StreamChunk {
	StreamChunk {
		id: id.to_string(),
		object: "chat.completion.chunk".to_string(),
		created,
		model: model.to_string(),
		choices,
		usage,
	}
}

fn delta_choice(delta: Delta) -> Vec<StreamChoice> {
	vec![StreamChoice {
		index: 0,
		delta,
		finish_reason: None,
	}]
}

fn frames(ev: StreamEvent, id: &str, model: &str, created: i64) -> Vec<String> {
	let mut out = Vec::with_capacity(2);
	let chunk = match ev {
		StreamEvent::ContentDelta { text } => chunk(
			id,
			model,
			created,
			delta_choice(Delta {
				content: Some(text),
				..Default::default()
			}),
			None,
		),
		StreamEvent::Reasoning { text } => chunk(
			id,
			model,
			created,
			delta_choice(Delta {
				reasoning_content: Some(text),
				..Default::default()
			}),
			None,
		),
		StreamEvent::ToolCallDelta {
			index,
			id: call_id,
			name,
			args_chunk,
		} => {
			let kind = call_id.is_some().then(|| "function".to_string());
			chunk(
				id,
				model,
				created,
				delta_choice(Delta {
					tool_calls: Some(vec![ToolCallChunk {
						index,
						id: call_id,
						kind,
						function: Some(FunctionCallChunk {
							name,
							arguments: Some(args_chunk),
						}),
					}]),
					..Default::default()
				}),
				None,
			)
		},
		StreamEvent::Usage {
			input_tokens,
			output_tokens,
			cached_input_tokens,
		} => chunk(
			id,
			model,
			created,
			vec![],
			Some(Usage {
				prompt_tokens: input_tokens,
				completion_tokens: output_tokens,
				total_tokens: input_tokens + output_tokens,
				prompt_tokens_details: cached_input_tokens.map(|c| {
					crate::llm::universal::PromptTokensDetails {
						cached_tokens: Some(c),
					}
				}),
			}),
		),
		StreamEvent::Done { reason } => {
			let finish = chunk(
				id,
				model,
				created,
				vec![StreamChoice {
					index: 0,
					delta: Delta::default(),
					finish_reason: Some(reason),
				}],
				None,
			);
			if let Ok(json) = serde_json::to_string(&finish) {
				out.push(format!("data: {json}\n\n"));
			}
			out.push("data: [DONE]\n\n".to_string());
			return out;
		},
	};
	if let Ok(json) = serde_json::to_string(&chunk) {
		out.push(format!("data: {json}\n\n"));
	}
	out
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;

	use super::*;
	use crate::llm::universal::FinishReason;

	#[tokio::test]
	async fn events_become_ordered_sse_frames_with_done_terminator() {
		let (tx, rx) = mpsc::channel(8);
		let resp = response(rx, "gpt-4o-mini".to_string());
		assert_eq!(
			resp.headers().get(header::CONTENT_TYPE).unwrap(),
			"text/event-stream"
		);
		for ev in [
			StreamEvent::ContentDelta { text: "Hel".into() },
			StreamEvent::ContentDelta { text: "lo".into() },
			StreamEvent::Usage {
				input_tokens: 3,
				output_tokens: 2,
				cached_input_tokens: None,
			},
			StreamEvent::Done {
				reason: FinishReason::Stop,
			},
		] {
			tx.send(ev).await.unwrap();
		}
		drop(tx);

		let body = resp.into_body().collect().await.unwrap().to_bytes();
		let text = String::from_utf8(body.to_vec()).unwrap();
		let frames: Vec<&str> = text.split("\n\n").filter(|s| !s.is_empty()).collect();
		assert_eq!(frames.len(), 5);
		assert!(frames.iter().all(|f| f.starts_with("data: ")));
		assert_eq!(*frames.last().unwrap(), "data: [DONE]");

		let first: StreamChunk = serde_json::from_str(&frames[0][6..]).unwrap();
		assert_eq!(first.choices[0].delta.content.as_deref(), Some("Hel"));
		assert_eq!(first.object, "chat.completion.chunk");
		let usage: StreamChunk = serde_json::from_str(&frames[2][6..]).unwrap();
		assert_eq!(usage.usage.unwrap().total_tokens, 5);
		let finish: StreamChunk = serde_json::from_str(&frames[3][6..]).unwrap();
		assert_eq!(finish.choices[0].finish_reason, Some(FinishReason::Stop));
	}
}
