use serde_json::json;

use super::universal::{self, FinishReason, Role, StreamEvent};
use super::*;

fn chat_request(messages: Vec<universal::Message>) -> universal::Request {
	universal::Request {
		model: "test-model".to_string(),
		messages,
		temperature: Some(0.2),
		top_p: None,
		max_tokens: Some(128),
		max_completion_tokens: None,
		stop: None,
		stream: Some(true),
		stream_options: None,
		tools: None,
		tool_choice: None,
		user: None,
		response_format: None,
		response_schema: None,
	}
}

#[test]
fn provider_kind_parses_and_displays() {
	for kind in ProviderKind::ALL {
		assert_eq!(kind.as_str().parse::<ProviderKind>(), Ok(kind));
	}
	assert!("azure".parse::<ProviderKind>().is_err());
}

#[test]
fn openai_chunks_translate_in_order() {
	let mut state = StreamState::default();
	let frames = [
		json!({"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o-mini",
			"choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}),
		json!({"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o-mini",
			"choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}),
		json!({"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o-mini",
			"choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}),
		json!({"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o-mini",
			"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":2,"total_tokens":11}}),
	];
	let mut events = Vec::new();
	for frame in frames {
		let chunk: universal::StreamChunk = serde_json::from_value(frame).unwrap();
		events.extend(openai::translate_chunk(chunk, &mut state));
	}
	assert_eq!(
		events,
		vec![
			StreamEvent::ContentDelta { text: "Hel".into() },
			StreamEvent::ContentDelta { text: "lo".into() },
			StreamEvent::Usage {
				input_tokens: 9,
				output_tokens: 2,
				cached_input_tokens: None
			},
		]
	);
	assert_eq!(state.finish, Some(FinishReason::Stop));
	assert_eq!(state.provider_model.as_deref(), Some("gpt-4o-mini"));
}

#[test]
fn openai_tool_call_deltas_translate() {
	let mut state = StreamState::default();
	let chunk: universal::StreamChunk = serde_json::from_value(json!({
		"id":"c2","object":"chat.completion.chunk","created":1,"model":"gpt-4o",
		"choices":[{"index":0,"delta":{"tool_calls":[
			{"index":0,"id":"call_1","type":"function","function":{"name":"lookup","arguments":"{\"q\":"}}
		]},"finish_reason":null}]
	}))
	.unwrap();
	let events = openai::translate_chunk(chunk, &mut state);
	assert_eq!(
		events,
		vec![StreamEvent::ToolCallDelta {
			index: 0,
			id: Some("call_1".into()),
			name: Some("lookup".into()),
			args_chunk: "{\"q\":".into(),
		}]
	);
}

#[test]
fn anthropic_stream_translates_in_order() {
	let mut state = StreamState::default();
	let mut translator = anthropic::StreamTranslator::default();
	let frames = [
		json!({"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant",
			"content":[],"model":"claude-sonnet-4","stop_reason":null,"stop_sequence":null,
			"usage":{"input_tokens":12,"output_tokens":1}}}),
		json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}),
		json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}),
		json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}),
		json!({"type":"content_block_stop","index":0}),
		json!({"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},
			"usage":{"output_tokens":5}}),
		json!({"type":"message_stop"}),
	];
	let mut events = Vec::new();
	for frame in frames {
		let ev: anthropic::types::MessagesStreamEvent = serde_json::from_value(frame).unwrap();
		events.extend(translator.on_event(ev, &mut state));
	}
	assert_eq!(
		events,
		vec![
			StreamEvent::ContentDelta { text: "Hi".into() },
			StreamEvent::ContentDelta { text: " there".into() },
			StreamEvent::Usage {
				input_tokens: 12,
				output_tokens: 5,
				cached_input_tokens: None
			},
		]
	);
	assert_eq!(state.finish, Some(FinishReason::Stop));
	assert_eq!(state.provider_model.as_deref(), Some("claude-sonnet-4"));
}

#[test]
fn anthropic_request_joins_system_and_defaults_max_tokens() {
	let mut req = chat_request(vec![
		universal::Message::text(Role::System, "be brief"),
		universal::Message::text(Role::System, "be kind"),
		universal::Message::text(Role::User, "hi"),
	]);
	req.max_tokens = None;
	let translated = anthropic::translate_request(&req, None);
	assert_eq!(translated.system.as_deref(), Some("be brief\nbe kind"));
	assert_eq!(translated.messages.len(), 1);
	assert_eq!(translated.max_tokens, 4096);
	assert!(translated.stream);
}

#[test]
fn anthropic_schema_forces_structured_output_tool() {
	let req = chat_request(vec![universal::Message::text(Role::User, "hi")]);
	let schema = json!({"type":"object","required":["x"]});
	let translated = anthropic::translate_request(&req, Some(&schema));
	let tools = translated.tools.unwrap();
	assert_eq!(tools.len(), 1);
	assert_eq!(tools[0].input_schema, schema);
	let choice = translated.tool_choice.unwrap();
	assert_eq!(choice["type"], "tool");
}

#[test]
fn anthropic_response_surfaces_forced_tool_as_content() {
	let body = json!({
		"id":"msg_2","type":"message","role":"assistant","model":"claude-sonnet-4",
		"content":[{"type":"tool_use","id":"tu_1","name":"emit_structured_output","input":{"x":7}}],
		"stop_reason":"tool_use","stop_sequence":null,
		"usage":{"input_tokens":3,"output_tokens":9}
	});
	let completion = anthropic::translate_response(body.to_string().as_bytes()).unwrap();
	assert_eq!(completion.first_content(), Some("{\"x\":7}"));
	assert!(completion.choices[0].message.tool_calls.is_none());
	assert_eq!(completion.usage.unwrap().total_tokens, 12);
}

#[test]
fn bedrock_stream_translates_with_done_state() {
	let mut state = StreamState::default();
	let frames = [
		bedrock::types::ConverseStreamOutput::MessageStart(
			serde_json::from_value(json!({"role":"assistant"})).unwrap(),
		),
		bedrock::types::ConverseStreamOutput::ContentBlockDelta(
			serde_json::from_value(json!({"delta":{"text":"Hey"},"contentBlockIndex":0})).unwrap(),
		),
		bedrock::types::ConverseStreamOutput::MessageStop(
			serde_json::from_value(json!({"stopReason":"end_turn"})).unwrap(),
		),
		bedrock::types::ConverseStreamOutput::Metadata(
			serde_json::from_value(
				json!({"usage":{"inputTokens":4,"outputTokens":2,"totalTokens":6}}),
			)
			.unwrap(),
		),
	];
	let mut events = Vec::new();
	for frame in frames {
		events.extend(bedrock::translate_stream_event(frame, &mut state));
	}
	assert_eq!(
		events,
		vec![
			StreamEvent::ContentDelta { text: "Hey".into() },
			StreamEvent::Usage {
				input_tokens: 4,
				output_tokens: 2,
				cached_input_tokens: None
			},
		]
	);
	assert_eq!(state.finish, Some(FinishReason::Stop));
}

#[test]
fn bedrock_response_translates_tool_use() {
	let body = json!({
		"output":{"message":{"role":"assistant","content":[
			{"text":"checking"},
			{"toolUse":{"toolUseId":"tu_9","name":"lookup","input":{"q":"rust"}}}
		]}},
		"stopReason":"tool_use",
		"usage":{"inputTokens":7,"outputTokens":3,"totalTokens":10}
	});
	let completion = bedrock::translate_response(body.to_string().as_bytes(), "claude-on-bedrock").unwrap();
	assert_eq!(completion.model, "claude-on-bedrock");
	assert_eq!(completion.first_content(), Some("checking"));
	let calls = completion.choices[0].message.tool_calls.as_ref().unwrap();
	assert_eq!(calls[0].function.name, "lookup");
	assert_eq!(
		completion.choices[0].finish_reason,
		Some(FinishReason::ToolCalls)
	);
}

#[test]
fn schema_directive_shapes_per_provider() {
	let schema = json!({"type":"object"});
	let mut req = chat_request(vec![universal::Message::text(Role::User, "hi")]);
	apply_schema_directive(ProviderKind::OpenAI, &mut req, &schema);
	assert_eq!(req.response_format.as_ref().unwrap()["type"], "json_schema");
	let mut req = chat_request(vec![universal::Message::text(Role::User, "hi")]);
	apply_schema_directive(ProviderKind::Ollama, &mut req, &schema);
	assert_eq!(req.response_format.as_ref().unwrap()["type"], "json_object");
}

#[test]
fn backoff_delay_is_bounded_with_jitter() {
	for attempt in 1..=3 {
		let base = 200.0 * 2f64.powi(attempt as i32 - 1);
		for _ in 0..32 {
			let d = backoff_delay(attempt).as_millis() as f64;
			assert!(d >= base * 0.75 - 1.0, "attempt {attempt}: {d} too low");
			assert!(d <= base * 1.25 + 1.0, "attempt {attempt}: {d} too high");
		}
	}
}

#[test]
fn upstream_error_body_parses_openai_and_anthropic_shapes() {
	let openai_err = json!({"error":{"type":"invalid_request_error","message":"bad model"}});
	let parsed: universal::UpstreamErrorResponse = serde_json::from_value(openai_err).unwrap();
	assert_eq!(parsed.error.message, "bad model");
	let anthropic_err =
		json!({"type":"error","error":{"type":"overloaded_error","message":"overloaded"}});
	let parsed: universal::UpstreamErrorResponse = serde_json::from_value(anthropic_err).unwrap();
	assert_eq!(parsed.error.message, "overloaded");
}
