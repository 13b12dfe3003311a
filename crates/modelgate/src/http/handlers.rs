use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::error;

use super::{AppState, DispatchResult, bearer_token, sse};
use crate::auth::AuthContext;
use crate::context::RequestContext;
use crate::dispatch::{Job, ResultHandle};
use crate::error::GatewayError;
use crate::llm::schema::{SchemaValidator, extract_json};
use crate::llm::universal::{self, Message, Role, StreamEvent};
use crate::llm::{Adapter, CallOutcome, CallRequest, ProviderKind};
use crate::policy::{CallReport, Preflight};
use crate::router::Resolved;
use crate::telemetry::metrics::{ProviderLabels, RejectionLabels, RequestLabels};

const STREAM_CHANNEL_DEPTH: usize = 64;

fn reject(state: &AppState, err: GatewayError) -> Response {
	state
		.metrics
		.rejections
		.get_or_create(&RejectionLabels {
			code: err.code().to_string(),
		})
		.inc();
	err.into_response()
}

fn request_context(auth: &AuthContext, headers: &HeaderMap) -> RequestContext {
	let client_ip = headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.map(|v| v.split(',').next().unwrap_or(v).trim().to_string());
	let user_agent = headers
		.get(header::USER_AGENT)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);
	RequestContext::new(&auth.tenant.id, &auth.api_key.id).with_client(client_ip, user_agent)
}

/// Admission pipeline shared by the inference endpoints: authenticate, gate,
/// route, load the provider credential.
struct Admitted {
	auth: AuthContext,
	ctx: RequestContext,
	pre: Preflight,
	resolved: Resolved,
	adapter: Arc<Adapter>,
	credential: Option<String>,
}

async fn admit(
	state: &AppState,
	headers: &HeaderMap,
	req: &universal::Request,
) -> Result<Admitted, GatewayError> {
	let token = bearer_token(headers)?;
	let auth = state.auth.resolve(&token).await?;
	let ctx = request_context(&auth, headers);
	let pre = state.gate.preflight(&auth, req).await?;
	// Past this point the gate holds a reservation; return it on any
	// failure that prevents dispatch.
	let routed = async {
		let resolved = state.routes.resolve(&req.model)?;
		let adapter = state
			.adapters
			.get(&resolved.provider)
			.cloned()
			.ok_or_else(|| GatewayError::ModelNotAvailable(req.model.clone()))?;
		let credential = provider_credential(state, resolved.provider).await?;
		Ok::<_, GatewayError>((resolved, adapter, credential))
	}
	.await;
	let (resolved, adapter, credential) = match routed {
		Ok(routed) => routed,
		Err(e) => {
			state.gate.abort(&auth, pre).await;
			return Err(e);
		},
	};
	Ok(Admitted {
		auth,
		ctx,
		pre,
		resolved,
		adapter,
		credential,
	})
}

/// Stored credentials are ciphertext; they exist in plaintext only for the
/// duration of the call that needs them.
async fn provider_credential(
	state: &AppState,
	provider: ProviderKind,
) -> Result<Option<String>, GatewayError> {
	let Some(blob) = state.store.get_provider_credential(provider).await? else {
		return Ok(None);
	};
	let bytes = state
		.crypto
		.decrypt(&blob)
		.map_err(|_| GatewayError::ProviderAuth)?;
	String::from_utf8(bytes)
		.map(Some)
		.map_err(|_| GatewayError::ProviderAuth)
}

fn submit_call(
	state: &AppState,
	ctx: &RequestContext,
	adapter: Arc<Adapter>,
	call: CallRequest,
	events: Option<mpsc::Sender<StreamEvent>>,
) -> Result<ResultHandle<DispatchResult>, GatewayError> {
	let job: Job<DispatchResult> = Box::new(move |token| {
		Box::pin(async move { adapter.execute(call, events, &token).await })
	});
	state.dispatcher.submit(&ctx.cancel, job)
}

/// Account one finished call (success or failure): metrics, usage record,
/// quota and rate-limit true-up. Passes the outcome through.
async fn finalize(
	state: &AppState,
	auth: &AuthContext,
	pre: Preflight,
	resolved: &Resolved,
	started: Instant,
	outcome: Result<CallOutcome, GatewayError>,
) -> Result<CallOutcome, GatewayError> {
	let latency_ms = started.elapsed().as_millis() as u64;
	let provider = resolved.provider.to_string();
	let (status, error_kind, input_tokens, output_tokens) = match &outcome {
		Ok(out) => {
			let input = out
				.usage
				.map(|u| u.prompt_tokens)
				.unwrap_or(pre.estimated_input_tokens);
			let output = out
				.usage
				.map(|u| u.completion_tokens)
				.unwrap_or((out.content_chars as u64).div_ceil(4));
			("ok".to_string(), None, input, output)
		},
		Err(e) => {
			if matches!(e, GatewayError::ProviderAuth) {
				error!(provider = %provider, "provider credentials rejected upstream");
				state
					.metrics
					.provider_auth_errors
					.get_or_create(&ProviderLabels {
						provider: provider.clone(),
					})
					.inc();
			}
			let status = if matches!(e, GatewayError::Cancelled) {
				"cancelled"
			} else {
				"error"
			};
			(
				status.to_string(),
				Some(e.code().to_string()),
				pre.estimated_input_tokens,
				0,
			)
		},
	};
	state
		.metrics
		.requests
		.get_or_create(&RequestLabels {
			provider: provider.clone(),
			model: resolved.id.clone(),
			status: status.clone(),
		})
		.inc();
	state
		.gate
		.postflight(
			auth,
			pre,
			CallReport {
				provider,
				model: resolved.id.clone(),
				model_config: resolved.config.clone(),
				input_tokens,
				output_tokens,
				latency_ms,
				status,
				error_kind,
			},
		)
		.await;
	outcome
}

pub(super) async fn chat_completions(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<universal::Request>,
) -> Response {
	match chat_impl(state.clone(), headers, req).await {
		Ok(resp) => resp,
		Err(e) => reject(&state, e),
	}
}

async fn chat_impl(
	state: AppState,
	headers: HeaderMap,
	req: universal::Request,
) -> Result<Response, GatewayError> {
	let admitted = admit(&state, &headers, &req).await?;
	let Admitted {
		auth,
		ctx,
		pre,
		resolved,
		adapter,
		credential,
	} = admitted;

	let mut upstream = req;
	upstream.model = resolved.model.clone();
	upstream.response_schema = None;
	let streaming = upstream.streaming();
	let started = Instant::now();

	if streaming {
		let (events_tx, events_rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
		let call = CallRequest {
			request: upstream,
			credential,
			schema: None,
		};
		let handle = match submit_call(&state, &ctx, adapter, call, Some(events_tx)) {
			Ok(handle) => handle,
			Err(e) => {
				state.gate.abort(&auth, pre).await;
				return Err(e);
			},
		};
		let gateway_model = resolved.id.clone();
		// Accounting happens whenever the call settles, client present or not.
		tokio::spawn(async move {
			let outcome = handle.join().await.and_then(|r| r);
			let _ = finalize(&state, &auth, pre, &resolved, started, outcome).await;
		});
		return Ok(sse::response(events_rx, gateway_model));
	}

	let call = CallRequest {
		request: upstream,
		credential,
		schema: None,
	};
	let handle = match submit_call(&state, &ctx, adapter, call, None) {
		Ok(handle) => handle,
		Err(e) => {
			state.gate.abort(&auth, pre).await;
			return Err(e);
		},
	};
	// The spawned task survives client disconnects, so post-flight always runs.
	let task = tokio::spawn(async move {
		let outcome = handle.join().await.and_then(|r| r);
		let outcome = finalize(&state, &auth, pre, &resolved, started, outcome).await?;
		outcome
			.response
			.ok_or_else(|| GatewayError::Internal("provider returned no payload".to_string()))
	});
	let completion = task
		.await
		.map_err(|e| GatewayError::Internal(format!("request task failed: {e}")))??;
	Ok(Json(completion).into_response())
}

pub(super) async fn responses(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<universal::Request>,
) -> Response {
	match responses_impl(state.clone(), headers, req).await {
		Ok(resp) => resp,
		Err(e) => reject(&state, e),
	}
}

async fn responses_impl(
	state: AppState,
	headers: HeaderMap,
	mut req: universal::Request,
) -> Result<Response, GatewayError> {
	let schema = req
		.response_schema
		.take()
		.ok_or_else(|| GatewayError::InvalidRequest("response_schema is required".to_string()))?;
	// Surface a bad schema before admission consumes any allowance.
	SchemaValidator::new(&schema)?;
	// Structured outputs are validated whole; the call is forced non-streaming.
	req.stream = Some(false);

	let admitted = admit(&state, &headers, &req).await?;
	let Admitted {
		auth,
		ctx,
		pre,
		resolved,
		adapter,
		credential,
	} = admitted;

	let mut base = req;
	base.model = resolved.model.clone();
	let started = Instant::now();

	let task = tokio::spawn(async move {
		let mut usage_total = universal::Usage::default();
		let first = execute_structured(
			&state,
			&ctx,
			adapter.clone(),
			base.clone(),
			credential.clone(),
			&schema,
			&mut usage_total,
		)
		.await;
		let outcome = match first {
			Ok((value, errors)) => {
				if let Some(value) = value
					&& errors.is_empty()
				{
					Ok((value, vec![]))
				} else {
					// One repaired retry with the validator output as a hint.
					let mut retry = base.clone();
					retry.messages.push(Message::text(
						Role::System,
						format!(
							"The previous reply was not a valid response ({}). Reply with only a JSON value that satisfies the required schema, nothing else.",
							errors.join("; ")
						),
					));
					execute_structured(
						&state,
						&ctx,
						adapter,
						retry,
						credential,
						&schema,
						&mut usage_total,
					)
					.await
					.map(|(value, errors)| (value.unwrap_or(Value::Null), errors))
				}
			},
			Err(e) => Err(e),
		};

		let latency_ms = started.elapsed().as_millis() as u64;
		let (status, error_kind, result) = match outcome {
			Ok((value, errors)) if errors.is_empty() && !value.is_null() => {
				("ok".to_string(), None, Ok(value))
			},
			Ok((_, errors)) => {
				let errors = if errors.is_empty() {
					vec!["response contained no JSON value".to_string()]
				} else {
					errors
				};
				(
					"error".to_string(),
					Some("schema_validation_failed".to_string()),
					Err(GatewayError::SchemaValidation { errors }),
				)
			},
			Err(e) => ("error".to_string(), Some(e.code().to_string()), Err(e)),
		};

		state
			.metrics
			.requests
			.get_or_create(&RequestLabels {
				provider: resolved.provider.to_string(),
				model: resolved.id.clone(),
				status: status.clone(),
			})
			.inc();
		state
			.gate
			.postflight(
				&auth,
				pre,
				CallReport {
					provider: resolved.provider.to_string(),
					model: resolved.id.clone(),
					model_config: resolved.config.clone(),
					input_tokens: usage_total.prompt_tokens,
					output_tokens: usage_total.completion_tokens,
					latency_ms,
					status,
					error_kind,
				},
			)
			.await;

		let value = result?;
		Ok::<Value, GatewayError>(json!({
			"response": value,
			"model": resolved.id,
			"usage": {
				"prompt_tokens": usage_total.prompt_tokens,
				"completion_tokens": usage_total.completion_tokens,
				"total_tokens": usage_total.prompt_tokens + usage_total.completion_tokens,
			},
		}))
	});
	let body = task
		.await
		.map_err(|e| GatewayError::Internal(format!("request task failed: {e}")))??;
	Ok(Json(body).into_response())
}

/// One structured-output attempt: dispatch, extract, validate. Returns the
/// salvaged value (if any) and its validation errors; usage accumulates into
/// `usage_total` so the final record covers every attempt.
async fn execute_structured(
	state: &AppState,
	ctx: &RequestContext,
	adapter: Arc<Adapter>,
	request: universal::Request,
	credential: Option<String>,
	schema: &Value,
	usage_total: &mut universal::Usage,
) -> Result<(Option<Value>, Vec<String>), GatewayError> {
	let validator = SchemaValidator::new(schema)?;
	let call = CallRequest {
		request,
		credential,
		schema: Some(schema.clone()),
	};
	let handle = submit_call(state, ctx, adapter, call, None)?;
	let outcome = handle.join().await.and_then(|r| r)?;
	if let Some(usage) = outcome.usage {
		usage_total.prompt_tokens += usage.prompt_tokens;
		usage_total.completion_tokens += usage.completion_tokens;
		usage_total.total_tokens += usage.total_tokens;
	}
	let content = outcome
		.response
		.as_ref()
		.and_then(|r| r.first_content())
		.unwrap_or_default();
	let Some(value) = extract_json(content) else {
		return Ok((None, vec!["no JSON value found in response".to_string()]));
	};
	match validator.validate(&value) {
		Ok(()) => Ok((Some(value), vec![])),
		Err(errors) => Ok((Some(value), errors)),
	}
}

pub(super) async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
	match list_models_impl(&state, &headers).await {
		Ok(resp) => resp,
		Err(e) => reject(&state, e),
	}
}

async fn list_models_impl(state: &AppState, headers: &HeaderMap) -> Result<Response, GatewayError> {
	let token = bearer_token(headers)?;
	state.auth.resolve(&token).await?;
	let created = Utc::now().timestamp();
	let data: Vec<Value> = state
		.routes
		.enabled_models()
		.into_iter()
		.map(|(name, cfg)| {
			json!({
				"id": name,
				"object": "model",
				"created": created,
				"owned_by": cfg.provider.as_str(),
			})
		})
		.collect();
	Ok(Json(json!({"object": "list", "data": data})).into_response())
}

pub(super) async fn list_agents(State(state): State<AppState>, headers: HeaderMap) -> Response {
	match list_agents_impl(&state, &headers).await {
		Ok(resp) => resp,
		Err(e) => reject(&state, e),
	}
}

async fn list_agents_impl(state: &AppState, headers: &HeaderMap) -> Result<Response, GatewayError> {
	let token = bearer_token(headers)?;
	let auth = state.auth.resolve(&token).await?;
	let keys = state.store.list_api_keys(&auth.tenant.id).await?;
	// The hash never leaves the store; the prefix is the display handle.
	let data: Vec<Value> = keys
		.into_iter()
		.map(|k| {
			json!({
				"id": k.id,
				"key_prefix": k.key_prefix,
				"role_id": k.role_id,
				"group_id": k.group_id,
				"revoked": k.revoked,
				"created_at": k.created_at,
				"last_used_at": k.last_used_at,
			})
		})
		.collect();
	Ok(Json(json!({"object": "list", "data": data})).into_response())
}

#[derive(Debug, Deserialize)]
pub(super) struct StatsQuery {
	start_time: DateTime<Utc>,
	end_time: DateTime<Utc>,
}

const MAX_STATS_RANGE_DAYS: i64 = 90;

pub(super) async fn dashboard_stats(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<StatsQuery>,
) -> Response {
	match dashboard_stats_impl(&state, &headers, query).await {
		Ok(resp) => resp,
		Err(e) => reject(&state, e),
	}
}

async fn dashboard_stats_impl(
	state: &AppState,
	headers: &HeaderMap,
	query: StatsQuery,
) -> Result<Response, GatewayError> {
	let token = bearer_token(headers)?;
	let auth = state.auth.resolve(&token).await?;
	if query.end_time < query.start_time {
		return Err(GatewayError::InvalidRequest(
			"end_time precedes start_time".to_string(),
		));
	}
	if query.end_time - query.start_time > chrono::Duration::days(MAX_STATS_RANGE_DAYS) {
		return Err(GatewayError::InvalidRequest(format!(
			"time range exceeds {MAX_STATS_RANGE_DAYS} days"
		)));
	}

	let key_id = &auth.api_key.id;
	let usage = state
		.store
		.usage_between(key_id, query.start_time, query.end_time)
		.await?;
	let violations = state
		.store
		.violations_between(key_id, query.start_time, query.end_time)
		.await?;

	let total_requests = usage.len() as u64;
	let total_input: u64 = usage.iter().map(|r| r.input_tokens).sum();
	let total_output: u64 = usage.iter().map(|r| r.output_tokens).sum();
	let total_cost: f64 = usage.iter().map(|r| r.cost_usd).sum();
	let error_count = usage.iter().filter(|r| r.status != "ok").count() as u64;
	let avg_latency_ms = if usage.is_empty() {
		0
	} else {
		usage.iter().map(|r| r.latency_ms).sum::<u64>() / usage.len() as u64
	};

	Ok(
		Json(json!({
			"api_key_id": key_id,
			"start_time": query.start_time,
			"end_time": query.end_time,
			"total_requests": total_requests,
			"total_input_tokens": total_input,
			"total_output_tokens": total_output,
			"total_tokens": total_input + total_output,
			"total_cost_usd": total_cost,
			"avg_latency_ms": avg_latency_ms,
			"error_count": error_count,
			"violation_count": violations.len(),
		}))
		.into_response(),
	)
}

pub(super) async fn metrics(State(state): State<AppState>) -> Response {
	let stats = state.dispatcher.stats();
	state.metrics.queue_depth.set(stats.queued as i64);
	state.metrics.workers.set(stats.workers as i64);
	let mut buf = String::new();
	if let Err(e) = prometheus_client::encoding::text::encode(&mut buf, &state.registry) {
		return GatewayError::Internal(format!("metrics encoding failed: {e}")).into_response();
	}
	(
		[(
			header::CONTENT_TYPE,
			"application/openmetrics-text; version=1.0.0; charset=utf-8",
		)],
		buf,
	)
		.into_response()
}
