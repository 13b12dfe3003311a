use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use prometheus_client::registry::Registry;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::auth::AuthResolver;
use crate::crypto::EncryptionService;
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::llm::{Adapter, CallOutcome, ProviderKind};
use crate::policy::PolicyGate;
use crate::router::RouteTable;
use crate::store::Store;
use crate::telemetry::Metrics;

mod handlers;
mod sse;

/// What a dispatched work item resolves to.
pub type DispatchResult = Result<CallOutcome, GatewayError>;

#[derive(Clone)]
pub struct AppState {
	pub auth: Arc<AuthResolver>,
	pub gate: Arc<PolicyGate>,
	pub routes: Arc<RouteTable>,
	pub dispatcher: Arc<Dispatcher<DispatchResult>>,
	pub adapters: Arc<HashMap<ProviderKind, Arc<Adapter>>>,
	pub store: Arc<dyn Store>,
	pub crypto: Arc<EncryptionService>,
	pub metrics: Arc<Metrics>,
	pub registry: Arc<Registry>,
}

pub fn api_router(state: AppState) -> Router {
	Router::new()
		.route("/v1/chat/completions", post(handlers::chat_completions))
		.route("/v1/responses", post(handlers::responses))
		.route("/v1/models", get(handlers::list_models))
		.route("/v1/agents/list", get(handlers::list_agents))
		.route("/v1/agents/dashboard/stats", get(handlers::dashboard_stats))
		.with_state(state)
}

/// The metrics surface binds separately; authentication is bind-scoped.
pub fn metrics_router(state: AppState) -> Router {
	Router::new()
		.route("/metrics", get(handlers::metrics))
		.with_state(state)
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<String, GatewayError> {
	let value = headers
		.get(header::AUTHORIZATION)
		.ok_or(GatewayError::Unauthenticated)?;
	let value = value.to_str().map_err(|_| GatewayError::Unauthenticated)?;
	let token = value
		.strip_prefix("Bearer ")
		.or_else(|| value.strip_prefix("bearer "))
		.ok_or(GatewayError::Unauthenticated)?;
	if token.is_empty() {
		return Err(GatewayError::Unauthenticated);
	}
	Ok(token.to_string())
}

fn error_body(code: &str, message: String, category: Option<&str>) -> serde_json::Value {
	let mut error = json!({"code": code, "message": message});
	if let Some(category) = category {
		error["category"] = json!(category);
	}
	json!({"error": error})
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		let code = self.code();
		let (status, body, retry_after) = match &self {
			GatewayError::Unauthenticated => (
				StatusCode::UNAUTHORIZED,
				error_body(code, self.to_string(), None),
				None,
			),
			GatewayError::Forbidden => (
				StatusCode::FORBIDDEN,
				error_body(code, self.to_string(), None),
				None,
			),
			GatewayError::PolicyBlocked { category, .. } => (
				StatusCode::FORBIDDEN,
				error_body(code, self.to_string(), Some(category)),
				None,
			),
			GatewayError::RateLimited { retry_after, .. } => {
				let secs = retry_after.as_secs().max(1);
				(
					StatusCode::TOO_MANY_REQUESTS,
					error_body(code, self.to_string(), None),
					Some(secs),
				)
			},
			GatewayError::QuotaExceeded { .. } => (
				StatusCode::TOO_MANY_REQUESTS,
				error_body(code, self.to_string(), None),
				None,
			),
			GatewayError::ModelNotAvailable(_) | GatewayError::InvalidRequest(_) => (
				StatusCode::BAD_REQUEST,
				error_body(code, self.to_string(), None),
				None,
			),
			GatewayError::QueueFull => (
				StatusCode::SERVICE_UNAVAILABLE,
				error_body(code, self.to_string(), None),
				Some(1),
			),
			GatewayError::Cancelled => (
				// Client closed request; nginx's 499 is the convention.
				StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
				error_body(code, self.to_string(), None),
				None,
			),
			GatewayError::Transient(_) => (
				StatusCode::BAD_GATEWAY,
				error_body(code, self.to_string(), None),
				None,
			),
			GatewayError::Client { status, message } => (
				StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
				error_body(code, message.clone(), None),
				None,
			),
			GatewayError::ProviderAuth => (
				StatusCode::BAD_GATEWAY,
				error_body(code, self.to_string(), None),
				None,
			),
			GatewayError::SchemaValidation { errors } => (
				StatusCode::UNPROCESSABLE_ENTITY,
				json!({"error": {"code": code, "message": self.to_string(), "errors": errors}}),
				None,
			),
			GatewayError::Store(_) | GatewayError::Internal(_) => {
				let correlation_id = Uuid::new_v4();
				error!(%correlation_id, "internal error: {self}");
				(
					StatusCode::INTERNAL_SERVER_ERROR,
					error_body(code, format!("internal error; correlation id {correlation_id}"), None),
					None,
				)
			},
		};
		let mut resp = (status, axum::Json(body)).into_response();
		if let Some(secs) = retry_after
			&& let Ok(v) = axum::http::HeaderValue::from_str(&secs.to_string())
		{
			resp.headers_mut().insert(header::RETRY_AFTER, v);
		}
		resp
	}
}
