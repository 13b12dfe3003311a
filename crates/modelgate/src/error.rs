use std::time::Duration;

use crate::store::StoreError;

/// Top-level error taxonomy. Every failure a request can hit maps to exactly
/// one of these kinds; the HTTP layer owns the status/body translation.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
	#[error("authentication failed")]
	Unauthenticated,
	#[error("access denied")]
	Forbidden,
	#[error("request blocked by policy: {category}")]
	PolicyBlocked {
		category: String,
		severity: String,
		rule: String,
	},
	#[error("rate limit exceeded for {scope}")]
	RateLimited { scope: String, retry_after: Duration },
	#[error("quota exceeded: {dimension}")]
	QuotaExceeded { dimension: String },
	#[error("model not available: {0}")]
	ModelNotAvailable(String),
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("dispatch queue is full")]
	QueueFull,
	#[error("request cancelled")]
	Cancelled,
	#[error("upstream transient failure: {0}")]
	Transient(String),
	#[error("upstream rejected request: {message}")]
	Client { status: u16, message: String },
	#[error("provider credentials rejected upstream")]
	ProviderAuth,
	#[error("response did not match the requested schema")]
	SchemaValidation { errors: Vec<String> },
	#[error("store failure: {0}")]
	Store(#[from] StoreError),
	#[error("internal error: {0}")]
	Internal(String),
}

impl GatewayError {
	/// Stable machine-readable code, used in response bodies and metrics labels.
	pub fn code(&self) -> &'static str {
		match self {
			GatewayError::Unauthenticated => "unauthenticated",
			GatewayError::Forbidden => "forbidden",
			GatewayError::PolicyBlocked { .. } => "policy_blocked",
			GatewayError::RateLimited { .. } => "rate_limited",
			GatewayError::QuotaExceeded { .. } => "quota_exceeded",
			GatewayError::ModelNotAvailable(_) => "model_not_available",
			GatewayError::InvalidRequest(_) => "invalid_request",
			GatewayError::QueueFull => "queue_full",
			GatewayError::Cancelled => "cancelled",
			GatewayError::Transient(_) => "upstream_unavailable",
			GatewayError::Client { .. } => "upstream_rejected",
			GatewayError::ProviderAuth => "provider_misconfigured",
			GatewayError::SchemaValidation { .. } => "schema_validation_failed",
			GatewayError::Store(_) => "internal_error",
			GatewayError::Internal(_) => "internal_error",
		}
	}

	/// Whether the post-flight recorder should treat this as a provider-side error.
	pub fn error_kind(&self) -> &'static str {
		self.code()
	}
}
