use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-request data threaded explicitly through every component boundary.
/// Immutable once constructed; cancellation flows through the embedded token.
#[derive(Debug, Clone)]
pub struct RequestContext {
	pub correlation_id: Uuid,
	pub tenant_id: String,
	pub api_key_id: String,
	pub client_ip: Option<String>,
	pub user_agent: Option<String>,
	pub admin: bool,
	pub cancel: CancellationToken,
}

impl RequestContext {
	pub fn new(tenant_id: impl Into<String>, api_key_id: impl Into<String>) -> Self {
		Self {
			correlation_id: Uuid::new_v4(),
			tenant_id: tenant_id.into(),
			api_key_id: api_key_id.into(),
			client_ip: None,
			user_agent: None,
			admin: false,
			cancel: CancellationToken::new(),
		}
	}

	pub fn with_client(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
		self.client_ip = ip;
		self.user_agent = user_agent;
		self
	}
}
