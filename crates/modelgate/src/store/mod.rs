use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::ProviderKind;

mod memory;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("not found: {0}")]
	NotFound(String),
	#[error("store backend failure: {0}")]
	Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
	Active,
	Suspended,
}

/// Long-horizon usage counters and their per-period ceilings. A limit of
/// zero disables that dimension. Counters only grow within a period.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quotas {
	pub requests_used: u64,
	pub tokens_used: u64,
	pub cost_used_usd: f64,
	#[serde(default)]
	pub max_requests: u64,
	#[serde(default)]
	pub max_tokens: u64,
	#[serde(default)]
	pub max_cost_usd: f64,
	pub period_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
	pub id: String,
	pub status: TenantStatus,
	pub tier: String,
	pub quotas: Quotas,
	/// Ordered; earlier rules are evaluated first.
	#[serde(default)]
	pub policy_ids: Vec<String>,
	/// Per-minute request allowance for keys of this tenant.
	#[serde(default = "default_rpm")]
	pub requests_per_minute: u64,
	/// Per-minute token allowance for keys of this tenant.
	#[serde(default = "default_tpm")]
	pub tokens_per_minute: u64,
}

fn default_rpm() -> u64 {
	60
}
fn default_tpm() -> u64 {
	100_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
	pub id: String,
	pub tenant_id: String,
	/// Lowercase hex SHA-256 of the raw credential. The raw key is never stored.
	pub key_hash: String,
	/// First characters of the raw key, for display.
	pub key_prefix: String,
	pub role_id: String,
	#[serde(default)]
	pub group_id: Option<String>,
	#[serde(default)]
	pub revoked: bool,
	pub created_at: DateTime<Utc>,
	#[serde(default)]
	pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
	Block,
	Warn,
	Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	Low,
	Medium,
	High,
	Critical,
}

impl Severity {
	pub fn as_str(&self) -> &'static str {
		match self {
			Severity::Low => "low",
			Severity::Medium => "medium",
			Severity::High => "high",
			Severity::Critical => "critical",
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
	#[serde(default)]
	pub name: String,
	pub category: String,
	#[serde(with = "serde_regex")]
	pub patterns: Vec<regex::Regex>,
	pub action: PolicyAction,
	pub severity: Severity,
}

impl PolicyRule {
	pub fn matches(&self, text: &str) -> bool {
		self.patterns.iter().any(|p| p.is_match(text))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
	pub timestamp: DateTime<Utc>,
	pub tenant_id: String,
	pub api_key_id: String,
	pub provider: String,
	pub model: String,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub total_tokens: u64,
	pub cost_usd: f64,
	pub latency_ms: u64,
	pub status: String,
	#[serde(default)]
	pub error_kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
	pub timestamp: DateTime<Utc>,
	pub tenant_id: String,
	pub api_key_id: String,
	pub category: String,
	pub severity: String,
	pub action: String,
	pub rule: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaDelta {
	pub requests: u64,
	pub tokens: u64,
	pub cost_usd: f64,
}

/// Persistence contract for the gateway core. One trait groups the five
/// concerns (tenants, keys, policies, usage, provider configs); backends are
/// free to map them onto whatever storage they like. All implementations
/// must be safe for concurrent callers.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
	async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError>;
	async fn put_tenant(&self, tenant: Tenant) -> Result<(), StoreError>;
	/// Atomically add `delta` to the tenant's quota counters.
	async fn consume_quota(&self, tenant_id: &str, delta: QuotaDelta) -> Result<(), StoreError>;

	async fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError>;
	async fn put_api_key(&self, key: ApiKey) -> Result<(), StoreError>;
	async fn touch_api_key(&self, id: &str, when: DateTime<Utc>) -> Result<(), StoreError>;
	async fn list_api_keys(&self, tenant_id: &str) -> Result<Vec<ApiKey>, StoreError>;

	async fn get_policies(&self, ids: &[String]) -> Result<Vec<PolicyRule>, StoreError>;
	async fn put_policy(&self, id: &str, rule: PolicyRule) -> Result<(), StoreError>;

	async fn append_usage(&self, record: UsageRecord) -> Result<(), StoreError>;
	async fn append_violation(&self, record: ViolationRecord) -> Result<(), StoreError>;
	async fn usage_between(
		&self,
		api_key_id: &str,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
	) -> Result<Vec<UsageRecord>, StoreError>;
	async fn violations_between(
		&self,
		api_key_id: &str,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
	) -> Result<Vec<ViolationRecord>, StoreError>;

	/// Encrypted credential blob for a provider, if one is stored.
	async fn get_provider_credential(
		&self,
		provider: ProviderKind,
	) -> Result<Option<String>, StoreError>;
	async fn put_provider_credential(
		&self,
		provider: ProviderKind,
		blob: String,
	) -> Result<(), StoreError>;

	/// Current schema version; backends apply migrations before serving.
	async fn migration_version(&self) -> Result<u32, StoreError>;
}
