use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;

use super::*;

const SCHEMA_VERSION: u32 = 4;

#[derive(Default)]
struct Inner {
	tenants: HashMap<String, Tenant>,
	// key_hash -> ApiKey; the hash is the lookup key on the hot path
	keys_by_hash: HashMap<String, ApiKey>,
	policies: HashMap<String, PolicyRule>,
	// Partitioned by day, append-only within a partition.
	usage: BTreeMap<NaiveDate, Vec<UsageRecord>>,
	violations: Vec<ViolationRecord>,
	credentials: HashMap<ProviderKind, String>,
}

/// Single-node store. Also the fixture store for the test suite.
#[derive(Default)]
pub struct MemoryStore {
	inner: RwLock<Inner>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl Store for MemoryStore {
	async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
		Ok(self.inner.read().tenants.get(id).cloned())
	}

	async fn put_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
		self.inner.write().tenants.insert(tenant.id.clone(), tenant);
		Ok(())
	}

	async fn consume_quota(&self, tenant_id: &str, delta: QuotaDelta) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		let tenant = inner
			.tenants
			.get_mut(tenant_id)
			.ok_or_else(|| StoreError::NotFound(format!("tenant {tenant_id}")))?;
		tenant.quotas.requests_used += delta.requests;
		tenant.quotas.tokens_used += delta.tokens;
		tenant.quotas.cost_used_usd += delta.cost_usd;
		Ok(())
	}

	async fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
		Ok(self.inner.read().keys_by_hash.get(key_hash).cloned())
	}

	async fn put_api_key(&self, key: ApiKey) -> Result<(), StoreError> {
		self.inner.write().keys_by_hash.insert(key.key_hash.clone(), key);
		Ok(())
	}

	async fn touch_api_key(&self, id: &str, when: DateTime<Utc>) -> Result<(), StoreError> {
		let mut inner = self.inner.write();
		for key in inner.keys_by_hash.values_mut() {
			if key.id == id {
				key.last_used_at = Some(when);
				return Ok(());
			}
		}
		Err(StoreError::NotFound(format!("api key {id}")))
	}

	async fn list_api_keys(&self, tenant_id: &str) -> Result<Vec<ApiKey>, StoreError> {
		let mut keys: Vec<ApiKey> = self
			.inner
			.read()
			.keys_by_hash
			.values()
			.filter(|k| k.tenant_id == tenant_id)
			.cloned()
			.collect();
		keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		Ok(keys)
	}

	async fn get_policies(&self, ids: &[String]) -> Result<Vec<PolicyRule>, StoreError> {
		let inner = self.inner.read();
		Ok(
			ids
				.iter()
				.filter_map(|id| inner.policies.get(id).cloned())
				.collect(),
		)
	}

	async fn put_policy(&self, id: &str, rule: PolicyRule) -> Result<(), StoreError> {
		self.inner.write().policies.insert(id.to_string(), rule);
		Ok(())
	}

	async fn append_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
		let day = record.timestamp.date_naive();
		self.inner.write().usage.entry(day).or_default().push(record);
		Ok(())
	}

	async fn append_violation(&self, record: ViolationRecord) -> Result<(), StoreError> {
		self.inner.write().violations.push(record);
		Ok(())
	}

	async fn usage_between(
		&self,
		api_key_id: &str,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
	) -> Result<Vec<UsageRecord>, StoreError> {
		let inner = self.inner.read();
		Ok(
			inner
				.usage
				.range(start.date_naive()..=end.date_naive())
				.flat_map(|(_, recs)| recs.iter())
				.filter(|r| r.api_key_id == api_key_id && r.timestamp >= start && r.timestamp <= end)
				.cloned()
				.collect(),
		)
	}

	async fn violations_between(
		&self,
		api_key_id: &str,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
	) -> Result<Vec<ViolationRecord>, StoreError> {
		Ok(
			self
				.inner
				.read()
				.violations
				.iter()
				.filter(|v| v.api_key_id == api_key_id && v.timestamp >= start && v.timestamp <= end)
				.cloned()
				.collect(),
		)
	}

	async fn get_provider_credential(
		&self,
		provider: ProviderKind,
	) -> Result<Option<String>, StoreError> {
		Ok(self.inner.read().credentials.get(&provider).cloned())
	}

	async fn put_provider_credential(
		&self,
		provider: ProviderKind,
		blob: String,
	) -> Result<(), StoreError> {
		self.inner.write().credentials.insert(provider, blob);
		Ok(())
	}

	async fn migration_version(&self) -> Result<u32, StoreError> {
		Ok(SCHEMA_VERSION)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tenant(id: &str) -> Tenant {
		Tenant {
			id: id.to_string(),
			status: TenantStatus::Active,
			tier: "standard".to_string(),
			quotas: Quotas::default(),
			policy_ids: vec![],
			requests_per_minute: 60,
			tokens_per_minute: 100_000,
		}
	}

	#[tokio::test]
	async fn quota_counters_are_monotonic() {
		let store = MemoryStore::new();
		store.put_tenant(tenant("t1")).await.unwrap();
		for _ in 0..3 {
			store
				.consume_quota(
					"t1",
					QuotaDelta {
						requests: 1,
						tokens: 100,
						cost_usd: 0.25,
					},
				)
				.await
				.unwrap();
		}
		let t = store.get_tenant("t1").await.unwrap().unwrap();
		assert_eq!(t.quotas.requests_used, 3);
		assert_eq!(t.quotas.tokens_used, 300);
		assert!((t.quotas.cost_used_usd - 0.75).abs() < 1e-9);
	}

	#[tokio::test]
	async fn usage_query_respects_key_and_range() {
		let store = MemoryStore::new();
		let now = Utc::now();
		for (key, offs) in [("k1", 0i64), ("k1", -3600), ("k2", 0)] {
			store
				.append_usage(UsageRecord {
					timestamp: now + chrono::Duration::seconds(offs),
					tenant_id: "t1".into(),
					api_key_id: key.into(),
					provider: "openai".into(),
					model: "gpt-4o-mini".into(),
					input_tokens: 10,
					output_tokens: 5,
					total_tokens: 15,
					cost_usd: 0.001,
					latency_ms: 40,
					status: "ok".into(),
					error_kind: None,
				})
				.await
				.unwrap();
		}
		let recs = store
			.usage_between("k1", now - chrono::Duration::seconds(60), now)
			.await
			.unwrap();
		assert_eq!(recs.len(), 1);
	}
}
