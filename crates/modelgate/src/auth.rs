use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::GatewayError;
use crate::store::{ApiKey, Store, Tenant, TenantStatus};

/// Resolved caller identity. Every authenticated request maps to exactly one
/// tenant and one API key.
#[derive(Debug, Clone)]
pub struct AuthContext {
	pub tenant: Tenant,
	pub api_key: ApiKey,
	pub role: String,
	pub scopes: Vec<String>,
}

/// Digest used for key lookup; raw credentials are never stored or logged.
pub fn hash_credential(raw: &str) -> String {
	hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Display prefix persisted next to the hash.
pub fn key_prefix(raw: &str) -> String {
	raw.chars().take(8).collect()
}

pub struct AuthResolver {
	store: Arc<dyn Store>,
}

impl AuthResolver {
	pub fn new(store: Arc<dyn Store>) -> Self {
		Self { store }
	}

	/// Resolve a bearer credential. The `revoked` flag is re-read from the
	/// store on every request; the `last_used_at` write is fire-and-forget.
	pub async fn resolve(&self, bearer: &str) -> Result<AuthContext, GatewayError> {
		let hash = hash_credential(bearer);
		let key = self
			.store
			.get_api_key_by_hash(&hash)
			.await?
			.ok_or(GatewayError::Unauthenticated)?;
		if key.revoked {
			return Err(GatewayError::Unauthenticated);
		}
		let tenant = self
			.store
			.get_tenant(&key.tenant_id)
			.await?
			.ok_or(GatewayError::Unauthenticated)?;
		if tenant.status != TenantStatus::Active {
			return Err(GatewayError::Forbidden);
		}

		{
			let store = self.store.clone();
			let key_id = key.id.clone();
			tokio::spawn(async move {
				if let Err(e) = store.touch_api_key(&key_id, Utc::now()).await {
					debug!("last_used_at update lost: {e}");
				}
			});
		}

		let role = key.role_id.clone();
		let scopes = if role == "admin" {
			vec!["admin".to_string(), "inference".to_string()]
		} else {
			vec!["inference".to_string()]
		};
		Ok(AuthContext {
			tenant,
			api_key: key,
			role,
			scopes,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::{MemoryStore, Quotas};

	async fn seeded() -> (Arc<MemoryStore>, AuthResolver) {
		let store = Arc::new(MemoryStore::new());
		store
			.put_tenant(Tenant {
				id: "t1".to_string(),
				status: TenantStatus::Active,
				tier: "standard".to_string(),
				quotas: Quotas::default(),
				policy_ids: vec![],
				requests_per_minute: 60,
				tokens_per_minute: 100_000,
			})
			.await
			.unwrap();
		store
			.put_api_key(ApiKey {
				id: "k1".to_string(),
				tenant_id: "t1".to_string(),
				key_hash: hash_credential("mg-secret-key"),
				key_prefix: key_prefix("mg-secret-key"),
				role_id: "user".to_string(),
				group_id: None,
				revoked: false,
				created_at: Utc::now(),
				last_used_at: None,
			})
			.await
			.unwrap();
		let resolver = AuthResolver::new(store.clone());
		(store, resolver)
	}

	#[tokio::test]
	async fn valid_key_resolves_and_touches_last_used() {
		let (store, resolver) = seeded().await;
		let auth = resolver.resolve("mg-secret-key").await.unwrap();
		assert_eq!(auth.tenant.id, "t1");
		assert_eq!(auth.api_key.id, "k1");
		assert_eq!(auth.scopes, vec!["inference"]);
		// The touch is async; give it a beat.
		for _ in 0..50 {
			tokio::time::sleep(std::time::Duration::from_millis(5)).await;
			let key = store
				.get_api_key_by_hash(&hash_credential("mg-secret-key"))
				.await
				.unwrap()
				.unwrap();
			if key.last_used_at.is_some() {
				return;
			}
		}
		panic!("last_used_at was never written");
	}

	#[tokio::test]
	async fn unknown_and_revoked_keys_are_unauthenticated() {
		let (store, resolver) = seeded().await;
		assert!(matches!(
			resolver.resolve("nope").await,
			Err(GatewayError::Unauthenticated)
		));
		let mut key = store
			.get_api_key_by_hash(&hash_credential("mg-secret-key"))
			.await
			.unwrap()
			.unwrap();
		key.revoked = true;
		store.put_api_key(key).await.unwrap();
		assert!(matches!(
			resolver.resolve("mg-secret-key").await,
			Err(GatewayError::Unauthenticated)
		));
	}

	#[tokio::test]
	async fn suspended_tenant_is_forbidden() {
		let (store, resolver) = seeded().await;
		let mut tenant = store.get_tenant("t1").await.unwrap().unwrap();
		tenant.status = TenantStatus::Suspended;
		store.put_tenant(tenant).await.unwrap();
		assert!(matches!(
			resolver.resolve("mg-secret-key").await,
			Err(GatewayError::Forbidden)
		));
	}
}
