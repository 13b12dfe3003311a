use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use prometheus_client::registry::Registry;
use rand::RngCore;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::auth::AuthResolver;
use crate::config::Config;
use crate::crypto::EncryptionService;
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::http::{AppState, api_router, metrics_router};
use crate::llm::{Adapter, ProviderKind};
use crate::policy::PolicyGate;
use crate::router::RouteTable;
use crate::store::{MemoryStore, Store};
use crate::telemetry::Metrics;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AppError {
	#[error("configuration error: {0}")]
	Config(String),
	#[error("failed to bind {0}: {1}")]
	Bind(String, std::io::Error),
	#[error("startup failure: {0}")]
	Startup(String),
}

pub async fn build_state(cfg: &Config) -> Result<AppState, AppError> {
	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));

	if cfg.database.driver != "memory" {
		warn!(
			driver = %cfg.database.driver,
			"no backend for this driver is linked in; using the in-memory store"
		);
	}
	let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
	let schema = store
		.migration_version()
		.await
		.map_err(|e| AppError::Startup(format!("schema migration failed: {e}")))?;
	info!(schema, "store ready");

	let crypto = match cfg
		.security
		.key_bytes()
		.map_err(|e| AppError::Config(e.to_string()))?
	{
		Some(key) => EncryptionService::new(&key),
		None => {
			warn!("security.encryption_key unset; using an ephemeral key, stored credentials will not survive a restart");
			let mut key = [0u8; 32];
			rand::rng().fill_bytes(&mut key);
			EncryptionService::new(&key)
		},
	}
	.map_err(|e| AppError::Config(e.to_string()))?;
	info!(key_id = %crypto.key_id(), "encryption service ready");

	// Provider credentials live encrypted at rest from the moment config is
	// loaded; adapters decrypt per call.
	let mut adapters = HashMap::new();
	for kind in ProviderKind::ALL {
		let Some(provider_cfg) = cfg.providers.get(kind) else {
			continue;
		};
		if !provider_cfg.enabled {
			continue;
		}
		if let Some(api_key) = &provider_cfg.api_key {
			let blob = crypto
				.encrypt(api_key.as_bytes())
				.map_err(|e| AppError::Startup(format!("credential encryption failed: {e}")))?;
			store
				.put_provider_credential(kind, blob)
				.await
				.map_err(|e| AppError::Startup(format!("credential store failed: {e}")))?;
		}
		let adapter = Adapter::new(
			kind,
			provider_cfg.base_url.clone(),
			provider_cfg.region.clone(),
			provider_cfg.api_version.clone(),
		)
		.map_err(|e| AppError::Startup(e.to_string()))?;
		adapters.insert(kind, Arc::new(adapter));
		info!(provider = %kind, "provider enabled");
	}

	let routes = RouteTable::new(
		cfg.models.clone(),
		cfg.aliases.clone(),
		cfg.providers.enabled(),
	);
	let gate = PolicyGate::new(
		store.clone(),
		cfg.policies.clone(),
		cfg.outlier.clone(),
		metrics.clone(),
	);
	let dispatcher = Dispatcher::new(cfg.dispatcher.clone()).map_err(|e| match e {
		GatewayError::Internal(msg) => AppError::Config(msg),
		other => AppError::Startup(other.to_string()),
	})?;

	Ok(AppState {
		auth: Arc::new(AuthResolver::new(store.clone())),
		gate: Arc::new(gate),
		routes: Arc::new(routes),
		dispatcher: Arc::new(dispatcher),
		adapters: Arc::new(adapters),
		store,
		crypto: Arc::new(crypto),
		metrics,
		registry: Arc::new(registry),
	})
}

pub async fn run(cfg: Config) -> Result<(), AppError> {
	let state = build_state(&cfg).await?;

	let api_addr = format!("{}:{}", cfg.server.host, cfg.server.port);
	let api_listener = TcpListener::bind(&api_addr)
		.await
		.map_err(|e| AppError::Bind(api_addr.clone(), e))?;
	let metrics_addr = format!("{}:{}", cfg.server.host, cfg.server.metrics_port);
	let metrics_listener = TcpListener::bind(&metrics_addr)
		.await
		.map_err(|e| AppError::Bind(metrics_addr.clone(), e))?;
	info!(api = %api_addr, metrics = %metrics_addr, "listening");

	let dispatcher = state.dispatcher.clone();
	let api = axum::serve(api_listener, api_router(state.clone()))
		.with_graceful_shutdown(shutdown_signal())
		.into_future();
	let metrics = axum::serve(metrics_listener, metrics_router(state.clone()))
		.with_graceful_shutdown(shutdown_signal())
		.into_future();

	let (api_res, metrics_res) = tokio::join!(api, metrics);
	api_res.map_err(|e| AppError::Startup(format!("api server failed: {e}")))?;
	metrics_res.map_err(|e| AppError::Startup(format!("metrics server failed: {e}")))?;

	info!("draining dispatcher");
	dispatcher.shutdown(SHUTDOWN_GRACE).await;
	info!("shutdown complete");
	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			},
			Err(_) => std::future::pending().await,
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();
	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
