use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt::Display;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dispatch::DispatcherConfig;
use crate::llm::ProviderKind;
use crate::policy::OutlierConfig;
use crate::router::ModelConfig;
use crate::store::PolicyRule;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_yaml::Error),
	#[error("invalid config: {0}")]
	Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
	pub server: ServerConfig,
	pub telemetry: TelemetryConfig,
	pub database: DatabaseConfig,
	pub security: SecurityConfig,
	pub providers: ProvidersConfig,
	pub models: HashMap<String, ModelConfig>,
	pub aliases: HashMap<String, String>,
	pub policies: Vec<PolicyRule>,
	pub outlier: OutlierConfig,
	pub dispatcher: DispatcherConfig,
	pub embedder: EmbedderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ServerConfig {
	pub host: String,
	pub port: u16,
	pub metrics_port: u16,
	/// Ingress read timeout; generous to accommodate long streams.
	pub read_timeout_secs: u64,
	pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			host: "0.0.0.0".to_string(),
			port: 8080,
			metrics_port: 9090,
			read_timeout_secs: 300,
			write_timeout_secs: 600,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct TelemetryConfig {
	pub log_level: String,
	pub log_format: String,
}

impl Default for TelemetryConfig {
	fn default() -> Self {
		Self {
			log_level: "info".to_string(),
			log_format: "text".to_string(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct DatabaseConfig {
	pub driver: String,
	pub host: String,
	pub port: u16,
	pub user: String,
	pub password: String,
	pub name: String,
	pub ssl_mode: String,
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		Self {
			driver: "memory".to_string(),
			host: "localhost".to_string(),
			port: 5432,
			user: String::new(),
			password: String::new(),
			name: "modelgate".to_string(),
			ssl_mode: "prefer".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SecurityConfig {
	/// Base64-encoded AEAD key for credentials at rest; 16, 24 or 32 bytes.
	/// Empty means an ephemeral key is generated at startup.
	pub encryption_key: String,
}

impl SecurityConfig {
	pub fn key_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
		if self.encryption_key.is_empty() {
			return Ok(None);
		}
		let bytes = STANDARD
			.decode(&self.encryption_key)
			.map_err(|_| ConfigError::Invalid("security.encryption_key is not base64".to_string()))?;
		if !matches!(bytes.len(), 16 | 24 | 32) {
			return Err(ConfigError::Invalid(format!(
				"security.encryption_key must be 16, 24 or 32 bytes, got {}",
				bytes.len()
			)));
		}
		Ok(Some(bytes))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ProviderConfig {
	pub enabled: bool,
	pub api_key: Option<String>,
	pub base_url: Option<String>,
	/// Anthropic API version header.
	pub api_version: Option<String>,
	/// Bedrock region.
	pub region: Option<String>,
}

impl Default for ProviderConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			api_key: None,
			base_url: None,
			api_version: None,
			region: None,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ProvidersConfig {
	pub openai: Option<ProviderConfig>,
	pub anthropic: Option<ProviderConfig>,
	pub gemini: Option<ProviderConfig>,
	pub bedrock: Option<ProviderConfig>,
	pub ollama: Option<ProviderConfig>,
}

impl ProvidersConfig {
	pub fn get(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
		match kind {
			ProviderKind::OpenAI => self.openai.as_ref(),
			ProviderKind::Anthropic => self.anthropic.as_ref(),
			ProviderKind::Gemini => self.gemini.as_ref(),
			ProviderKind::Bedrock => self.bedrock.as_ref(),
			ProviderKind::Ollama => self.ollama.as_ref(),
		}
	}

	pub fn get_mut_or_default(&mut self, kind: ProviderKind) -> &mut ProviderConfig {
		let slot = match kind {
			ProviderKind::OpenAI => &mut self.openai,
			ProviderKind::Anthropic => &mut self.anthropic,
			ProviderKind::Gemini => &mut self.gemini,
			ProviderKind::Bedrock => &mut self.bedrock,
			ProviderKind::Ollama => &mut self.ollama,
		};
		slot.get_or_insert_with(ProviderConfig::default)
	}

	/// Providers with a present and enabled section.
	pub fn enabled(&self) -> HashSet<ProviderKind> {
		ProviderKind::ALL
			.into_iter()
			.filter(|k| self.get(*k).is_some_and(|p| p.enabled))
			.collect()
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct EmbedderConfig {
	#[serde(rename = "type")]
	pub kind: String,
	pub url: Option<String>,
	pub model: Option<String>,
}

static VAR_PATTERN: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern"));

/// Expand `${VAR}` references from the process environment. Unset variables
/// expand to the empty string.
fn expand_env(contents: &str) -> String {
	VAR_PATTERN
		.replace_all(contents, |caps: &regex::Captures| {
			env::var(&caps[1]).unwrap_or_default()
		})
		.into_owned()
}

fn parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
	T::Err: Display,
{
	match env::var(name) {
		Ok(v) if !v.is_empty() => v
			.parse::<T>()
			.map(Some)
			.map_err(|e| ConfigError::Invalid(format!("{name}: {e}"))),
		_ => Ok(None),
	}
}

pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
	let expanded = expand_env(contents);
	let mut cfg: Config = serde_yaml::from_str(&expanded)?;
	apply_env_overrides(&mut cfg)?;
	cfg.validate()?;
	Ok(cfg)
}

fn apply_env_overrides(cfg: &mut Config) -> Result<(), ConfigError> {
	if let Some(v) = parse::<String>("MODELGATE_DB_DRIVER")? {
		cfg.database.driver = v;
	}
	if let Some(v) = parse::<String>("MODELGATE_DB_HOST")? {
		cfg.database.host = v;
	}
	if let Some(v) = parse::<u16>("MODELGATE_DB_PORT")? {
		cfg.database.port = v;
	}
	if let Some(v) = parse::<String>("MODELGATE_DB_USER")? {
		cfg.database.user = v;
	}
	if let Some(v) = parse::<String>("MODELGATE_DB_PASSWORD")? {
		cfg.database.password = v;
	}
	if let Some(v) = parse::<String>("MODELGATE_DB_NAME")? {
		cfg.database.name = v;
	}
	if let Some(v) = parse::<String>("MODELGATE_DB_SSL_MODE")? {
		cfg.database.ssl_mode = v;
	}
	if let Some(v) = parse::<u16>("MODELGATE_HTTP_PORT")? {
		cfg.server.port = v;
	}
	if let Some(v) = parse::<u16>("MODELGATE_METRICS_PORT")? {
		cfg.server.metrics_port = v;
	}
	if let Some(v) = parse::<String>("MODELGATE_EMBEDDER_TYPE")? {
		cfg.embedder.kind = v;
	}
	if let Some(v) = parse::<String>("MODELGATE_EMBEDDER_URL")? {
		cfg.embedder.url = Some(v);
	}
	if let Some(v) = parse::<String>("MODELGATE_EMBEDDER_MODEL")? {
		cfg.embedder.model = Some(v);
	}
	if let Some(v) = parse::<String>("MODELGATE_OPENAI_API_KEY")? {
		cfg
			.providers
			.get_mut_or_default(ProviderKind::OpenAI)
			.api_key = Some(v);
	}
	Ok(())
}

impl Config {
	pub fn validate(&self) -> Result<(), ConfigError> {
		self.dispatcher.validate().map_err(ConfigError::Invalid)?;
		self.security.key_bytes()?;
		let enabled = self.providers.enabled();
		for (name, model) in &self.models {
			if model.enabled && !enabled.contains(&model.provider) {
				return Err(ConfigError::Invalid(format!(
					"model {name} references provider {} which is not enabled",
					model.provider
				)));
			}
		}
		for (from, to) in &self.aliases {
			if from == to {
				return Err(ConfigError::Invalid(format!("alias {from} maps to itself")));
			}
		}
		if !(0.0..=1.0).contains(&self.outlier.anomaly_threshold) {
			return Err(ConfigError::Invalid(
				"outlier.anomaly_threshold must be within [0, 1]".to_string(),
			));
		}
		Ok(())
	}
}
