use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::llm::ProviderKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
	pub provider: ProviderKind,
	#[serde(default)]
	pub supports_tools: bool,
	#[serde(default)]
	pub supports_reasoning: bool,
	#[serde(default)]
	pub context_limit: u64,
	#[serde(default)]
	pub output_limit: u64,
	#[serde(default)]
	pub input_cost_per_1m: f64,
	#[serde(default)]
	pub output_cost_per_1m: f64,
	#[serde(default = "enabled_default")]
	pub enabled: bool,
}

fn enabled_default() -> bool {
	true
}

impl ModelConfig {
	pub fn cost_usd(&self, input_tokens: u64, output_tokens: u64) -> f64 {
		(input_tokens as f64 / 1e6) * self.input_cost_per_1m
			+ (output_tokens as f64 / 1e6) * self.output_cost_per_1m
	}
}

#[derive(Debug, Clone)]
pub struct Resolved {
	pub provider: ProviderKind,
	/// Canonical gateway-facing identifier; resolving it again is a fixpoint.
	pub id: String,
	/// Provider-native model name sent upstream.
	pub model: String,
	pub config: Option<ModelConfig>,
}

impl PartialEq for Resolved {
	fn eq(&self, other: &Self) -> bool {
		self.provider == other.provider && self.id == other.id && self.model == other.model
	}
}

/// Purely functional view over the model/alias/provider config snapshot.
#[derive(Debug, Default)]
pub struct RouteTable {
	models: HashMap<String, ModelConfig>,
	aliases: HashMap<String, String>,
	enabled_providers: HashSet<ProviderKind>,
}

impl RouteTable {
	pub fn new(
		models: HashMap<String, ModelConfig>,
		aliases: HashMap<String, String>,
		enabled_providers: HashSet<ProviderKind>,
	) -> Self {
		Self {
			models,
			aliases,
			enabled_providers,
		}
	}

	/// Resolve a user-facing model identifier. Aliases are applied at most
	/// once (no chaining); `provider/model` falls through for identifiers
	/// the table does not know.
	pub fn resolve(&self, model: &str) -> Result<Resolved, GatewayError> {
		let canonical = self.aliases.get(model).map(String::as_str).unwrap_or(model);

		if let Some(cfg) = self.models.get(canonical)
			&& cfg.enabled
			&& self.enabled_providers.contains(&cfg.provider)
		{
			return Ok(Resolved {
				provider: cfg.provider,
				id: canonical.to_string(),
				model: canonical.to_string(),
				config: Some(cfg.clone()),
			});
		}

		if let Some((prefix, rest)) = canonical.split_once('/')
			&& !rest.is_empty()
			&& let Ok(kind) = prefix.parse::<ProviderKind>()
			&& self.enabled_providers.contains(&kind)
		{
			return Ok(Resolved {
				provider: kind,
				id: canonical.to_string(),
				model: rest.to_string(),
				config: self.models.get(rest).filter(|c| c.enabled).cloned(),
			});
		}

		Err(GatewayError::ModelNotAvailable(model.to_string()))
	}

	/// Enabled models on enabled providers, sorted by name. Backs `GET /v1/models`.
	pub fn enabled_models(&self) -> Vec<(&str, &ModelConfig)> {
		let mut out: Vec<(&str, &ModelConfig)> = self
			.models
			.iter()
			.filter(|(_, c)| c.enabled && self.enabled_providers.contains(&c.provider))
			.map(|(n, c)| (n.as_str(), c))
			.collect();
		out.sort_by_key(|(n, _)| *n);
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn model(provider: ProviderKind, enabled: bool) -> ModelConfig {
		ModelConfig {
			provider,
			supports_tools: true,
			supports_reasoning: false,
			context_limit: 128_000,
			output_limit: 16_384,
			input_cost_per_1m: 0.15,
			output_cost_per_1m: 0.6,
			enabled,
		}
	}

	fn table() -> RouteTable {
		let mut models = HashMap::new();
		models.insert("gpt-4o-mini".to_string(), model(ProviderKind::OpenAI, true));
		models.insert("claude-sonnet".to_string(), model(ProviderKind::Anthropic, true));
		models.insert("old-model".to_string(), model(ProviderKind::OpenAI, false));
		let mut aliases = HashMap::new();
		aliases.insert("fast".to_string(), "gpt-4o-mini".to_string());
		aliases.insert("loop-a".to_string(), "loop-b".to_string());
		aliases.insert("loop-b".to_string(), "gpt-4o-mini".to_string());
		RouteTable::new(
			models,
			aliases,
			HashSet::from([ProviderKind::OpenAI, ProviderKind::Anthropic, ProviderKind::Ollama]),
		)
	}

	#[test]
	fn resolves_direct_and_alias() {
		let t = table();
		let direct = t.resolve("gpt-4o-mini").unwrap();
		assert_eq!(direct.provider, ProviderKind::OpenAI);
		assert_eq!(direct.model, "gpt-4o-mini");
		let via_alias = t.resolve("fast").unwrap();
		assert_eq!(via_alias.id, "gpt-4o-mini");
	}

	#[test]
	fn resolution_is_idempotent() {
		let t = table();
		for name in ["fast", "gpt-4o-mini", "ollama/llama3.2", "anthropic/claude-sonnet"] {
			let once = t.resolve(name).unwrap();
			let twice = t.resolve(&once.id).unwrap();
			assert_eq!(once, twice, "resolving {name} twice diverged");
		}
	}

	#[test]
	fn aliases_do_not_chain() {
		let t = table();
		// loop-a -> loop-b is one hop; loop-b is not a model, so this fails
		// rather than chasing loop-b -> gpt-4o-mini.
		assert!(matches!(
			t.resolve("loop-a"),
			Err(GatewayError::ModelNotAvailable(_))
		));
	}

	#[test]
	fn provider_prefix_path() {
		let t = table();
		let r = t.resolve("ollama/llama3.2").unwrap();
		assert_eq!(r.provider, ProviderKind::Ollama);
		assert_eq!(r.model, "llama3.2");
		assert!(r.config.is_none());
	}

	#[test]
	fn disabled_and_unknown_are_rejected() {
		let t = table();
		assert!(t.resolve("old-model").is_err());
		assert!(t.resolve("does-not-exist").is_err());
		// gemini is not in the enabled provider set
		assert!(t.resolve("gemini/flash").is_err());
		assert!(t.resolve("openai/").is_err());
	}

	#[test]
	fn enabled_models_hides_disabled() {
		let t = table();
		let names: Vec<&str> = t.enabled_models().iter().map(|(n, _)| *n).collect();
		assert_eq!(names, vec!["claude-sonnet", "gpt-4o-mini"]);
	}

	#[test]
	fn cost_is_linear_in_tokens() {
		let m = model(ProviderKind::OpenAI, true);
		let cost = m.cost_usd(1000, 2000);
		let want = 1000.0 / 1e6 * 0.15 + 2000.0 / 1e6 * 0.6;
		assert!((cost - want).abs() < 1e-9 * 0.6);
		assert_eq!(m.cost_usd(0, 0), 0.0);
	}
}
