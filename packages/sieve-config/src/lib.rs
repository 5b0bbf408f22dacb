mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Composite, CompositeWeights, Config, EVALUATOR_NAMES, EmbeddingProviderConfig, EvaluatorRule,
	Filter, Fusion, LlmProviderConfig, Planner, Postgres, Providers, Qdrant, Quality, Relevance,
	Runtime, STUDY_TYPE_LABELS, Service, Storage, Synthesis,
};

use std::{fs, path::Path};

pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;
	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);
	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.http_bind.trim().is_empty() {
		return Err(Error::validation("service.http_bind must be non-empty."));
	}
	if cfg.providers.embedding.dimensions == 0 {
		return Err(Error::validation("providers.embedding.dimensions must be greater than zero."));
	}
	if cfg.providers.embedding.dimensions != cfg.storage.qdrant.vector_dim {
		return Err(Error::validation(
			"providers.embedding.dimensions must match storage.qdrant.vector_dim.",
		));
	}

	for (label, key, timeout_ms) in [
		("embedding", &cfg.providers.embedding.api_key, cfg.providers.embedding.timeout_ms),
		("llm", &cfg.providers.llm.api_key, cfg.providers.llm.timeout_ms),
	] {
		if key.trim().is_empty() {
			return Err(Error::validation(format!("Provider {label} api_key must be non-empty.")));
		}
		if timeout_ms == 0 {
			return Err(Error::validation(format!(
				"Provider {label} timeout_ms must be greater than zero."
			)));
		}
	}

	validate_review(cfg)
}

/// Validates only the review-tunable sections. Checkpoint overrides are re-checked with this before
/// a phase is re-entered.
pub fn validate_review(cfg: &Config) -> Result<()> {
	validate_planner(&cfg.planner)?;
	validate_fusion(&cfg.fusion)?;
	validate_filter(&cfg.filter)?;
	validate_relevance(&cfg.relevance)?;
	validate_quality(&cfg.quality)?;
	validate_composite(&cfg.composite)?;
	validate_synthesis(&cfg.synthesis)?;
	validate_runtime(&cfg.runtime)?;

	Ok(())
}

pub fn validate_weights(weights: &CompositeWeights) -> Result<()> {
	for (label, weight) in weights.as_array() {
		if !weight.is_finite() {
			return Err(Error::validation(format!(
				"composite.weights.{label} must be a finite number."
			)));
		}
		if weight < 0.0 {
			return Err(Error::validation(format!(
				"composite.weights.{label} must be zero or greater."
			)));
		}
	}

	let total = weights.total();

	if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
		return Err(Error::validation(format!(
			"composite.weights must sum to 1.0 (got {total})."
		)));
	}

	Ok(())
}

fn validate_planner(cfg: &Planner) -> Result<()> {
	if cfg.min_queries == 0 {
		return Err(Error::validation("planner.min_queries must be greater than zero."));
	}
	if cfg.min_queries > cfg.max_queries {
		return Err(Error::validation("planner.min_queries must not exceed planner.max_queries."));
	}
	if cfg.top_k == 0 {
		return Err(Error::validation("planner.top_k must be greater than zero."));
	}

	Ok(())
}

fn validate_fusion(cfg: &Fusion) -> Result<()> {
	for (label, weight) in
		[("fusion.semantic_weight", cfg.semantic_weight), ("fusion.keyword_weight", cfg.keyword_weight)]
	{
		if !weight.is_finite() || weight < 0.0 {
			return Err(Error::validation(format!("{label} must be a finite number >= 0.")));
		}
	}

	if cfg.semantic_weight + cfg.keyword_weight <= 0.0 {
		return Err(Error::validation("fusion weights must not both be zero."));
	}
	if !cfg.rrf_k.is_finite() || cfg.rrf_k <= 0.0 {
		return Err(Error::validation("fusion.rrf_k must be greater than zero."));
	}

	Ok(())
}

fn validate_filter(cfg: &Filter) -> Result<()> {
	if cfg.protective_window_words == 0 {
		return Err(Error::validation("filter.protective_window_words must be greater than zero."));
	}
	if cfg.title_prefixes.iter().any(|prefix| prefix.trim().is_empty()) {
		return Err(Error::validation("filter.title_prefixes must not contain blank entries."));
	}
	if cfg.protective_phrases.iter().any(|phrase| phrase.trim().is_empty()) {
		return Err(Error::validation("filter.protective_phrases must not contain blank entries."));
	}

	Ok(())
}

fn validate_relevance(cfg: &Relevance) -> Result<()> {
	if cfg.batch_size == 0 {
		return Err(Error::validation("relevance.batch_size must be greater than zero."));
	}
	if !cfg.threshold.is_finite() || !(1.0..=5.0).contains(&cfg.threshold) {
		return Err(Error::validation("relevance.threshold must be in the range 1.0-5.0."));
	}

	Ok(())
}

fn validate_quality(cfg: &Quality) -> Result<()> {
	let mut seen = Vec::new();

	for rule in &cfg.evaluators {
		if !EVALUATOR_NAMES.contains(&rule.name.as_str()) {
			return Err(Error::validation(format!(
				"quality.evaluators contains unknown evaluator {:?}.",
				rule.name
			)));
		}
		if seen.contains(&rule.name.as_str()) {
			return Err(Error::validation(format!(
				"quality.evaluators lists {:?} more than once.",
				rule.name
			)));
		}

		seen.push(rule.name.as_str());

		for label in rule.include_study_types.iter().chain(rule.exclude_study_types.iter()) {
			if !STUDY_TYPE_LABELS.contains(&label.as_str()) {
				return Err(Error::validation(format!(
					"quality.evaluators.{} references unknown study type {label:?}.",
					rule.name
				)));
			}
		}
	}

	Ok(())
}

fn validate_composite(cfg: &Composite) -> Result<()> {
	validate_weights(&cfg.weights)?;

	if !cfg.gate_threshold.is_finite() || !(0.0..=10.0).contains(&cfg.gate_threshold) {
		return Err(Error::validation("composite.gate_threshold must be in the range 0.0-10.0."));
	}
	if !cfg.min_coverage.is_finite() || cfg.min_coverage <= 0.0 || cfg.min_coverage > 1.0 {
		return Err(Error::validation("composite.min_coverage must be in the range (0.0, 1.0]."));
	}
	if !cfg.recency_half_life_years.is_finite() || cfg.recency_half_life_years <= 0.0 {
		return Err(Error::validation(
			"composite.recency_half_life_years must be greater than zero.",
		));
	}
	if cfg.sample_size_target < 2 {
		return Err(Error::validation("composite.sample_size_target must be at least 2."));
	}

	Ok(())
}

fn validate_synthesis(cfg: &Synthesis) -> Result<()> {
	if cfg.map_batch_size == 0 {
		return Err(Error::validation("synthesis.map_batch_size must be greater than zero."));
	}
	if cfg.map_reduce_threshold == 0 {
		return Err(Error::validation("synthesis.map_reduce_threshold must be greater than zero."));
	}

	Ok(())
}

fn validate_runtime(cfg: &Runtime) -> Result<()> {
	if cfg.max_concurrency == 0 {
		return Err(Error::validation("runtime.max_concurrency must be greater than zero."));
	}
	if cfg.call_timeout_ms == 0 {
		return Err(Error::validation("runtime.call_timeout_ms must be greater than zero."));
	}
	if cfg.backoff_base_ms > cfg.backoff_max_ms {
		return Err(Error::validation(
			"runtime.backoff_base_ms must not exceed runtime.backoff_max_ms.",
		));
	}
	if !matches!(cfg.checkpoint_mode.as_str(), "automatic" | "interactive") {
		return Err(Error::validation(
			"runtime.checkpoint_mode must be one of automatic or interactive.",
		));
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	cfg.runtime.checkpoint_mode = cfg.runtime.checkpoint_mode.trim().to_lowercase();

	for phrase in cfg.filter.protective_phrases.iter_mut().chain(cfg.filter.title_prefixes.iter_mut())
	{
		*phrase = phrase.trim().to_lowercase();
	}
	for rule in &mut cfg.quality.evaluators {
		rule.name = rule.name.trim().to_string();
	}
}
