//! Per-run execution context.
//!
//! A run keeps its own copy of the review-tunable configuration so checkpoint overrides never
//! leak into other runs. The context is rebuilt from that copy whenever a phase starts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{CallPolicy, CancelToken, Error, Result};
use sieve_config::{
	Composite, Config, EmbeddingProviderConfig, Filter, Fusion, LlmProviderConfig, Planner,
	Quality, Relevance, Runtime, Synthesis,
};
use sieve_domain::composite::{CompositeScorer, DerivationParams};

/// The configuration sections a reviewer may override for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSettings {
	pub planner: Planner,
	pub fusion: Fusion,
	pub filter: Filter,
	pub relevance: Relevance,
	pub quality: Quality,
	pub composite: Composite,
	pub synthesis: Synthesis,
	pub runtime: Runtime,
}
impl ReviewSettings {
	pub fn from_config(cfg: &Config) -> Self {
		Self {
			planner: cfg.planner.clone(),
			fusion: cfg.fusion.clone(),
			filter: cfg.filter.clone(),
			relevance: cfg.relevance.clone(),
			quality: cfg.quality.clone(),
			composite: cfg.composite.clone(),
			synthesis: cfg.synthesis.clone(),
			runtime: cfg.runtime.clone(),
		}
	}

	/// Applies a JSON merge patch and validates the result. On error `self` is unchanged.
	pub fn with_overrides(&self, base: &Config, overrides: &Value) -> Result<Self> {
		if !overrides.is_object() {
			return Err(Error::InvalidRequest {
				message: "Overrides must be a JSON object.".to_string(),
			});
		}

		let mut merged = serde_json::to_value(self)?;

		merge_patch(&mut merged, overrides);

		let mut settings: ReviewSettings = serde_json::from_value(merged).map_err(|err| {
			Error::InvalidRequest { message: format!("Overrides do not fit the settings: {err}") }
		})?;

		settings.runtime.checkpoint_mode = settings.runtime.checkpoint_mode.trim().to_lowercase();

		let mut cfg = base.clone();

		settings.apply_to(&mut cfg);
		sieve_config::validate_review(&cfg)?;

		Ok(settings)
	}

	pub fn is_automatic(&self) -> bool {
		self.runtime.checkpoint_mode == "automatic"
	}

	fn apply_to(&self, cfg: &mut Config) {
		cfg.planner = self.planner.clone();
		cfg.fusion = self.fusion.clone();
		cfg.filter = self.filter.clone();
		cfg.relevance = self.relevance.clone();
		cfg.quality = self.quality.clone();
		cfg.composite = self.composite.clone();
		cfg.synthesis = self.synthesis.clone();
		cfg.runtime = self.runtime.clone();
	}
}

pub struct RunContext {
	pub run_id: Uuid,
	pub settings: ReviewSettings,
	pub llm: LlmProviderConfig,
	pub embedding: EmbeddingProviderConfig,
	pub policy: CallPolicy,
	pub scorer: CompositeScorer,
	pub derivation: DerivationParams,
	pub cancel: CancelToken,
}
impl RunContext {
	pub fn new(
		cfg: &Config,
		run_id: Uuid,
		settings: ReviewSettings,
		created_at: OffsetDateTime,
		cancel: CancelToken,
	) -> Result<Self> {
		let scorer = CompositeScorer::from_config(&settings.composite)?;
		let derivation = DerivationParams {
			evaluation_year: created_at.year(),
			recency_half_life_years: settings.composite.recency_half_life_years,
			sample_size_target: settings.composite.sample_size_target,
		};

		Ok(Self {
			run_id,
			policy: CallPolicy::from_runtime(&settings.runtime),
			llm: cfg.providers.llm.clone(),
			embedding: cfg.providers.embedding.clone(),
			settings,
			scorer,
			derivation,
			cancel,
		})
	}

	pub fn model(&self) -> &str {
		&self.llm.model
	}
}

/// RFC 7386 merge: objects merge recursively, `null` removes a key, anything else replaces.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
	let Value::Object(patch) = patch else {
		*target = patch.clone();

		return;
	};

	if !target.is_object() {
		*target = Value::Object(Default::default());
	}

	if let Value::Object(target) = target {
		for (key, value) in patch {
			if value.is_null() {
				target.remove(key);
			} else {
				merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::merge_patch;

	#[test]
	fn merge_patch_replaces_leaves_and_keeps_siblings() {
		let mut target = json!({ "relevance": { "threshold": 2.5, "batch_size": 50 } });

		merge_patch(&mut target, &json!({ "relevance": { "threshold": 3.0 } }));

		assert_eq!(target, json!({ "relevance": { "threshold": 3.0, "batch_size": 50 } }));
	}

	#[test]
	fn merge_patch_null_removes_key() {
		let mut target = json!({ "a": 1, "b": 2 });

		merge_patch(&mut target, &json!({ "b": null }));

		assert_eq!(target, json!({ "a": 1 }));
	}
}
