use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const STUDY_TYPE_LABELS: [&str; 9] = [
	"meta_analysis",
	"systematic_review",
	"randomized_trial",
	"cohort",
	"case_control",
	"cross_sectional",
	"case_report",
	"narrative",
	"unknown",
];
pub const EVALUATOR_NAMES: [&str; 4] =
	["study_design", "risk_of_bias", "structured_extraction", "reporting_compliance"];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub providers: Providers,
	#[serde(default)]
	pub planner: Planner,
	#[serde(default)]
	pub fusion: Fusion,
	#[serde(default)]
	pub filter: Filter,
	#[serde(default)]
	pub relevance: Relevance,
	#[serde(default)]
	pub quality: Quality,
	#[serde(default)]
	pub composite: Composite,
	#[serde(default)]
	pub synthesis: Synthesis,
	#[serde(default)]
	pub runtime: Runtime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	pub http_bind: String,
	pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
	pub postgres: Postgres,
	pub qdrant: Qdrant,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Qdrant {
	pub url: String,
	pub collection: String,
	pub vector_dim: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub llm: LlmProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Planner {
	pub min_queries: u32,
	pub max_queries: u32,
	pub top_k: u32,
}
impl Default for Planner {
	fn default() -> Self {
		Self { min_queries: 8, max_queries: 12, top_k: 100 }
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Fusion {
	pub semantic_weight: f64,
	pub keyword_weight: f64,
	pub rrf_k: f64,
}
impl Default for Fusion {
	fn default() -> Self {
		Self { semantic_weight: 0.6, keyword_weight: 0.4, rrf_k: 60.0 }
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Filter {
	/// Tier-1 markers, matched only as a prefix of the title.
	pub title_prefixes: Vec<String>,
	/// Phrases that neutralize an exclusion keyword found near them.
	pub protective_phrases: Vec<String>,
	pub protective_window_words: u32,
}
impl Default for Filter {
	fn default() -> Self {
		Self {
			title_prefixes: [
				"editorial",
				"erratum",
				"errata",
				"correction",
				"corrigendum",
				"retraction",
				"retracted",
				"expression of concern",
				"letter to the editor",
				"in memoriam",
				"reply to",
				"response to",
				"comment on",
			]
			.into_iter()
			.map(str::to_string)
			.collect(),
			protective_phrases: [
				"not",
				"no",
				"never",
				"without",
				"except",
				"excluding",
				"excluded",
				"exclude",
				"were removed",
				"exclusion criteria",
				"in contrast to",
				"unlike",
				"compared with",
				"compared to",
				"rather than",
				"other than",
				"as opposed to",
			]
			.into_iter()
			.map(str::to_string)
			.collect(),
			protective_window_words: 8,
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Relevance {
	pub batch_size: u32,
	pub threshold: f64,
}
impl Default for Relevance {
	fn default() -> Self {
		Self { batch_size: 50, threshold: 2.5 }
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Quality {
	pub evaluators: Vec<EvaluatorRule>,
}
impl Default for Quality {
	fn default() -> Self {
		Self {
			evaluators: vec![
				EvaluatorRule::any("study_design"),
				EvaluatorRule {
					exclude_study_types: vec!["narrative".to_string()],
					..EvaluatorRule::any("risk_of_bias")
				},
				EvaluatorRule {
					exclude_study_types: vec!["narrative".to_string()],
					..EvaluatorRule::any("structured_extraction")
				},
				EvaluatorRule {
					include_study_types: vec![
						"systematic_review".to_string(),
						"meta_analysis".to_string(),
					],
					..EvaluatorRule::any("reporting_compliance")
				},
			],
		}
	}
}

/// Suitability predicate for one evaluator. An empty include list admits every study type not
/// listed in the exclude list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluatorRule {
	pub name: String,
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default)]
	pub include_study_types: Vec<String>,
	#[serde(default)]
	pub exclude_study_types: Vec<String>,
}
impl EvaluatorRule {
	pub fn any(name: &str) -> Self {
		Self {
			name: name.to_string(),
			enabled: true,
			include_study_types: Vec::new(),
			exclude_study_types: Vec::new(),
		}
	}

	pub fn admits(&self, study_type: &str) -> bool {
		if !self.enabled {
			return false;
		}
		if self.exclude_study_types.iter().any(|label| label == study_type) {
			return false;
		}

		self.include_study_types.is_empty()
			|| self.include_study_types.iter().any(|label| label == study_type)
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Composite {
	pub weights: CompositeWeights,
	pub gate_threshold: f64,
	pub min_coverage: f64,
	pub recency_half_life_years: f64,
	pub sample_size_target: u32,
}
impl Default for Composite {
	fn default() -> Self {
		Self {
			weights: CompositeWeights::default(),
			gate_threshold: 4.0,
			min_coverage: 0.5,
			recency_half_life_years: 10.0,
			sample_size_target: 1_000,
		}
	}
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CompositeWeights {
	pub relevance: f64,
	pub study_quality: f64,
	pub methodology: f64,
	pub sample_size: f64,
	pub recency: f64,
	pub replication: f64,
}
impl CompositeWeights {
	pub fn as_array(&self) -> [(&'static str, f64); 6] {
		[
			("relevance", self.relevance),
			("study_quality", self.study_quality),
			("methodology", self.methodology),
			("sample_size", self.sample_size),
			("recency", self.recency),
			("replication", self.replication),
		]
	}

	pub fn total(&self) -> f64 {
		self.as_array().iter().map(|(_, weight)| weight).sum()
	}
}
impl Default for CompositeWeights {
	fn default() -> Self {
		Self {
			relevance: 0.35,
			study_quality: 0.25,
			methodology: 0.20,
			sample_size: 0.10,
			recency: 0.05,
			replication: 0.05,
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Synthesis {
	pub map_reduce_threshold: u32,
	pub map_batch_size: u32,
}
impl Default for Synthesis {
	fn default() -> Self {
		Self { map_reduce_threshold: 15, map_batch_size: 8 }
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
	pub max_concurrency: u32,
	pub call_timeout_ms: u64,
	pub max_retries: u32,
	pub backoff_base_ms: u64,
	pub backoff_max_ms: u64,
	pub checkpoint_mode: String,
	pub abandon_inflight_on_cancel: bool,
}
impl Default for Runtime {
	fn default() -> Self {
		Self {
			max_concurrency: 8,
			call_timeout_ms: 60_000,
			max_retries: 2,
			backoff_base_ms: 250,
			backoff_max_ms: 5_000,
			checkpoint_mode: "interactive".to_string(),
			abandon_inflight_on_cancel: false,
		}
	}
}

fn default_true() -> bool {
	true
}
