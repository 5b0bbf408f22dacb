mod review {
	mod checkpoints;
	mod persistence;
	mod scenarios;

	use std::{
		collections::{HashMap, HashSet},
		sync::{
			Arc,
			atomic::{AtomicBool, AtomicUsize, Ordering},
		},
		time::Duration,
	};

	use serde_json::{Map, Value, json};
	use uuid::Uuid;

	use sieve_config::{
		Composite, Config, EmbeddingProviderConfig, Filter, Fusion, LlmProviderConfig, Planner,
		Postgres, Qdrant, Quality, Relevance, Runtime, Service, Storage, Synthesis,
	};
	use sieve_domain::{
		candidate::{CorpusHit, PaperMetadata},
		question::{Pico, ResearchQuestion},
	};
	use sieve_providers::llm::{Completion, CompletionRequest};
	use sieve_service::{
		BoxFuture, CollaboratorError, CorpusProvider, EmbeddingProvider, LlmProvider,
		MemoryRunStore, Providers, RunStore, SieveService, StartRunRequest,
	};

	/// Answers every prompt by the first required field of its schema, the way a well-behaved model
	/// would.
	#[derive(Default)]
	pub struct ScriptedLlm {
		/// Relevance score per paper; unlisted papers score 5.
		pub relevance: HashMap<String, u8>,
		/// Papers whose risk-of-bias call never returns within the call timeout.
		pub stalled_risk_of_bias: HashSet<String>,
		/// Papers whose risk-of-bias call crashes the evaluator.
		pub crashing_risk_of_bias: HashSet<String>,
		/// Text the model appends to every narrative it writes.
		pub narrative_suffix: Option<String>,
		/// How long planning takes to answer.
		pub plan_delay: Option<Duration>,
		pub plan_calls: AtomicUsize,
		pub calls: AtomicUsize,
	}
	impl ScriptedLlm {
		fn reply(&self, input: &Value, required: &str) -> Option<Value> {
			let value = match required {
				"queries" => {
					self.plan_calls.fetch_add(1, Ordering::SeqCst);

					plan_reply()
				},
				"abstract" => json!({
					"abstract": "Metformin use was associated with lower colorectal cancer incidence."
				}),
				"scores" => {
					let scores: Vec<Value> = input["papers"]
						.as_array()
						.map(Vec::as_slice)
						.unwrap_or_default()
						.iter()
						.filter_map(|paper| paper["paper_id"].as_str())
						.map(|paper_id| {
							let score = self.relevance.get(paper_id).copied().unwrap_or(5);

							json!({
								"paper_id": paper_id,
								"score": score,
								"rationale": format!("Scored {score} against the PICO question."),
							})
						})
						.collect();

					json!({ "scores": scores })
				},
				"design" => json!({
					"design": "randomized_trial",
					"rationale": "Participants were randomly allocated.",
					"confidence": "high",
				}),
				"domains" => json!({
					"domains": [
						{ "domain": "randomization", "rating": "low" },
						{ "domain": "missing_outcome_data", "rating": "low" },
					],
					"overall": "low",
					"confidence": "high",
				}),
				"key_findings" => json!({
					"population": "adults with type 2 diabetes",
					"intervention": "metformin",
					"comparison": "sulfonylurea",
					"outcome": "colorectal cancer incidence",
					"sample_size": 2400,
					"key_findings": ["Lower colorectal cancer incidence on metformin."],
					"confidence": "medium",
				}),
				"items" => json!({
					"items": [
						{ "item": "Protocol registration", "satisfied": true },
						{ "item": "Risk of bias assessment", "satisfied": true },
					],
					"confidence": "medium",
				}),
				"themes" => {
					let mut tokens = Vec::new();

					citation_tokens(input, &mut tokens);
					tokens.push(format!("[{}]", Uuid::new_v4()));

					json!({
						"themes": [{
							"title": "Cancer incidence",
							"summary": "Trials consistently reported lower incidence.",
							"citations": tokens,
						}]
					})
				},
				"narrative" => {
					let mut tokens = Vec::new();

					citation_tokens(input, &mut tokens);

					let narrative = tokens
						.iter()
						.enumerate()
						.map(|(index, token)| format!("Study {} reported lower incidence {token}.", index + 1))
						.collect::<Vec<_>>()
						.join(" ");
					let narrative = match &self.narrative_suffix {
						Some(suffix) => format!("{narrative}{suffix}"),
						None => narrative,
					};

					json!({ "narrative": narrative })
				},
				_ => return None,
			};

			Some(value)
		}
	}
	impl LlmProvider for ScriptedLlm {
		fn complete<'a>(
			&'a self,
			cfg: &'a LlmProviderConfig,
			request: CompletionRequest<'a>,
		) -> BoxFuture<'a, Result<Completion, CollaboratorError>> {
			Box::pin(async move {
				self.calls.fetch_add(1, Ordering::SeqCst);

				let input: Value = serde_json::from_str(request.user).unwrap_or(Value::Null);
				let required = request.schema["required"][0].as_str().unwrap_or_default().to_string();

				if required == "domains"
					&& input["paper_id"]
						.as_str()
						.is_some_and(|paper_id| self.stalled_risk_of_bias.contains(paper_id))
				{
					tokio::time::sleep(Duration::from_secs(30)).await;
				}
				if required == "domains"
					&& let Some(paper_id) = input["paper_id"].as_str()
					&& self.crashing_risk_of_bias.contains(paper_id)
				{
					panic!("Risk-of-bias model crashed on {paper_id}.");
				}
				if required == "queries"
					&& let Some(delay) = self.plan_delay
				{
					tokio::time::sleep(delay).await;
				}

				let value = self
					.reply(&input, &required)
					.ok_or_else(|| CollaboratorError::malformed("Unexpected schema."))?;

				Ok(Completion { value, model: cfg.model.clone() })
			})
		}
	}

	pub struct FlatEmbedding;
	impl EmbeddingProvider for FlatEmbedding {
		fn embed<'a>(
			&'a self,
			_cfg: &'a EmbeddingProviderConfig,
			texts: &'a [String],
		) -> BoxFuture<'a, Result<Vec<Vec<f32>>, CollaboratorError>> {
			let vectors = texts.iter().map(|_| vec![0.25; 4]).collect();

			Box::pin(async move { Ok(vectors) })
		}
	}

	/// Returns every paper for every search: semantic in corpus order, keyword reversed.
	pub struct FixedCorpus {
		pub papers: Vec<CorpusHit>,
		pub healthy: AtomicBool,
		pub calls: AtomicUsize,
	}
	impl FixedCorpus {
		pub fn new(papers: Vec<CorpusHit>) -> Self {
			Self { papers, healthy: AtomicBool::new(true), calls: AtomicUsize::new(0) }
		}

		fn ranked<'p>(
			&self,
			papers: impl Iterator<Item = &'p CorpusHit>,
			top_k: u32,
		) -> Result<Vec<CorpusHit>, CollaboratorError> {
			self.calls.fetch_add(1, Ordering::SeqCst);

			if !self.healthy.load(Ordering::SeqCst) {
				return Err(CollaboratorError::unavailable("Corpus connection refused."));
			}

			Ok(papers
				.take(top_k as usize)
				.enumerate()
				.map(|(index, paper)| CorpusHit {
					rank: index as u32 + 1,
					score: 1.0 / (index as f64 + 1.0),
					..paper.clone()
				})
				.collect())
		}
	}
	impl CorpusProvider for FixedCorpus {
		fn search_semantic<'a>(
			&'a self,
			_embedding: &'a [f32],
			top_k: u32,
		) -> BoxFuture<'a, Result<Vec<CorpusHit>, CollaboratorError>> {
			let result = self.ranked(self.papers.iter(), top_k);

			Box::pin(async move { result })
		}

		fn search_keyword<'a>(
			&'a self,
			_query: &'a str,
			top_k: u32,
		) -> BoxFuture<'a, Result<Vec<CorpusHit>, CollaboratorError>> {
			let result = self.ranked(self.papers.iter().rev(), top_k);

			Box::pin(async move { result })
		}
	}

	pub struct Harness {
		pub service: SieveService,
		pub llm: Arc<ScriptedLlm>,
		pub corpus: Arc<FixedCorpus>,
	}

	pub fn harness(cfg: Config, llm: ScriptedLlm, papers: Vec<CorpusHit>) -> Harness {
		harness_with_store(cfg, llm, papers, Arc::new(MemoryRunStore::new()))
	}

	pub fn harness_with_store(
		cfg: Config,
		llm: ScriptedLlm,
		papers: Vec<CorpusHit>,
		store: Arc<dyn RunStore>,
	) -> Harness {
		let llm = Arc::new(llm);
		let corpus = Arc::new(FixedCorpus::new(papers));
		let providers = Providers::new(llm.clone(), Arc::new(FlatEmbedding), corpus.clone());

		Harness { service: SieveService::with_providers(cfg, providers, store), llm, corpus }
	}

	pub fn test_config(checkpoint_mode: &str) -> Config {
		Config {
			service: Service { http_bind: "127.0.0.1:0".to_string(), log_level: "info".to_string() },
			storage: Storage {
				postgres: Postgres {
					dsn: "postgres://postgres@127.0.0.1:1/sieve".to_string(),
					pool_max_conns: 2,
				},
				qdrant: Qdrant {
					url: "http://127.0.0.1:1".to_string(),
					collection: "sieve_test".to_string(),
					vector_dim: 4,
				},
			},
			providers: sieve_config::Providers {
				embedding: EmbeddingProviderConfig {
					provider_id: "test".to_string(),
					api_base: "http://127.0.0.1:1".to_string(),
					api_key: "test-key".to_string(),
					path: "/".to_string(),
					model: "test-embed".to_string(),
					dimensions: 4,
					timeout_ms: 1_000,
					default_headers: Map::new(),
				},
				llm: LlmProviderConfig {
					provider_id: "test".to_string(),
					api_base: "http://127.0.0.1:1".to_string(),
					api_key: "test-key".to_string(),
					path: "/".to_string(),
					model: "test-llm".to_string(),
					temperature: 0.0,
					timeout_ms: 1_000,
					default_headers: Map::new(),
				},
			},
			planner: Planner::default(),
			fusion: Fusion::default(),
			filter: Filter::default(),
			relevance: Relevance::default(),
			quality: Quality::default(),
			composite: Composite::default(),
			synthesis: Synthesis::default(),
			runtime: Runtime {
				call_timeout_ms: 200,
				max_retries: 1,
				backoff_base_ms: 1,
				backoff_max_ms: 5,
				checkpoint_mode: checkpoint_mode.to_string(),
				..Runtime::default()
			},
		}
	}

	pub fn question() -> ResearchQuestion {
		ResearchQuestion {
			text: "Does metformin reduce colorectal cancer incidence in adults with type 2 diabetes?"
				.to_string(),
			pico: Pico {
				population: "adults with type 2 diabetes".to_string(),
				intervention: "metformin".to_string(),
				comparison: Some("sulfonylurea".to_string()),
				outcome: "colorectal cancer incidence".to_string(),
			},
			inclusion_criteria: vec!["human studies".to_string()],
			exclusion_criteria: vec!["case reports".to_string()],
		}
	}

	pub fn request(overrides: Option<Value>) -> StartRunRequest {
		StartRunRequest { question: question(), overrides }
	}

	/// A randomized trial that every scripted evaluator rates well.
	pub fn trial(paper_id: &str) -> CorpusHit {
		paper(
			paper_id,
			&format!("Metformin and colorectal cancer incidence: trial {paper_id}"),
			"Adults with type 2 diabetes were randomized to metformin or a sulfonylurea.",
			"Randomized Controlled Trial",
		)
	}

	pub fn paper(paper_id: &str, title: &str, abstract_text: &str, publication_type: &str) -> CorpusHit {
		CorpusHit {
			paper_id: paper_id.to_string(),
			rank: 0,
			score: 0.0,
			title: title.to_string(),
			abstract_text: abstract_text.to_string(),
			metadata: PaperMetadata {
				year: Some(2021),
				journal: Some("Diabetes Care".to_string()),
				authors: vec!["Okafor N".to_string()],
				doi: Some(format!("10.1000/{paper_id}")),
				publication_types: vec![publication_type.to_string()],
				replication_count: None,
			},
		}
	}

	pub fn trials(prefix: &str, count: usize) -> Vec<CorpusHit> {
		(1..=count).map(|index| trial(&format!("{prefix}{index:02}"))).collect()
	}

	fn plan_reply() -> Value {
		let query = |strategy: &str, text: &str| json!({ "strategy": strategy, "text": text });

		json!({
			"queries": [
				query("semantic", "metformin colorectal cancer risk in type 2 diabetes"),
				query("semantic", "biguanide therapy and incident colon cancer"),
				query("keyword", "metformin AND colorectal neoplasms"),
				query("keyword", "metformin cancer incidence diabetes"),
				query("hypothetical_document", "metformin colorectal cancer trial abstract"),
				query("hypothetical_document", "metformin cancer prevention cohort abstract"),
				query("hybrid", "metformin colorectal cancer incidence"),
				query("hybrid", "metformin sulfonylurea cancer outcomes"),
			],
			"hypothetical_abstract": "In adults with type 2 diabetes, metformin lowered colorectal cancer incidence compared with sulfonylureas.",
		})
	}

	/// Collects every `[uuid]` citation token anywhere in a prompt payload, in order.
	fn citation_tokens(value: &Value, out: &mut Vec<String>) {
		match value {
			Value::String(text) => {
				if let Some(inner) = text.strip_prefix('[').and_then(|rest| rest.strip_suffix(']'))
					&& Uuid::parse_str(inner).is_ok()
					&& !out.contains(text)
				{
					out.push(text.clone());
				}
			},
			Value::Array(items) => items.iter().for_each(|item| citation_tokens(item, out)),
			Value::Object(map) => map.values().for_each(|item| citation_tokens(item, out)),
			_ => {},
		}
	}
}
