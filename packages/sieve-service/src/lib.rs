pub mod context;
pub mod controller;
pub mod export;
pub mod planner;
pub mod pool;
pub mod quality;
pub mod relevance;
pub mod retrieval;
pub mod retry;
pub mod screening;
pub mod state;
pub mod store;
pub mod synthesis;

mod documenter;
mod error;
mod gate;
mod llm;

pub use context::{ReviewSettings, RunContext};
pub use controller::{Adjudicate, CheckpointDecision, CheckpointParams, StartRunRequest};
pub use documenter::Documenter;
pub use error::{CollaboratorError, Error, Result};

pub(crate) use error::PhaseError;
pub use export::{PrismaCounts, ReviewExport};
pub use pool::{CancelToken, WorkPool};
pub use retry::CallPolicy;
pub use state::{Checkpoint, CheckpointSnapshot, FailureRecord, RunState, RunSummary};
pub use store::{MemoryRunStore, PgRunStore, RunStore};

use std::{
	collections::HashMap,
	future::Future,
	pin::Pin,
	sync::{Arc, Mutex},
};

use uuid::Uuid;

use sieve_config::{Config, EmbeddingProviderConfig, LlmProviderConfig};
use sieve_domain::candidate::CorpusHit;
use sieve_providers::{
	embedding,
	llm::{self as provider_llm, Completion, CompletionRequest},
};
use sieve_storage::{db::Db, qdrant::QdrantStore};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait LlmProvider
where
	Self: Send + Sync,
{
	fn complete<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		request: CompletionRequest<'a>,
	) -> BoxFuture<'a, Result<Completion, CollaboratorError>>;
}

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>, CollaboratorError>>;
}

/// Read access to the indexed paper corpus. Results are 1-based ranked lists.
pub trait CorpusProvider
where
	Self: Send + Sync,
{
	fn search_semantic<'a>(
		&'a self,
		embedding: &'a [f32],
		top_k: u32,
	) -> BoxFuture<'a, Result<Vec<CorpusHit>, CollaboratorError>>;

	fn search_keyword<'a>(
		&'a self,
		query: &'a str,
		top_k: u32,
	) -> BoxFuture<'a, Result<Vec<CorpusHit>, CollaboratorError>>;
}

#[derive(Clone)]
pub struct Providers {
	pub llm: Arc<dyn LlmProvider>,
	pub embedding: Arc<dyn EmbeddingProvider>,
	pub corpus: Arc<dyn CorpusProvider>,
}
impl Providers {
	pub fn new(
		llm: Arc<dyn LlmProvider>,
		embedding: Arc<dyn EmbeddingProvider>,
		corpus: Arc<dyn CorpusProvider>,
	) -> Self {
		Self { llm, embedding, corpus }
	}

	/// Network-backed providers over the configured LLM, embedding endpoint, and Qdrant corpus.
	pub fn with_corpus(corpus: QdrantStore) -> Self {
		let provider = Arc::new(DefaultProviders);

		Self { llm: provider.clone(), embedding: provider, corpus: Arc::new(QdrantCorpus { corpus }) }
	}
}

pub struct SieveService {
	pub cfg: Config,
	pub providers: Providers,
	pub store: Arc<dyn RunStore>,
	active: Mutex<HashMap<Uuid, CancelToken>>,
}
impl SieveService {
	pub async fn connect(cfg: Config) -> Result<Self> {
		let db = Db::connect(&cfg.storage.postgres).await?;

		db.ensure_schema().await?;

		let qdrant = QdrantStore::new(&cfg.storage.qdrant)?;

		Ok(Self::with_providers(cfg, Providers::with_corpus(qdrant), Arc::new(PgRunStore::new(db))))
	}

	pub fn with_providers(cfg: Config, providers: Providers, store: Arc<dyn RunStore>) -> Self {
		Self { cfg, providers, store, active: Mutex::new(HashMap::new()) }
	}

	pub(crate) fn register_active(&self, run_id: Uuid) -> Result<CancelToken> {
		let mut active = self
			.active
			.lock()
			.map_err(|_| Error::Storage { message: "Active run registry is poisoned.".to_string() })?;

		if active.contains_key(&run_id) {
			return Err(Error::Conflict { message: format!("Run {run_id} is already executing.") });
		}

		let token = CancelToken::default();

		active.insert(run_id, token.clone());

		Ok(token)
	}

	pub(crate) fn release_active(&self, run_id: Uuid) {
		if let Ok(mut active) = self.active.lock() {
			active.remove(&run_id);
		}
	}

	pub(crate) fn active_token(&self, run_id: Uuid) -> Option<CancelToken> {
		self.active.lock().ok().and_then(|active| active.get(&run_id).cloned())
	}
}

struct DefaultProviders;
impl LlmProvider for DefaultProviders {
	fn complete<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		request: CompletionRequest<'a>,
	) -> BoxFuture<'a, Result<Completion, CollaboratorError>> {
		Box::pin(async move {
			provider_llm::complete(cfg, &request)
				.await
				.map_err(|err| CollaboratorError::from_provider(err, cfg.timeout_ms))
		})
	}
}
impl EmbeddingProvider for DefaultProviders {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>, CollaboratorError>> {
		Box::pin(async move {
			embedding::embed(cfg, texts)
				.await
				.map_err(|err| CollaboratorError::from_provider(err, cfg.timeout_ms))
		})
	}
}

struct QdrantCorpus {
	corpus: QdrantStore,
}
impl CorpusProvider for QdrantCorpus {
	fn search_semantic<'a>(
		&'a self,
		embedding: &'a [f32],
		top_k: u32,
	) -> BoxFuture<'a, Result<Vec<CorpusHit>, CollaboratorError>> {
		Box::pin(async move { Ok(self.corpus.search_dense(embedding, top_k).await?) })
	}

	fn search_keyword<'a>(
		&'a self,
		query: &'a str,
		top_k: u32,
	) -> BoxFuture<'a, Result<Vec<CorpusHit>, CollaboratorError>> {
		Box::pin(async move { Ok(self.corpus.search_bm25(query, top_k).await?) })
	}
}
