//! Searching phase: executes the plan against the corpus and builds the candidate pool.
//!
//! Each query runs as one pool unit. Hybrid queries fuse their semantic and keyword lists with
//! weighted RRF; single-method queries contribute `weight / (k + rank)` per hit. A paper's pool
//! score is the sum of its contributions across queries, so the pool order never depends on raw
//! backend scores.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
	CollaboratorError, PhaseError, Providers, RunContext, WorkPool, state::RunState,
};
use sieve_domain::{
	audit::AuditEntry,
	candidate::{Candidate, CorpusHit, ProvenanceTag},
	fusion::{self, FusionParams, RankedHit},
	phase::Phase,
	plan::{Query, Strategy},
};

const ACTOR: &str = "retriever";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalStats {
	pub queries_executed: usize,
	pub queries_failed: usize,
	/// Hits summed over every query, before deduplication.
	pub raw_hits: usize,
	pub unique_candidates: usize,
	pub duplicates_merged: usize,
}

#[derive(Debug, Clone)]
struct ScoredHit {
	hit: CorpusHit,
	rank: u32,
	contribution: f64,
}

#[derive(Debug)]
enum QueryFailure {
	/// The corpus itself could not be searched; fatal to the phase.
	Corpus(CollaboratorError),
	/// The query could not be embedded; the query is skipped.
	Embedding(CollaboratorError),
}

struct QueryOutcome {
	query: Query,
	result: Result<Vec<ScoredHit>, QueryFailure>,
}

pub(crate) async fn run(
	ctx: &Arc<RunContext>,
	providers: &Providers,
	state: &mut RunState,
) -> Result<(), PhaseError> {
	let Some(plan) = state.plan.clone() else {
		return Err(PhaseError::invariant("Searching requires an approved search plan."));
	};
	let pool = WorkPool::new(
		ctx.settings.runtime.max_concurrency,
		ctx.cancel.clone(),
		ctx.settings.runtime.abandon_inflight_on_cancel,
	);
	let units = plan
		.queries
		.iter()
		.cloned()
		.map(|query| {
			let ctx = ctx.clone();
			let providers = providers.clone();

			async move {
				let result = execute(&ctx, &providers, &query).await;

				QueryOutcome { query, result }
			}
		})
		.collect();
	let run = pool.run_all(units).await;
	let mut pool_index: HashMap<String, usize> = HashMap::new();
	let mut candidates: Vec<Candidate> = Vec::new();
	let mut stats = RetrievalStats::default();
	let mut corpus_failure = None;

	for (_, outcome) in run.completed {
		let QueryOutcome { query, result } = outcome;

		match result {
			Ok(hits) => {
				stats.queries_executed += 1;
				stats.raw_hits += hits.len();

				state.audit(
					AuditEntry::new(ACTOR, "query_executed")
						.phase(Phase::Searching)
						.subject(query.label.clone())
						.input(query.text.clone())
						.output(format!("{} hits.", hits.len()))
						.metrics(json!({
							"query_id": query.query_id,
							"strategy": query.strategy.as_str(),
							"hits": hits.len(),
						})),
				);

				for scored in hits {
					let tag = ProvenanceTag {
						query_id: query.query_id,
						strategy: query.strategy,
						label: query.label.clone(),
						rank: scored.rank,
						score: scored.contribution,
					};
					let index = match pool_index.get(&scored.hit.paper_id) {
						Some(index) => *index,
						None => {
							let CorpusHit { paper_id, title, abstract_text, metadata, .. } = scored.hit;

							pool_index.insert(paper_id.clone(), candidates.len());
							candidates.push(Candidate::new(paper_id, title, abstract_text, metadata));

							candidates.len() - 1
						},
					};

					candidates[index].add_provenance(tag);
				}
			},
			Err(failure) => {
				stats.queries_failed += 1;

				let (kind, err) = match &failure {
					QueryFailure::Corpus(err) => ("corpus", err),
					QueryFailure::Embedding(err) => ("embedding", err),
				};

				state.audit(
					AuditEntry::new(ACTOR, "query_failed")
						.phase(Phase::Searching)
						.subject(query.label.clone())
						.input(query.text.clone())
						.output("No hits recorded.")
						.rationale(err.to_string())
						.metrics(json!({
							"query_id": query.query_id,
							"strategy": query.strategy.as_str(),
							"failed_call": kind,
							"error_kind": err.kind(),
						})),
				);

				if let QueryFailure::Corpus(err) = failure
					&& corpus_failure.is_none()
				{
					corpus_failure = Some(err);
				}
			},
		}
	}

	for (index, panic) in run.panicked {
		stats.queries_failed += 1;

		state.audit(
			AuditEntry::new(ACTOR, "query_failed")
				.phase(Phase::Searching)
				.subject(format!("unit-{index}"))
				.rationale(panic),
		);
	}

	if let Some(err) = corpus_failure {
		return Err(PhaseError::corpus_unavailable(err.to_string()));
	}
	if run.cancelled {
		return Err(PhaseError::Cancelled);
	}

	candidates.sort_by(|a, b| {
		b.retrieval_score.total_cmp(&a.retrieval_score).then_with(|| a.paper_id.cmp(&b.paper_id))
	});

	stats.unique_candidates = candidates.len();
	stats.duplicates_merged = stats.raw_hits - stats.unique_candidates;

	state.audit(
		AuditEntry::new(ACTOR, "candidates_merged")
			.phase(Phase::Searching)
			.input(format!("{} hits from {} queries.", stats.raw_hits, stats.queries_executed))
			.output(format!("{} unique candidates.", stats.unique_candidates))
			.rationale("Duplicate papers were merged and their provenance accumulated.")
			.metrics(json!(stats)),
	);
	tracing::info!(
		run_id = %ctx.run_id,
		raw_hits = stats.raw_hits,
		unique = stats.unique_candidates,
		"Candidate pool built."
	);

	state.candidates = candidates;
	state.retrieval = Some(stats);

	Ok(())
}

async fn execute(
	ctx: &RunContext,
	providers: &Providers,
	query: &Query,
) -> Result<Vec<ScoredHit>, QueryFailure> {
	let params = FusionParams::from(&ctx.settings.fusion);
	let top_k = ctx.settings.planner.top_k;

	match query.strategy {
		Strategy::Semantic => {
			let hits = semantic_search(ctx, providers, &query.text, top_k).await?;

			Ok(single_list(hits, params.semantic_weight, params.k))
		},
		Strategy::HypotheticalDocument => {
			let document = query.hypothetical_document.as_deref().unwrap_or(&query.text);
			let hits = semantic_search(ctx, providers, document, top_k).await?;

			Ok(single_list(hits, params.semantic_weight, params.k))
		},
		Strategy::Keyword => {
			let hits = keyword_search(ctx, providers, &query.text, top_k).await?;

			Ok(single_list(hits, params.keyword_weight, params.k))
		},
		Strategy::Hybrid => {
			let semantic = semantic_search(ctx, providers, &query.text, top_k).await?;
			let keyword = keyword_search(ctx, providers, &query.text, top_k).await?;

			Ok(hybrid(semantic, keyword, params))
		},
	}
}

async fn semantic_search(
	ctx: &RunContext,
	providers: &Providers,
	text: &str,
	top_k: u32,
) -> Result<Vec<CorpusHit>, QueryFailure> {
	let texts = vec![text.to_string()];
	let vectors = ctx
		.policy
		.run("embedding", || providers.embedding.embed(&ctx.embedding, &texts))
		.await
		.map_err(QueryFailure::Embedding)?;
	let Some(vector) = vectors.into_iter().next() else {
		return Err(QueryFailure::Embedding(CollaboratorError::malformed(
			"Embedding provider returned no vector.",
		)));
	};

	ctx.policy
		.run("corpus_semantic", || providers.corpus.search_semantic(&vector, top_k))
		.await
		.map_err(QueryFailure::Corpus)
}

async fn keyword_search(
	ctx: &RunContext,
	providers: &Providers,
	text: &str,
	top_k: u32,
) -> Result<Vec<CorpusHit>, QueryFailure> {
	ctx.policy
		.run("corpus_keyword", || providers.corpus.search_keyword(text, top_k))
		.await
		.map_err(QueryFailure::Corpus)
}

/// Orders by backend rank and drops repeated papers, keeping the best-ranked copy.
fn dedupe_ranked(mut hits: Vec<CorpusHit>) -> Vec<CorpusHit> {
	hits.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.paper_id.cmp(&b.paper_id)));

	let mut seen = std::collections::HashSet::new();

	hits.retain(|hit| seen.insert(hit.paper_id.clone()));

	hits
}

fn single_list(hits: Vec<CorpusHit>, weight: f64, k: f64) -> Vec<ScoredHit> {
	dedupe_ranked(hits)
		.into_iter()
		.enumerate()
		.map(|(position, hit)| {
			let rank = position as u32 + 1;

			ScoredHit { contribution: fusion::reciprocal_rank(weight, k, rank), rank, hit }
		})
		.collect()
}

fn hybrid(semantic: Vec<CorpusHit>, keyword: Vec<CorpusHit>, params: FusionParams) -> Vec<ScoredHit> {
	let semantic = dedupe_ranked(semantic);
	let keyword = dedupe_ranked(keyword);
	let ranked = |hits: &[CorpusHit]| -> Vec<RankedHit> {
		hits.iter()
			.enumerate()
			.map(|(position, hit)| RankedHit { paper_id: hit.paper_id.clone(), rank: position as u32 + 1 })
			.collect()
	};
	let fused = fusion::fuse_pair(&ranked(&semantic), &ranked(&keyword), params);
	let mut records: HashMap<String, CorpusHit> = HashMap::new();

	for hit in keyword.into_iter().chain(semantic) {
		records.insert(hit.paper_id.clone(), hit);
	}

	fused
		.into_iter()
		.enumerate()
		.filter_map(|(position, fused)| {
			records.remove(&fused.paper_id).map(|hit| ScoredHit {
				hit,
				rank: position as u32 + 1,
				contribution: fused.score,
			})
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use sieve_domain::candidate::PaperMetadata;

	fn hit(id: &str, rank: u32) -> CorpusHit {
		CorpusHit {
			paper_id: id.to_string(),
			rank,
			score: 0.0,
			title: format!("Title {id}"),
			abstract_text: String::new(),
			metadata: PaperMetadata::default(),
		}
	}

	#[test]
	fn hybrid_keeps_single_list_papers_and_ranks_overlap_first() {
		let out = hybrid(
			vec![hit("both", 1), hit("semantic_only", 2)],
			vec![hit("both", 1), hit("keyword_only", 2)],
			FusionParams::default(),
		);
		let ids: Vec<&str> = out.iter().map(|scored| scored.hit.paper_id.as_str()).collect();

		assert_eq!(ids, vec!["both", "semantic_only", "keyword_only"]);
		assert!(out.iter().all(|scored| scored.contribution > 0.0));
		assert_eq!(out[0].rank, 1);
	}

	#[test]
	fn single_list_reranks_by_backend_rank_and_dedupes() {
		let out = single_list(vec![hit("b", 2), hit("a", 1), hit("b", 3)], 0.4, 60.0);

		assert_eq!(out.len(), 2);
		assert_eq!(out[0].hit.paper_id, "a");
		assert_eq!(out[1].rank, 2);
		assert!((out[0].contribution - 0.4 / 61.0).abs() < 1e-12);
	}
}
