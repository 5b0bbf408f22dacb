//! Weighted Reciprocal Rank Fusion.
//!
//! Only rank positions are used, so lists from retrieval methods with incomparable raw scores can
//! be merged. Fusion is a full outer join: a document missing from a list simply gets no
//! contribution from it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedHit {
	pub paper_id: String,
	/// 1-based position in the list.
	pub rank: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RankedList<'a> {
	pub weight: f64,
	pub hits: &'a [RankedHit],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedHit {
	pub paper_id: String,
	pub score: f64,
	/// Best rank per input list, in input order. `None` where the list missed the document.
	pub ranks: Vec<Option<u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
	pub semantic_weight: f64,
	pub keyword_weight: f64,
	pub k: f64,
}
impl From<&sieve_config::Fusion> for FusionParams {
	fn from(cfg: &sieve_config::Fusion) -> Self {
		Self { semantic_weight: cfg.semantic_weight, keyword_weight: cfg.keyword_weight, k: cfg.rrf_k }
	}
}
impl Default for FusionParams {
	fn default() -> Self {
		Self::from(&sieve_config::Fusion::default())
	}
}

pub fn reciprocal_rank(weight: f64, k: f64, rank: u32) -> f64 {
	weight / (k + f64::from(rank.max(1)))
}

/// Fuses a semantic and a keyword list with the configured weights.
pub fn fuse_pair(semantic: &[RankedHit], keyword: &[RankedHit], params: FusionParams) -> Vec<FusedHit> {
	fuse(
		&[
			RankedList { weight: params.semantic_weight, hits: semantic },
			RankedList { weight: params.keyword_weight, hits: keyword },
		],
		params.k,
	)
}

/// Fuses any number of weighted lists. Output is ordered by score descending, then paper id, so
/// the ranking does not depend on the order the lists are supplied in.
pub fn fuse(lists: &[RankedList<'_>], k: f64) -> Vec<FusedHit> {
	let mut ranks: HashMap<&str, Vec<Option<u32>>> = HashMap::new();

	for (index, list) in lists.iter().enumerate() {
		for hit in list.hits {
			let slots = ranks.entry(hit.paper_id.as_str()).or_insert_with(|| vec![None; lists.len()]);
			let rank = hit.rank.max(1);

			slots[index] = Some(slots[index].map_or(rank, |existing| existing.min(rank)));
		}
	}

	let mut fused: Vec<FusedHit> = ranks
		.into_iter()
		.map(|(paper_id, slots)| {
			let mut contributions: Vec<f64> = slots
				.iter()
				.zip(lists)
				.filter_map(|(rank, list)| rank.map(|rank| reciprocal_rank(list.weight, k, rank)))
				.collect();

			// Summing in a fixed order keeps scores bit-identical under list permutation.
			contributions.sort_by(|a, b| a.total_cmp(b));

			FusedHit { paper_id: paper_id.to_string(), score: contributions.iter().sum(), ranks: slots }
		})
		.collect();

	fused.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.paper_id.cmp(&b.paper_id)));

	fused
}
