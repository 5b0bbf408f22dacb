//! Read-only Qdrant adapter for the literature corpus.
//!
//! Each point carries one paper. The `dense` named vector holds the abstract embedding and the
//! `bm25` sparse vector is computed server-side from the title and abstract.

use std::collections::HashMap;

use qdrant_client::qdrant::{
	Document, PointId, Query, QueryPointsBuilder, ScoredPoint, Value, point_id::PointIdOptions,
	value::Kind,
};

use crate::{Error, Result};
use sieve_domain::candidate::{CorpusHit, PaperMetadata};

pub const DENSE_VECTOR_NAME: &str = "dense";
pub const BM25_VECTOR_NAME: &str = "bm25";
pub const BM25_MODEL: &str = "qdrant/bm25";

pub struct QdrantStore {
	pub client: qdrant_client::Qdrant,
	pub collection: String,
	pub vector_dim: u32,
}
impl QdrantStore {
	pub fn new(cfg: &sieve_config::Qdrant) -> Result<Self> {
		let client = qdrant_client::Qdrant::from_url(&cfg.url).build()?;

		Ok(Self { client, collection: cfg.collection.clone(), vector_dim: cfg.vector_dim })
	}

	pub async fn search_dense(&self, vector: &[f32], top_k: u32) -> Result<Vec<CorpusHit>> {
		if vector.len() != self.vector_dim as usize {
			return Err(Error::InvalidArgument(format!(
				"query vector has {} dimensions; the collection expects {}.",
				vector.len(),
				self.vector_dim
			)));
		}

		let search = QueryPointsBuilder::new(self.collection.clone())
			.query(Query::new_nearest(vector.to_vec()))
			.using(DENSE_VECTOR_NAME)
			.with_payload(true)
			.limit(u64::from(top_k));
		let response = self.client.query(search).await?;

		Ok(hits_from_points(&response.result))
	}

	pub async fn search_bm25(&self, text: &str, top_k: u32) -> Result<Vec<CorpusHit>> {
		let search = QueryPointsBuilder::new(self.collection.clone())
			.query(Query::new_nearest(Document::new(text.to_string(), BM25_MODEL)))
			.using(BM25_VECTOR_NAME)
			.with_payload(true)
			.limit(u64::from(top_k));
		let response = self.client.query(search).await?;

		Ok(hits_from_points(&response.result))
	}
}

/// Converts scored points to 1-based ranked hits, skipping points without a usable paper id.
pub fn hits_from_points(points: &[ScoredPoint]) -> Vec<CorpusHit> {
	let mut out = Vec::with_capacity(points.len());

	for point in points {
		let Some(paper_id) = payload_string(&point.payload, "paper_id")
			.or_else(|| point.id.as_ref().and_then(point_id_to_string))
		else {
			continue;
		};

		out.push(CorpusHit {
			rank: out.len() as u32 + 1,
			paper_id,
			score: f64::from(point.score),
			title: payload_string(&point.payload, "title").unwrap_or_default(),
			abstract_text: payload_string(&point.payload, "abstract").unwrap_or_default(),
			metadata: PaperMetadata {
				year: payload_i32(&point.payload, "year"),
				journal: payload_string(&point.payload, "journal"),
				authors: payload_strings(&point.payload, "authors"),
				doi: payload_string(&point.payload, "doi"),
				publication_types: payload_strings(&point.payload, "publication_types"),
				replication_count: payload_i32(&point.payload, "replication_count")
					.and_then(|count| u32::try_from(count).ok()),
			},
		});
	}

	out
}

fn point_id_to_string(point_id: &PointId) -> Option<String> {
	match &point_id.point_id_options {
		Some(PointIdOptions::Uuid(id)) => Some(id.to_string()),
		Some(PointIdOptions::Num(id)) => Some(id.to_string()),
		None => None,
	}
}

fn payload_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
	let value = payload.get(key)?;

	match &value.kind {
		Some(Kind::StringValue(text)) if !text.trim().is_empty() => Some(text.to_string()),
		_ => None,
	}
}

fn payload_strings(payload: &HashMap<String, Value>, key: &str) -> Vec<String> {
	let Some(value) = payload.get(key) else {
		return Vec::new();
	};

	match &value.kind {
		Some(Kind::ListValue(list)) => list
			.values
			.iter()
			.filter_map(|item| match &item.kind {
				Some(Kind::StringValue(text)) => Some(text.to_string()),
				_ => None,
			})
			.collect(),
		Some(Kind::StringValue(text)) => vec![text.to_string()],
		_ => Vec::new(),
	}
}

fn payload_i32(payload: &HashMap<String, Value>, key: &str) -> Option<i32> {
	let value = payload.get(key)?;

	match &value.kind {
		Some(Kind::IntegerValue(value)) => i32::try_from(*value).ok(),
		Some(Kind::DoubleValue(value)) =>
			if value.fract() == 0.0 {
				i32::try_from(*value as i64).ok()
			} else {
				None
			},
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn point(id: &str, payload: Vec<(&str, Value)>) -> ScoredPoint {
		ScoredPoint {
			id: Some(PointId::from(id.to_string())),
			payload: payload.into_iter().map(|(key, value)| (key.to_string(), value)).collect(),
			score: 0.5,
			..Default::default()
		}
	}

	#[test]
	fn decodes_paper_payload_and_assigns_ranks() {
		let points = vec![
			point("7f7c3a52-8d0a-4c55-9d7f-0c5a1b2c3d4e", vec![
				("paper_id", Value::from("pmid:100")),
				("title", Value::from("Metformin and cancer")),
				("year", Value::from(2019_i64)),
				("publication_types", Value::from(vec!["Meta-Analysis".to_string()])),
			]),
			point("2b1c3a52-8d0a-4c55-9d7f-0c5a1b2c3d4e", vec![("title", Value::from("No id"))]),
		];
		let hits = hits_from_points(&points);

		assert_eq!(hits.len(), 2);
		assert_eq!(hits[0].paper_id, "pmid:100");
		assert_eq!(hits[0].rank, 1);
		assert_eq!(hits[0].metadata.year, Some(2019));
		assert_eq!(hits[0].metadata.publication_types, vec!["Meta-Analysis".to_string()]);
		assert_eq!(hits[1].paper_id, "2b1c3a52-8d0a-4c55-9d7f-0c5a1b2c3d4e");
		assert_eq!(hits[1].rank, 2);
	}
}
