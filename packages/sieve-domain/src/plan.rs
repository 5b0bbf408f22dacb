use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
	Semantic,
	Keyword,
	HypotheticalDocument,
	Hybrid,
}
impl Strategy {
	pub const ALL: [Strategy; 4] =
		[Strategy::Semantic, Strategy::Keyword, Strategy::HypotheticalDocument, Strategy::Hybrid];

	pub fn as_str(self) -> &'static str {
		match self {
			Strategy::Semantic => "semantic",
			Strategy::Keyword => "keyword",
			Strategy::HypotheticalDocument => "hypothetical_document",
			Strategy::Hybrid => "hybrid",
		}
	}

	pub fn parse(raw: &str) -> Option<Strategy> {
		match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
			"semantic" => Some(Strategy::Semantic),
			"keyword" | "full_text" => Some(Strategy::Keyword),
			"hypothetical_document" | "hyde" => Some(Strategy::HypotheticalDocument),
			"hybrid" => Some(Strategy::Hybrid),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
	pub query_id: Uuid,
	pub strategy: Strategy,
	pub text: String,
	/// Provenance label copied onto every candidate the query retrieves.
	pub label: String,
	/// Drafted abstract whose embedding drives a hypothetical-document search.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub hypothetical_document: Option<String>,
}

/// Ordered query set for one run. Read-only once planning completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPlan {
	pub queries: Vec<Query>,
}
impl SearchPlan {
	pub fn strategies(&self) -> Vec<Strategy> {
		let mut out: Vec<Strategy> = self.queries.iter().map(|query| query.strategy).collect();

		out.sort();
		out.dedup();

		out
	}

	pub fn covers_all_strategies(&self) -> bool {
		self.strategies().len() == Strategy::ALL.len()
	}
}
