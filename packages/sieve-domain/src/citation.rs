//! UUID citations and the final numbering pass.
//!
//! Intermediate synthesis output refers to papers only as `[uuid]` tokens (or comma-separated
//! groups of them). `resolve` is the single deterministic pass that turns them into sequential
//! bracketed numbers in first-appearance order.

use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

const UUID_PATTERN: &str =
	r"[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}";

static PATTERNS: LazyLock<Option<Patterns>> = LazyLock::new(|| Patterns::compile().ok());

struct Patterns {
	/// A bracketed UUID group (capture 1) or a bracketed number group (capture 2).
	token: Regex,
	uuid: Regex,
	numbers: Regex,
}
impl Patterns {
	fn compile() -> Result<Self, regex::Error> {
		Ok(Self {
			token: Regex::new(&format!(
				r"\[\s*({UUID_PATTERN}(?:\s*[,;]\s*{UUID_PATTERN})*)\s*\]|\[(\d+(?:\s*,\s*\d+)*)\]"
			))?,
			uuid: Regex::new(UUID_PATTERN)?,
			numbers: Regex::new(r"\[(\d+(?:,\s*\d+)*)\]")?,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
	pub citation_id: Uuid,
	pub paper_id: String,
}
impl Citation {
	pub fn token(&self) -> String {
		format!("[{}]", self.citation_id)
	}
}

/// Citations minted for one synthesis pass, in mint order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationRegistry {
	citations: Vec<Citation>,
}
impl CitationRegistry {
	pub fn mint<I, S>(paper_ids: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			citations: paper_ids
				.into_iter()
				.map(|paper_id| Citation { citation_id: Uuid::new_v4(), paper_id: paper_id.into() })
				.collect(),
		}
	}

	pub fn from_citations(citations: Vec<Citation>) -> Self {
		Self { citations }
	}

	pub fn citations(&self) -> &[Citation] {
		&self.citations
	}

	pub fn len(&self) -> usize {
		self.citations.len()
	}

	pub fn is_empty(&self) -> bool {
		self.citations.is_empty()
	}

	pub fn get(&self, citation_id: &Uuid) -> Option<&Citation> {
		self.citations.iter().find(|citation| &citation.citation_id == citation_id)
	}

	pub fn contains(&self, citation_id: &Uuid) -> bool {
		self.get(citation_id).is_some()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
	pub number: u32,
	pub citation_id: Uuid,
	pub paper_id: String,
	/// False when the narrative never cited the paper and it was appended to the list.
	pub cited: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedReport {
	pub text: String,
	pub references: Vec<Reference>,
	/// Tokens that did not belong to the registry and were removed.
	pub unknown_citations: Vec<String>,
	pub uncited: Vec<Uuid>,
}
impl ResolvedReport {
	/// Checks that every minted citation resolves exactly once and every bracketed number in the
	/// text resolves to a reference.
	pub fn verify(&self, registry: &CitationRegistry) -> Result<()> {
		for citation in registry.citations() {
			let count = self
				.references
				.iter()
				.filter(|reference| reference.citation_id == citation.citation_id)
				.count();

			if count != 1 {
				return Err(Error::UnknownCitation {
					citation: citation.citation_id.to_string(),
					message: format!("resolved {count} times."),
				});
			}
		}
		for number in bracket_numbers(&self.text) {
			if !self.references.iter().any(|reference| reference.number == number) {
				return Err(Error::UnknownCitation {
					citation: number.to_string(),
					message: "does not resolve to a reference.".to_string(),
				});
			}
		}

		Ok(())
	}
}

/// UUIDs referenced by citation groups in `text`, in order of first appearance.
pub fn extract_citation_ids(text: &str) -> Vec<Uuid> {
	let Some(patterns) = PATTERNS.as_ref() else {
		return Vec::new();
	};
	let mut out = Vec::new();

	for group in patterns.token.captures_iter(text).filter_map(|caps| caps.get(1)) {
		for found in patterns.uuid.find_iter(group.as_str()) {
			if let Ok(id) = Uuid::parse_str(found.as_str())
				&& !out.contains(&id)
			{
				out.push(id);
			}
		}
	}

	out
}

/// Replaces citation tokens with sequential numbers in first-appearance order. Unknown tokens and
/// numbered brackets already present in `text` are dropped and reported; minted citations never
/// cited are appended after the cited ones.
pub fn resolve(text: &str, registry: &CitationRegistry) -> ResolvedReport {
	let Some(patterns) = PATTERNS.as_ref() else {
		return ResolvedReport { text: text.to_string(), ..ResolvedReport::default() };
	};
	let mut numbers: HashMap<Uuid, u32> = HashMap::new();
	let mut references = Vec::new();
	let mut unknown_citations = Vec::new();
	let mut out = String::with_capacity(text.len());
	let mut last = 0;

	for caps in patterns.token.captures_iter(text) {
		let Some(whole) = caps.get(0) else {
			continue;
		};

		out.push_str(&text[last..whole.start()]);

		last = whole.end();

		let mut group: Vec<u32> = Vec::new();

		match caps.get(1) {
			Some(ids) => {
				for found in patterns.uuid.find_iter(ids.as_str()) {
					let raw = found.as_str();
					let Some(citation) = Uuid::parse_str(raw).ok().and_then(|id| registry.get(&id))
					else {
						unknown_citations.push(raw.to_string());

						continue;
					};
					let next = references.len() as u32 + 1;
					let number = *numbers.entry(citation.citation_id).or_insert_with(|| {
						references.push(Reference {
							number: next,
							citation_id: citation.citation_id,
							paper_id: citation.paper_id.clone(),
							cited: true,
						});

						next
					});

					if !group.contains(&number) {
						group.push(number);
					}
				}
			},
			None => unknown_citations.push(whole.as_str().to_string()),
		}

		if group.is_empty() {
			last += close_gap(&mut out, &text[last..]);

			continue;
		}

		group.sort_unstable();
		out.push_str(&format!(
			"[{}]",
			group.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
		));
	}

	out.push_str(&text[last..]);

	let mut uncited = Vec::new();

	for citation in registry.citations() {
		if numbers.contains_key(&citation.citation_id) {
			continue;
		}

		uncited.push(citation.citation_id);
		references.push(Reference {
			number: references.len() as u32 + 1,
			citation_id: citation.citation_id,
			paper_id: citation.paper_id.clone(),
			cited: false,
		});
	}

	ResolvedReport { text: out, references, unknown_citations, uncited }
}

/// Bracketed reference numbers appearing in resolved text.
pub fn bracket_numbers(text: &str) -> Vec<u32> {
	let Some(patterns) = PATTERNS.as_ref() else {
		return Vec::new();
	};

	patterns
		.numbers
		.captures_iter(text)
		.flat_map(|caps| {
			caps[1].split(',').filter_map(|part| part.trim().parse::<u32>().ok()).collect::<Vec<_>>()
		})
		.collect()
}

/// Removes the spaces a dropped token leaves around its position. Returns how many bytes of `rest`
/// to skip.
fn close_gap(out: &mut String, rest: &str) -> usize {
	let kept = out.trim_end_matches(' ').len();
	let spaced = kept < out.len();

	out.truncate(kept);

	if out.is_empty() || out.ends_with('\n') {
		return rest.len() - rest.trim_start_matches(' ').len();
	}

	match rest.chars().next() {
		None | Some(' ' | '\n' | '.' | ',' | ';' | ':' | ')') => {},
		Some(_) if spaced => out.push(' '),
		Some(_) => {},
	}

	0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn registry(n: usize) -> CitationRegistry {
		CitationRegistry::mint((0..n).map(|index| format!("pmid:{index}")))
	}

	#[test]
	fn numbers_follow_first_appearance() {
		let registry = registry(3);
		let [a, b, c] = [0, 1, 2].map(|index| registry.citations()[index].citation_id);
		let text = format!("Second [{b}] then first [{a}] and both [{a}, {b}]. Last [{c}].");
		let report = resolve(&text, &registry);

		assert_eq!(report.text, "Second [1] then first [2] and both [1, 2]. Last [3].");
		assert_eq!(report.references[0].citation_id, b);
		assert!(report.uncited.is_empty());
		report.verify(&registry).expect("Report must verify.");
	}

	#[test]
	fn unknown_tokens_are_dropped_and_reported() {
		let registry = registry(1);
		let known = registry.citations()[0].citation_id;
		let stranger = Uuid::new_v4();
		let text = format!("Effect was large [{stranger}]. Confirmed [{known}; {stranger}].");
		let report = resolve(&text, &registry);

		assert_eq!(report.text, "Effect was large. Confirmed [1].");
		assert_eq!(report.unknown_citations.len(), 2);
		report.verify(&registry).expect("Report must verify.");
	}

	#[test]
	fn patterns_compile() {
		assert!(Patterns::compile().is_ok());
		assert!(PATTERNS.is_some());
	}

	#[test]
	fn numbered_brackets_in_the_draft_are_dropped_and_reported() {
		let registry = registry(1);
		let known = registry.citations()[0].citation_id;
		let text = format!("Incidence fell [{known}]. Earlier meta-analyses agree [7]. See also [1, 2].");
		let report = resolve(&text, &registry);

		assert_eq!(report.text, "Incidence fell [1]. Earlier meta-analyses agree. See also.");
		assert_eq!(report.unknown_citations, vec!["[7]".to_string(), "[1, 2]".to_string()]);
		assert_eq!(report.references.len(), 1);
		report.verify(&registry).expect("Report must verify.");
	}

	#[test]
	fn spacing_is_only_repaired_where_tokens_were_dropped() {
		let registry = registry(1);
		let known = registry.citations()[0].citation_id;
		let stranger = Uuid::new_v4();
		let text = format!(
			"[{stranger}] Odds were 2 : 1 [{known}].  \n    Indented line [{stranger}] continues."
		);
		let report = resolve(&text, &registry);

		assert_eq!(report.text, "Odds were 2 : 1 [1].  \n    Indented line continues.");
	}

	#[test]
	fn uncited_citations_are_appended_once() {
		let registry = registry(3);
		let first = registry.citations()[2].citation_id;
		let report = resolve(&format!("Only one [{first}]."), &registry);

		assert_eq!(report.references.len(), 3);
		assert_eq!(report.uncited.len(), 2);
		assert!(report.references[1..].iter().all(|reference| !reference.cited));
		report.verify(&registry).expect("Report must verify.");
	}

	#[test]
	fn every_minted_uuid_resolves_exactly_once_for_many_sizes() {
		for size in [0_usize, 1, 7, 8, 9, 40] {
			let registry = registry(size);
			let text = registry
				.citations()
				.iter()
				.rev()
				.chain(registry.citations().iter().step_by(3))
				.map(|citation| format!("Finding {}.", citation.token()))
				.collect::<Vec<_>>()
				.join(" ");
			let report = resolve(&text, &registry);

			assert_eq!(report.references.len(), size);
			report.verify(&registry).expect("Report must verify.");

			let mut numbers = bracket_numbers(&report.text);

			numbers.sort_unstable();
			numbers.dedup();

			assert_eq!(numbers.len(), size);
		}
	}

	#[test]
	fn extraction_is_ordered_and_deduplicated() {
		let registry = registry(2);
		let [a, b] = [0, 1].map(|index| registry.citations()[index].citation_id);
		let ids = extract_citation_ids(&format!("[{b}] [{a}, {b}]"));

		assert_eq!(ids, vec![b, a]);
	}
}
