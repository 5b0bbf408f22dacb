//! Three-tier screening cascade.
//!
//! Tier 1 rejects titles that start with a never-relevant document-type marker. Tier 2 looks for
//! protective phrasing around every exclusion-keyword hit and, when found, passes the candidate
//! regardless of tier 3. Tier 3 rejects on exclusion-keyword hits: high confidence in the title,
//! medium in the abstract only.

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

use crate::{
	Result,
	candidate::{Confidence, FilterTier, FilterVerdict},
};

struct ExclusionPattern {
	criterion: String,
	regex: Regex,
}

struct ProtectivePattern {
	phrase: String,
	regex: Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
	Title,
	Abstract,
}
impl Field {
	fn as_str(self) -> &'static str {
		match self {
			Field::Title => "title",
			Field::Abstract => "abstract",
		}
	}
}

struct KeywordHit<'a> {
	criterion: &'a str,
	field: Field,
	matched: String,
	protected_by: Option<&'a str>,
}

pub struct FilterCascade {
	title_prefix: Option<Regex>,
	exclusions: Vec<ExclusionPattern>,
	protective: Vec<ProtectivePattern>,
	window_words: usize,
}
impl FilterCascade {
	/// Compiles every pattern once per run.
	pub fn new(cfg: &sieve_config::Filter, exclusion_criteria: &[String]) -> Result<Self> {
		let prefixes: Vec<String> = cfg
			.title_prefixes
			.iter()
			.map(|prefix| phrase_pattern(prefix))
			.filter(|pattern| !pattern.is_empty())
			.collect();
		let title_prefix = if prefixes.is_empty() {
			None
		} else {
			Some(Regex::new(&format!(r"(?i)^\W*(?:{})\b", prefixes.join("|")))?)
		};
		let mut exclusions = Vec::new();

		for criterion in exclusion_criteria {
			let pattern = criterion_pattern(criterion);

			if pattern.is_empty() {
				continue;
			}

			exclusions.push(ExclusionPattern {
				criterion: criterion.trim().to_string(),
				regex: Regex::new(&format!(r"(?i)\b{pattern}\b"))?,
			});
		}

		let mut protective = Vec::new();

		for phrase in &cfg.protective_phrases {
			let pattern = phrase_pattern(phrase);

			if pattern.is_empty() {
				continue;
			}

			protective.push(ProtectivePattern {
				phrase: phrase.trim().to_string(),
				regex: Regex::new(&format!(r"(?i)\b{pattern}\b"))?,
			});
		}

		Ok(Self {
			title_prefix,
			exclusions,
			protective,
			window_words: cfg.protective_window_words as usize,
		})
	}

	pub fn evaluate(&self, title: &str, abstract_text: &str) -> FilterVerdict {
		if let Some(re) = &self.title_prefix
			&& let Some(found) = re.find(title)
		{
			let marker = found.as_str().trim_matches(|c: char| !c.is_alphanumeric()).to_string();

			return FilterVerdict {
				tier: FilterTier::TitlePrefix,
				confidence: Confidence::High,
				rationale: format!("Title starts with the document-type marker {marker:?}."),
				matched_pattern: Some(marker),
				passed: false,
			};
		}

		let hits = self.keyword_hits(title, abstract_text);

		if let Some(hit) = hits.iter().find(|hit| hit.protected_by.is_some()) {
			let phrase = hit.protected_by.unwrap_or_default();

			return FilterVerdict {
				tier: FilterTier::ProtectiveContext,
				confidence: Confidence::Low,
				matched_pattern: Some(hit.criterion.to_string()),
				passed: true,
				rationale: format!(
					"Exclusion term {:?} in the {} appears in protective context ({phrase:?}); passed for scoring.",
					hit.matched,
					hit.field.as_str()
				),
			};
		}

		let strongest = hits
			.iter()
			.find(|hit| hit.field == Field::Title)
			.or_else(|| hits.first());

		match strongest {
			Some(hit) => {
				let confidence =
					if hit.field == Field::Title { Confidence::High } else { Confidence::Medium };

				FilterVerdict {
					tier: FilterTier::ExclusionKeyword,
					confidence,
					matched_pattern: Some(hit.criterion.to_string()),
					passed: false,
					rationale: format!(
						"Matches exclusion criterion {:?} ({:?} in the {}).",
						hit.criterion,
						hit.matched,
						hit.field.as_str()
					),
				}
			},
			None => FilterVerdict {
				tier: FilterTier::None,
				confidence: Confidence::High,
				matched_pattern: None,
				passed: true,
				rationale: "No screening rule matched.".to_string(),
			},
		}
	}

	fn keyword_hits<'a>(&'a self, title: &str, abstract_text: &str) -> Vec<KeywordHit<'a>> {
		let mut hits = Vec::new();

		for (field, text) in [(Field::Title, title), (Field::Abstract, abstract_text)] {
			for exclusion in &self.exclusions {
				for found in exclusion.regex.find_iter(text) {
					hits.push(KeywordHit {
						criterion: exclusion.criterion.as_str(),
						field,
						matched: found.as_str().to_string(),
						protected_by: self.protective_phrase(text, found.start(), found.end()),
					});
				}
			}
		}

		hits
	}

	/// Returns the first protective phrase found within `window_words` words either side of the
	/// hit at `start..end`. The hit itself is not part of the window.
	fn protective_phrase(&self, text: &str, start: usize, end: usize) -> Option<&str> {
		if self.window_words == 0 {
			return None;
		}

		let words: Vec<(usize, &str)> = text.unicode_word_indices().collect();
		let before: Vec<&(usize, &str)> =
			words.iter().filter(|(offset, word)| offset + word.len() <= start).collect();
		let after: Vec<&(usize, &str)> = words.iter().filter(|(offset, _)| *offset >= end).collect();
		let window_start = before
			.len()
			.checked_sub(self.window_words)
			.map_or(0, |index| before[index].0);
		let window_end = after
			.get(self.window_words.saturating_sub(1))
			.or(after.last())
			.map_or(end, |(offset, word)| offset + word.len());
		let leading = &text[window_start.min(start)..start];
		let trailing = &text[end..window_end.max(end)];

		self.protective
			.iter()
			.find(|pattern| pattern.regex.is_match(leading) || pattern.regex.is_match(trailing))
			.map(|pattern| pattern.phrase.as_str())
	}
}

/// Case-insensitive phrase with flexible whitespace between words.
fn phrase_pattern(phrase: &str) -> String {
	phrase.split_whitespace().map(regex::escape).collect::<Vec<_>>().join(r"\s+")
}

/// Like `phrase_pattern`, with the last word accepting singular and plural forms.
fn criterion_pattern(criterion: &str) -> String {
	let words: Vec<&str> = criterion.split_whitespace().collect();
	let Some((last, rest)) = words.split_last() else {
		return String::new();
	};
	let mut parts: Vec<String> = rest.iter().map(|word| regex::escape(word)).collect();

	parts.push(plural_tolerant(last));

	parts.join(r"\s+")
}

fn plural_tolerant(word: &str) -> String {
	let lower = word.to_lowercase();

	if lower.len() > 4 && lower.ends_with("ies") {
		return format!("{}(?:y|ies)", regex::escape(&word[..word.len() - 3]));
	}
	if lower.len() > 3 && lower.ends_with('y') && !lower.ends_with("ey") {
		return format!("{}(?:y|ies)", regex::escape(&word[..word.len() - 1]));
	}
	if lower.len() > 3 && lower.ends_with('s') && !lower.ends_with("ss") {
		return format!("{}s?", regex::escape(&word[..word.len() - 1]));
	}

	format!("{}s?", regex::escape(word))
}
