//! Study classification vocabulary shared by the filter, the evaluators, and composite scoring.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Coarse study type inferred from the candidate record alone. Evaluator suitability is decided
/// from this hint so that no evaluator depends on another evaluator's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyTypeHint {
	MetaAnalysis,
	SystematicReview,
	RandomizedTrial,
	Cohort,
	CaseControl,
	CrossSectional,
	CaseReport,
	Narrative,
	Unknown,
}
impl StudyTypeHint {
	/// Label used by `quality.evaluators` include and exclude lists.
	pub fn label(self) -> &'static str {
		match self {
			StudyTypeHint::MetaAnalysis => "meta_analysis",
			StudyTypeHint::SystematicReview => "systematic_review",
			StudyTypeHint::RandomizedTrial => "randomized_trial",
			StudyTypeHint::Cohort => "cohort",
			StudyTypeHint::CaseControl => "case_control",
			StudyTypeHint::CrossSectional => "cross_sectional",
			StudyTypeHint::CaseReport => "case_report",
			StudyTypeHint::Narrative => "narrative",
			StudyTypeHint::Unknown => "unknown",
		}
	}
}

static HINT_PATTERNS: LazyLock<Vec<(StudyTypeHint, Regex)>> = LazyLock::new(|| {
	[
		(StudyTypeHint::MetaAnalysis, r"(?i)\bmeta[\s-]?analy[sz](?:is|es|ed)\b|\bpooled analysis\b"),
		(
			StudyTypeHint::SystematicReview,
			r"(?i)\bsystematic(?:al)?\s+(?:literature\s+)?review|\bscoping review\b|\bumbrella review\b",
		),
		(
			StudyTypeHint::RandomizedTrial,
			r"(?i)\brandomi[sz]ed\b.{0,40}\btrials?\b|\bRCTs?\b|\bplacebo[\s-]controlled\b",
		),
		(StudyTypeHint::CaseControl, r"(?i)\bcase[\s-]control\b"),
		(
			StudyTypeHint::Cohort,
			r"(?i)\bcohort\b|\bprospective(?:ly)?\s+(?:followed|study)\b|\blongitudinal study\b",
		),
		(StudyTypeHint::CrossSectional, r"(?i)\bcross[\s-]sectional\b|\bprevalence survey\b"),
		(StudyTypeHint::CaseReport, r"(?i)\bcase (?:report|series)\b|\bwe (?:report|describe) a\b"),
		(
			StudyTypeHint::Narrative,
			r"(?i)\bnarrative review\b|\bcommentary\b|\beditorial\b|\bperspective\b|\bopinion\b",
		),
	]
	.into_iter()
	.filter_map(|(hint, pattern)| Regex::new(pattern).ok().map(|re| (hint, re)))
	.collect()
});

/// Classifies a record using publication types first, then the title, then the abstract.
pub fn classify(title: &str, abstract_text: &str, publication_types: &[String]) -> StudyTypeHint {
	for publication_type in publication_types {
		if let Some(hint) = hint_from_publication_type(publication_type) {
			return hint;
		}
	}
	for text in [title, abstract_text] {
		if let Some((hint, _)) = HINT_PATTERNS.iter().find(|(_, re)| re.is_match(text)) {
			return *hint;
		}
	}

	StudyTypeHint::Unknown
}

fn hint_from_publication_type(raw: &str) -> Option<StudyTypeHint> {
	let normalized = raw.trim().to_ascii_lowercase();

	match normalized.as_str() {
		"meta-analysis" | "meta analysis" => Some(StudyTypeHint::MetaAnalysis),
		"systematic review" => Some(StudyTypeHint::SystematicReview),
		"randomized controlled trial" | "randomised controlled trial" | "clinical trial, phase iii" =>
			Some(StudyTypeHint::RandomizedTrial),
		"case reports" | "case report" => Some(StudyTypeHint::CaseReport),
		"editorial" | "comment" | "letter" | "review" => Some(StudyTypeHint::Narrative),
		_ => None,
	}
}

/// Evidence hierarchy used for the methodology-appropriateness dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyDesign {
	MetaAnalysis,
	SystematicReview,
	RandomizedTrial,
	NonRandomizedTrial,
	Cohort,
	CaseControl,
	CrossSectional,
	Qualitative,
	CaseSeries,
	CaseReport,
	Narrative,
	Other,
}
impl StudyDesign {
	pub fn parse(raw: &str) -> Option<StudyDesign> {
		let key = raw.trim().to_ascii_lowercase().replace(['-', ' ', '/'], "_");

		let design = match key.as_str() {
			"meta_analysis" => StudyDesign::MetaAnalysis,
			"systematic_review" => StudyDesign::SystematicReview,
			"randomized_trial" | "randomised_trial" | "rct" | "randomized_controlled_trial" =>
				StudyDesign::RandomizedTrial,
			"non_randomized_trial" | "quasi_experimental" => StudyDesign::NonRandomizedTrial,
			"cohort" | "cohort_study" => StudyDesign::Cohort,
			"case_control" => StudyDesign::CaseControl,
			"cross_sectional" => StudyDesign::CrossSectional,
			"qualitative" => StudyDesign::Qualitative,
			"case_series" => StudyDesign::CaseSeries,
			"case_report" => StudyDesign::CaseReport,
			"narrative" | "narrative_review" | "editorial" | "commentary" => StudyDesign::Narrative,
			"other" => StudyDesign::Other,
			_ => return None,
		};

		Some(design)
	}

	/// Position in the evidence hierarchy on the 0-10 composite scale.
	pub fn hierarchy_score(self) -> f64 {
		match self {
			StudyDesign::MetaAnalysis => 10.0,
			StudyDesign::SystematicReview => 9.0,
			StudyDesign::RandomizedTrial => 8.5,
			StudyDesign::NonRandomizedTrial => 7.0,
			StudyDesign::Cohort => 6.5,
			StudyDesign::CaseControl => 5.5,
			StudyDesign::CrossSectional => 4.5,
			StudyDesign::Qualitative => 4.0,
			StudyDesign::CaseSeries => 3.0,
			StudyDesign::Other => 3.0,
			StudyDesign::CaseReport => 2.0,
			StudyDesign::Narrative => 1.0,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskOfBias {
	Low,
	SomeConcerns,
	High,
	Unclear,
}
impl RiskOfBias {
	pub fn parse(raw: &str) -> Option<RiskOfBias> {
		match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
			"low" => Some(RiskOfBias::Low),
			"some_concerns" | "moderate" => Some(RiskOfBias::SomeConcerns),
			"high" => Some(RiskOfBias::High),
			"unclear" | "unknown" => Some(RiskOfBias::Unclear),
			_ => None,
		}
	}

	/// Contribution to the study-quality dimension. `Unclear` carries no signal.
	pub fn quality_score(self) -> Option<f64> {
		match self {
			RiskOfBias::Low => Some(10.0),
			RiskOfBias::SomeConcerns => Some(6.0),
			RiskOfBias::High => Some(2.0),
			RiskOfBias::Unclear => None,
		}
	}
}
