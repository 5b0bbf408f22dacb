use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
	Error, Result,
	composite::{CompositeScore, GateDecision},
	phase::Phase,
	plan::Strategy,
	question::Pico,
	study::{RiskOfBias, StudyDesign, StudyTypeHint},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperMetadata {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub year: Option<i32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub journal: Option<String>,
	#[serde(default)]
	pub authors: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub doi: Option<String>,
	#[serde(default)]
	pub publication_types: Vec<String>,
	/// Independent replications known for the finding, when the corpus records them.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub replication_count: Option<u32>,
}

/// One ranked record returned by the corpus for a single search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusHit {
	pub paper_id: String,
	/// 1-based position in the result list.
	pub rank: u32,
	/// Raw backend score. Not comparable across search methods.
	pub score: f64,
	pub title: String,
	#[serde(rename = "abstract")]
	pub abstract_text: String,
	pub metadata: PaperMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceTag {
	pub query_id: Uuid,
	pub strategy: Strategy,
	pub label: String,
	/// 1-based rank within the query's (fused, for hybrids) result list.
	pub rank: u32,
	pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
	High,
	Medium,
	Low,
}
impl Confidence {
	pub fn parse(raw: &str) -> Option<Confidence> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"high" => Some(Confidence::High),
			"medium" | "moderate" => Some(Confidence::Medium),
			"low" => Some(Confidence::Low),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterTier {
	TitlePrefix,
	ProtectiveContext,
	ExclusionKeyword,
	None,
}
impl FilterTier {
	pub fn number(self) -> Option<u8> {
		match self {
			FilterTier::TitlePrefix => Some(1),
			FilterTier::ProtectiveContext => Some(2),
			FilterTier::ExclusionKeyword => Some(3),
			FilterTier::None => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterVerdict {
	pub tier: FilterTier,
	pub confidence: Confidence,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub matched_pattern: Option<String>,
	pub passed: bool,
	pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceScore {
	pub score: u8,
	pub rationale: String,
	pub model: String,
	#[serde(with = "crate::timestamp")]
	pub scored_at: OffsetDateTime,
}

/// Outcome of relevance scoring. `Unknown` records a soft failure and leaves the dimension out of
/// the composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RelevanceOutcome {
	Scored(RelevanceScore),
	Unknown {
		reason: String,
		model: String,
		#[serde(with = "crate::timestamp")]
		recorded_at: OffsetDateTime,
	},
}
impl RelevanceOutcome {
	pub fn score(&self) -> Option<u8> {
		match self {
			RelevanceOutcome::Scored(score) => Some(score.score),
			RelevanceOutcome::Unknown { .. } => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiasDomainRating {
	pub domain: String,
	pub rating: RiskOfBias,
	#[serde(default)]
	pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
	pub item: String,
	pub satisfied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Findings {
	StudyDesign {
		design: StudyDesign,
		rationale: String,
	},
	RiskOfBias {
		domains: Vec<BiasDomainRating>,
		overall: RiskOfBias,
	},
	Extraction {
		pico: Pico,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		sample_size: Option<u32>,
		#[serde(default)]
		key_findings: Vec<String>,
	},
	Compliance {
		checklist: String,
		items: Vec<ChecklistItem>,
	},
	/// The evaluator failed; nothing usable was produced.
	Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
	Completed,
	Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
	pub evaluator: String,
	pub status: AssessmentStatus,
	pub findings: Findings,
	pub confidence: Confidence,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	pub model: String,
	#[serde(with = "crate::timestamp")]
	pub assessed_at: OffsetDateTime,
}
impl QualityAssessment {
	pub fn unknown(
		evaluator: &str,
		model: &str,
		error: impl Into<String>,
		assessed_at: OffsetDateTime,
	) -> Self {
		Self {
			evaluator: evaluator.to_string(),
			status: AssessmentStatus::Unknown,
			findings: Findings::Unavailable,
			confidence: Confidence::Low,
			error: Some(error.into()),
			model: model.to_string(),
			assessed_at,
		}
	}

	pub fn is_completed(&self) -> bool {
		self.status == AssessmentStatus::Completed
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionStage {
	Filter,
	Relevance,
	Gate,
	Adjudication,
}
impl ExclusionStage {
	pub fn as_str(self) -> &'static str {
		match self {
			ExclusionStage::Filter => "filter",
			ExclusionStage::Relevance => "relevance",
			ExclusionStage::Gate => "gate",
			ExclusionStage::Adjudication => "adjudication",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
	pub stage: ExclusionStage,
	pub rationale: String,
	#[serde(with = "crate::timestamp")]
	pub excluded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjudicationDecision {
	Include,
	Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjudication {
	pub decision: AdjudicationDecision,
	pub note: String,
	pub reviewer: String,
	#[serde(with = "crate::timestamp")]
	pub adjudicated_at: OffsetDateTime,
}

/// A paper under review. Annotations are append-only within a phase; `rewind` is the only way to
/// remove them and is reserved for phase re-entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
	pub paper_id: String,
	pub title: String,
	#[serde(rename = "abstract")]
	pub abstract_text: String,
	pub metadata: PaperMetadata,
	pub study_type: StudyTypeHint,
	pub provenance: Vec<ProvenanceTag>,
	/// Sum of fused per-query contributions. Orders the candidate pool.
	pub retrieval_score: f64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filter_verdict: Option<FilterVerdict>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub relevance: Option<RelevanceOutcome>,
	#[serde(default)]
	pub assessments: Vec<QualityAssessment>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub composite: Option<CompositeScore>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub adjudication: Option<Adjudication>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub exclusion: Option<Exclusion>,
}
impl Candidate {
	pub fn new(
		paper_id: impl Into<String>,
		title: impl Into<String>,
		abstract_text: impl Into<String>,
		metadata: PaperMetadata,
	) -> Self {
		let title = title.into();
		let abstract_text = abstract_text.into();
		let study_type =
			crate::study::classify(&title, &abstract_text, &metadata.publication_types);

		Self {
			paper_id: paper_id.into(),
			title,
			abstract_text,
			metadata,
			study_type,
			provenance: Vec::new(),
			retrieval_score: 0.0,
			filter_verdict: None,
			relevance: None,
			assessments: Vec::new(),
			composite: None,
			adjudication: None,
			exclusion: None,
		}
	}

	/// Records that a query retrieved this paper. A repeat hit from the same query keeps the better
	/// rank; hits from other queries accumulate.
	pub fn add_provenance(&mut self, tag: ProvenanceTag) {
		self.retrieval_score += tag.score;

		match self.provenance.iter_mut().find(|existing| existing.query_id == tag.query_id) {
			Some(existing) =>
				if tag.rank < existing.rank {
					existing.rank = tag.rank;
				},
			None => self.provenance.push(tag),
		}
	}

	pub fn is_excluded(&self) -> bool {
		self.exclusion.is_some()
	}

	pub fn exclusion_stage(&self) -> Option<ExclusionStage> {
		self.exclusion.as_ref().map(|exclusion| exclusion.stage)
	}

	/// Whether a reviewer may still override the outcome. Papers screened out before the gate are
	/// final.
	pub fn is_adjudicable(&self) -> bool {
		!matches!(self.exclusion_stage(), Some(ExclusionStage::Filter | ExclusionStage::Relevance))
	}

	/// Whether the paper enters synthesis: a passing gate decision, or a reviewer inclusion.
	pub fn is_included(&self) -> bool {
		if let Some(adjudication) = &self.adjudication {
			return adjudication.decision == AdjudicationDecision::Include && self.is_adjudicable();
		}
		if self.is_excluded() {
			return false;
		}

		self.composite.as_ref().is_some_and(|composite| composite.decision == GateDecision::Included)
	}

	pub fn is_uncertain(&self) -> bool {
		self.adjudication.is_none()
			&& !self.is_excluded()
			&& self
				.composite
				.as_ref()
				.is_some_and(|composite| composite.decision == GateDecision::Uncertain)
	}

	pub fn attach_filter_verdict(&mut self, verdict: FilterVerdict, at: OffsetDateTime) -> Result<()> {
		if self.filter_verdict.is_some() {
			return Err(self.conflict("filter verdict is already attached."));
		}

		let exclusion = (!verdict.passed).then(|| verdict.rationale.clone());

		self.filter_verdict = Some(verdict);

		if let Some(rationale) = exclusion {
			self.exclude(ExclusionStage::Filter, rationale, at)?;
		}

		Ok(())
	}

	/// Attaches a relevance outcome and excludes scored papers below `threshold`, keeping the
	/// model's rationale verbatim.
	pub fn attach_relevance(
		&mut self,
		outcome: RelevanceOutcome,
		threshold: f64,
		at: OffsetDateTime,
	) -> Result<()> {
		if self.relevance.is_some() {
			return Err(self.conflict("relevance outcome is already attached."));
		}

		let exclusion = match &outcome {
			RelevanceOutcome::Scored(score) if f64::from(score.score) < threshold =>
				Some(score.rationale.clone()),
			_ => None,
		};

		self.relevance = Some(outcome);

		if let Some(rationale) = exclusion {
			self.exclude(ExclusionStage::Relevance, rationale, at)?;
		}

		Ok(())
	}

	pub fn attach_assessment(&mut self, assessment: QualityAssessment) -> Result<()> {
		if self.assessments.iter().any(|existing| existing.evaluator == assessment.evaluator) {
			return Err(self.conflict(&format!(
				"assessment from {} is already attached.",
				assessment.evaluator
			)));
		}

		self.assessments.push(assessment);

		Ok(())
	}

	pub fn assessment(&self, evaluator: &str) -> Option<&QualityAssessment> {
		self.assessments.iter().find(|assessment| assessment.evaluator == evaluator)
	}

	/// Attaches the derived composite and applies the gate. The composite is recomputable, so a
	/// fresh value replaces a stale one.
	pub fn attach_composite(&mut self, composite: CompositeScore, at: OffsetDateTime) -> Result<()> {
		let gate_exclusion =
			(composite.decision == GateDecision::Excluded).then(|| composite.rationale());

		self.composite = Some(composite);

		if let Some(rationale) = gate_exclusion {
			self.exclude(ExclusionStage::Gate, rationale, at)?;
		}

		Ok(())
	}

	pub fn adjudicate(&mut self, adjudication: Adjudication) -> Result<()> {
		if self.adjudication.is_some() {
			return Err(self.conflict("adjudication is already recorded."));
		}
		if adjudication.note.trim().is_empty() {
			return Err(Error::EmptyRationale { paper_id: self.paper_id.clone() });
		}

		let exclusion = (adjudication.decision == AdjudicationDecision::Exclude
			&& !self.is_excluded())
		.then(|| adjudication.note.clone());
		let at = adjudication.adjudicated_at;

		self.adjudication = Some(adjudication);

		if let Some(rationale) = exclusion {
			self.exclude(ExclusionStage::Adjudication, rationale, at)?;
		}

		Ok(())
	}

	pub fn exclude(
		&mut self,
		stage: ExclusionStage,
		rationale: impl Into<String>,
		at: OffsetDateTime,
	) -> Result<()> {
		let rationale = rationale.into();

		if rationale.trim().is_empty() {
			return Err(Error::EmptyRationale { paper_id: self.paper_id.clone() });
		}
		if let Some(existing) = &self.exclusion {
			return Err(self.conflict(&format!(
				"already excluded at {}.",
				existing.stage.as_str()
			)));
		}

		self.exclusion = Some(Exclusion { stage, rationale, excluded_at: at });

		Ok(())
	}

	/// Removes every annotation produced by `phase` and later phases.
	pub fn rewind(&mut self, phase: Phase) {
		if phase <= Phase::FilteringScoring {
			self.filter_verdict = None;
			self.relevance = None;
		}
		if phase <= Phase::QualityAssessment {
			self.assessments.clear();
			self.composite = None;
			self.adjudication = None;
		}

		let keep_exclusion = match self.exclusion_stage() {
			Some(ExclusionStage::Filter | ExclusionStage::Relevance) =>
				phase > Phase::FilteringScoring,
			Some(ExclusionStage::Gate | ExclusionStage::Adjudication) =>
				phase > Phase::QualityAssessment,
			None => true,
		};

		if !keep_exclusion {
			self.exclusion = None;
		}
	}

	fn conflict(&self, message: &str) -> Error {
		Error::AnnotationConflict { paper_id: self.paper_id.clone(), message: message.to_string() }
	}
}
