//! Weighted composite score and inclusion gate.
//!
//! Every dimension is on a 0-10 scale. A dimension without a value is left out and the remaining
//! weights are renormalized, so a missing signal never counts as a zero score. The share of weight
//! that had values is the coverage; below `min_coverage` the gate reports `Uncertain`.

use serde::{Deserialize, Serialize};

use crate::{
	Error, Result,
	candidate::{AssessmentStatus, Candidate, Findings},
};
use sieve_config::CompositeWeights;

pub const EVALUATOR_STUDY_DESIGN: &str = "study_design";
pub const EVALUATOR_RISK_OF_BIAS: &str = "risk_of_bias";
pub const EVALUATOR_EXTRACTION: &str = "structured_extraction";
pub const EVALUATOR_COMPLIANCE: &str = "reporting_compliance";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
	Relevance,
	StudyQuality,
	Methodology,
	SampleSize,
	Recency,
	Replication,
}
impl Dimension {
	pub const ALL: [Dimension; 6] = [
		Dimension::Relevance,
		Dimension::StudyQuality,
		Dimension::Methodology,
		Dimension::SampleSize,
		Dimension::Recency,
		Dimension::Replication,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Dimension::Relevance => "relevance",
			Dimension::StudyQuality => "study_quality",
			Dimension::Methodology => "methodology",
			Dimension::SampleSize => "sample_size",
			Dimension::Recency => "recency",
			Dimension::Replication => "replication",
		}
	}

	fn weight(self, weights: &CompositeWeights) -> f64 {
		match self {
			Dimension::Relevance => weights.relevance,
			Dimension::StudyQuality => weights.study_quality,
			Dimension::Methodology => weights.methodology,
			Dimension::SampleSize => weights.sample_size,
			Dimension::Recency => weights.recency,
			Dimension::Replication => weights.replication,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
	Included,
	Excluded,
	Uncertain,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
	pub dimension: Dimension,
	pub value: Option<f64>,
	pub weight: f64,
	/// Weight after renormalization over the known dimensions. Zero when `value` is missing.
	pub effective_weight: f64,
	pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
	pub score: f64,
	pub coverage: f64,
	pub decision: GateDecision,
	pub gate_threshold: f64,
	pub breakdown: Vec<DimensionScore>,
}
impl CompositeScore {
	/// The full weighted breakdown, used as the gate rationale.
	pub fn rationale(&self) -> String {
		let verdict = match self.decision {
			GateDecision::Included => "meets",
			GateDecision::Excluded => "is below",
			GateDecision::Uncertain => "cannot be judged against",
		};
		let parts = self
			.breakdown
			.iter()
			.map(|dimension| match dimension.value {
				Some(value) => format!(
					"{} {:.2} x {:.3} = {:.3}",
					dimension.dimension.as_str(),
					value,
					dimension.effective_weight,
					dimension.contribution
				),
				None => format!("{} unknown (weight {:.2} dropped)", dimension.dimension.as_str(), dimension.weight),
			})
			.collect::<Vec<_>>()
			.join("; ");

		format!(
			"Composite {:.2} {verdict} gate {:.2} (coverage {:.2}): {parts}.",
			self.score, self.gate_threshold, self.coverage
		)
	}
}

/// Per-dimension inputs on the 0-10 scale. `None` means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeInputs {
	pub relevance: Option<f64>,
	pub study_quality: Option<f64>,
	pub methodology: Option<f64>,
	pub sample_size: Option<f64>,
	pub recency: Option<f64>,
	pub replication: Option<f64>,
}
impl CompositeInputs {
	/// Derives inputs from a candidate's annotations. Pure: the evaluation year is passed in.
	pub fn derive(candidate: &Candidate, params: &DerivationParams) -> Self {
		Self {
			relevance: candidate
				.relevance
				.as_ref()
				.and_then(|outcome| outcome.score())
				.map(|score| (f64::from(score.clamp(1, 5)) - 1.0) * 2.5),
			study_quality: study_quality(candidate),
			methodology: completed_findings(candidate, EVALUATOR_STUDY_DESIGN).and_then(|findings| {
				match findings {
					Findings::StudyDesign { design, .. } => Some(design.hierarchy_score()),
					_ => None,
				}
			}),
			sample_size: completed_findings(candidate, EVALUATOR_EXTRACTION)
				.and_then(|findings| match findings {
					Findings::Extraction { sample_size, .. } => *sample_size,
					_ => None,
				})
				.map(|n| sample_size_adequacy(n, params.sample_size_target)),
			recency: candidate
				.metadata
				.year
				.map(|year| recency(year, params.evaluation_year, params.recency_half_life_years)),
			replication: candidate.metadata.replication_count.map(replication),
		}
	}

	fn value(&self, dimension: Dimension) -> Option<f64> {
		match dimension {
			Dimension::Relevance => self.relevance,
			Dimension::StudyQuality => self.study_quality,
			Dimension::Methodology => self.methodology,
			Dimension::SampleSize => self.sample_size,
			Dimension::Recency => self.recency,
			Dimension::Replication => self.replication,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivationParams {
	pub evaluation_year: i32,
	pub recency_half_life_years: f64,
	pub sample_size_target: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeScorer {
	weights: CompositeWeights,
	gate_threshold: f64,
	min_coverage: f64,
}
impl CompositeScorer {
	pub fn new(weights: CompositeWeights, gate_threshold: f64, min_coverage: f64) -> Result<Self> {
		sieve_config::validate_weights(&weights)
			.map_err(|err| Error::InvalidWeights { message: err.to_string() })?;

		if !gate_threshold.is_finite() || !(0.0..=10.0).contains(&gate_threshold) {
			return Err(Error::InvalidThreshold {
				message: format!("gate threshold {gate_threshold} is outside 0-10."),
			});
		}
		if !min_coverage.is_finite() || min_coverage <= 0.0 || min_coverage > 1.0 {
			return Err(Error::InvalidThreshold {
				message: format!("minimum coverage {min_coverage} is outside (0, 1]."),
			});
		}

		Ok(Self { weights, gate_threshold, min_coverage })
	}

	pub fn from_config(cfg: &sieve_config::Composite) -> Result<Self> {
		Self::new(cfg.weights, cfg.gate_threshold, cfg.min_coverage)
	}

	pub fn score(&self, inputs: &CompositeInputs) -> CompositeScore {
		let known = |dimension: Dimension| {
			inputs.value(dimension).filter(|value| value.is_finite()).map(|value| value.clamp(0.0, 10.0))
		};
		let coverage: f64 = Dimension::ALL
			.iter()
			.filter(|dimension| known(**dimension).is_some())
			.map(|dimension| dimension.weight(&self.weights))
			.sum();
		let breakdown: Vec<DimensionScore> = Dimension::ALL
			.iter()
			.map(|dimension| {
				let weight = dimension.weight(&self.weights);
				let value = known(*dimension);
				let effective_weight = match value {
					Some(_) if coverage > 0.0 => weight / coverage,
					_ => 0.0,
				};

				DimensionScore {
					dimension: *dimension,
					value,
					weight,
					effective_weight,
					contribution: value.unwrap_or(0.0) * effective_weight,
				}
			})
			.collect();
		let score =
			breakdown.iter().map(|dimension| dimension.contribution).sum::<f64>().clamp(0.0, 10.0);
		let decision = if coverage + sieve_config::WEIGHT_SUM_TOLERANCE < self.min_coverage {
			GateDecision::Uncertain
		} else if score >= self.gate_threshold {
			GateDecision::Included
		} else {
			GateDecision::Excluded
		};

		CompositeScore { score, coverage, decision, gate_threshold: self.gate_threshold, breakdown }
	}
}

fn completed_findings<'a>(candidate: &'a Candidate, evaluator: &str) -> Option<&'a Findings> {
	candidate
		.assessment(evaluator)
		.filter(|assessment| assessment.status == AssessmentStatus::Completed)
		.map(|assessment| &assessment.findings)
}

fn study_quality(candidate: &Candidate) -> Option<f64> {
	let mut signals = Vec::new();

	if let Some(Findings::RiskOfBias { overall, .. }) =
		completed_findings(candidate, EVALUATOR_RISK_OF_BIAS)
		&& let Some(value) = overall.quality_score()
	{
		signals.push(value);
	}
	if let Some(Findings::Compliance { items, .. }) =
		completed_findings(candidate, EVALUATOR_COMPLIANCE)
		&& !items.is_empty()
	{
		let satisfied = items.iter().filter(|item| item.satisfied).count();

		signals.push(satisfied as f64 / items.len() as f64 * 10.0);
	}

	if signals.is_empty() {
		return None;
	}

	Some(signals.iter().sum::<f64>() / signals.len() as f64)
}

fn sample_size_adequacy(n: u32, target: u32) -> f64 {
	if n <= 1 {
		return 0.0;
	}

	let target = f64::from(target.max(2));

	(10.0 * f64::from(n).ln() / target.ln()).min(10.0)
}

fn recency(year: i32, evaluation_year: i32, half_life_years: f64) -> f64 {
	let age = f64::from((evaluation_year - year).max(0));

	10.0 * 0.5_f64.powf(age / half_life_years)
}

fn replication(count: u32) -> f64 {
	10.0 * (1.0 - 0.5_f64.powi(count.min(64) as i32))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn scorer() -> CompositeScorer {
		CompositeScorer::new(CompositeWeights::default(), 4.0, 0.5).expect("Default weights must be valid.")
	}

	fn full_inputs() -> CompositeInputs {
		CompositeInputs {
			relevance: Some(10.0),
			study_quality: Some(8.0),
			methodology: Some(8.5),
			sample_size: Some(9.0),
			recency: Some(7.0),
			replication: Some(5.0),
		}
	}

	#[test]
	fn weights_off_by_more_than_tolerance_are_rejected() {
		let weights = CompositeWeights { relevance: 0.36, ..CompositeWeights::default() };
		let err = CompositeScorer::new(weights, 4.0, 0.5).expect_err("Expected invalid weights.");

		assert!(matches!(err, Error::InvalidWeights { .. }));
	}

	#[test]
	fn scoring_is_pure() {
		let scorer = scorer();
		let inputs = full_inputs();

		assert_eq!(scorer.score(&inputs), scorer.score(&inputs));
	}

	#[test]
	fn full_inputs_are_a_plain_weighted_sum() {
		let score = scorer().score(&full_inputs());
		let expected = 10.0 * 0.35 + 8.0 * 0.25 + 8.5 * 0.20 + 9.0 * 0.10 + 7.0 * 0.05 + 5.0 * 0.05;

		assert!((score.score - expected).abs() < 1e-9);
		assert!((score.coverage - 1.0).abs() < 1e-9);
		assert_eq!(score.decision, GateDecision::Included);
	}

	#[test]
	fn missing_dimension_is_renormalized_not_zeroed() {
		let mut inputs = full_inputs();

		inputs.study_quality = None;

		let score = scorer().score(&inputs);
		let expected = (10.0 * 0.35 + 8.5 * 0.20 + 9.0 * 0.10 + 7.0 * 0.05 + 5.0 * 0.05) / 0.75;

		assert!((score.score - expected).abs() < 1e-9);
		assert!((score.coverage - 0.75).abs() < 1e-9);
		assert_eq!(score.breakdown[1].effective_weight, 0.0);
	}

	#[test]
	fn low_coverage_is_uncertain() {
		let inputs = CompositeInputs { recency: Some(10.0), ..CompositeInputs::default() };

		assert_eq!(scorer().score(&inputs).decision, GateDecision::Uncertain);
	}

	#[test]
	fn gate_rationale_carries_every_dimension() {
		let inputs = CompositeInputs {
			relevance: Some(2.5),
			study_quality: Some(2.0),
			methodology: Some(1.0),
			sample_size: None,
			recency: Some(3.0),
			replication: Some(0.0),
		};
		let score = scorer().score(&inputs);
		let rationale = score.rationale();

		assert_eq!(score.decision, GateDecision::Excluded);

		for dimension in Dimension::ALL {
			assert!(rationale.contains(dimension.as_str()), "Missing {dimension:?} in {rationale}");
		}

		assert!(rationale.contains("sample_size unknown"));
	}

	#[test]
	fn scores_are_clamped_to_the_scale() {
		let inputs = CompositeInputs {
			relevance: Some(40.0),
			study_quality: Some(-3.0),
			..full_inputs()
		};
		let score = scorer().score(&inputs);

		assert!((0.0..=10.0).contains(&score.score));
	}

	#[test]
	fn derived_dimensions_follow_their_curves() {
		assert_eq!(sample_size_adequacy(1, 1_000), 0.0);
		assert!((sample_size_adequacy(1_000, 1_000) - 10.0).abs() < 1e-9);
		assert_eq!(sample_size_adequacy(50_000, 1_000), 10.0);
		assert!((recency(2014, 2024, 10.0) - 5.0).abs() < 1e-9);
		assert_eq!(recency(2030, 2024, 10.0), 10.0);
		assert_eq!(replication(0), 0.0);
		assert!((replication(1) - 5.0).abs() < 1e-9);
	}
}
