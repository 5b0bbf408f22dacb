//! Review export: machine-readable JSON and a Markdown report.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{ReviewSettings, state::RunState, synthesis::SynthesisPath};
use sieve_domain::{
	audit::AuditRecord,
	candidate::{AdjudicationDecision, Candidate, ExclusionStage},
	phase::{Phase, RunStatus},
	plan::SearchPlan,
	question::ResearchQuestion,
};

/// Study-flow counts in the shape of a PRISMA flow diagram.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrismaCounts {
	pub identified: usize,
	pub duplicates_merged: usize,
	pub screened: usize,
	pub excluded_at_filter: usize,
	pub excluded_at_relevance: usize,
	pub relevance_unknown: usize,
	pub assessed: usize,
	pub excluded_at_gate: usize,
	pub uncertain: usize,
	pub adjudicated_included: usize,
	pub adjudicated_excluded: usize,
	pub included: usize,
}
impl PrismaCounts {
	pub fn from_state(state: &RunState) -> Self {
		let stage = |wanted: ExclusionStage| {
			state.candidates.iter().filter(|c| c.exclusion_stage() == Some(wanted)).count()
		};
		let adjudicated = |wanted: AdjudicationDecision| {
			state
				.candidates
				.iter()
				.filter(|c| c.adjudication.as_ref().is_some_and(|a| a.decision == wanted))
				.count()
		};

		Self {
			identified: state.retrieval.as_ref().map_or(0, |stats| stats.raw_hits),
			duplicates_merged: state.retrieval.as_ref().map_or(0, |stats| stats.duplicates_merged),
			screened: state.candidates.iter().filter(|c| c.filter_verdict.is_some()).count(),
			excluded_at_filter: stage(ExclusionStage::Filter),
			excluded_at_relevance: stage(ExclusionStage::Relevance),
			relevance_unknown: state
				.candidates
				.iter()
				.filter(|c| c.relevance.as_ref().is_some_and(|r| r.score().is_none()))
				.count(),
			assessed: state.candidates.iter().filter(|c| c.composite.is_some()).count(),
			// Net of reviewer inclusions.
			excluded_at_gate: state
				.candidates
				.iter()
				.filter(|c| c.exclusion_stage() == Some(ExclusionStage::Gate) && !c.is_included())
				.count(),
			uncertain: state.candidates.iter().filter(|c| c.is_uncertain()).count(),
			adjudicated_included: adjudicated(AdjudicationDecision::Include),
			adjudicated_excluded: adjudicated(AdjudicationDecision::Exclude),
			included: state.candidates.iter().filter(|c| c.is_included()).count(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
	pub run_id: Uuid,
	pub status: RunStatus,
	pub phase: Phase,
	pub model: String,
	pub settings: ReviewSettings,
	#[serde(with = "sieve_domain::timestamp")]
	pub created_at: OffsetDateTime,
	#[serde(with = "sieve_domain::timestamp")]
	pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportReference {
	pub number: u32,
	pub citation_id: Uuid,
	pub paper_id: String,
	pub title: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub year: Option<i32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub journal: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub doi: Option<String>,
	pub cited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
	pub path: SynthesisPath,
	pub text: String,
	pub references: Vec<ExportReference>,
}

/// Everything needed to reproduce and audit a review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewExport {
	pub run: RunMetadata,
	pub question: ResearchQuestion,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub plan: Option<SearchPlan>,
	pub prisma: PrismaCounts,
	pub candidates: Vec<Candidate>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub report: Option<ReportSection>,
	pub audit: Vec<AuditRecord>,
}
impl ReviewExport {
	pub fn from_state(state: &RunState) -> Self {
		let report = state.synthesis.as_ref().map(|synthesis| ReportSection {
			path: synthesis.path,
			text: synthesis.report.text.clone(),
			references: synthesis
				.report
				.references
				.iter()
				.map(|reference| {
					let candidate = state.candidate(&reference.paper_id);

					ExportReference {
						number: reference.number,
						citation_id: reference.citation_id,
						paper_id: reference.paper_id.clone(),
						title: candidate.map(|c| c.title.clone()).unwrap_or_default(),
						year: candidate.and_then(|c| c.metadata.year),
						journal: candidate.and_then(|c| c.metadata.journal.clone()),
						doi: candidate.and_then(|c| c.metadata.doi.clone()),
						cited: reference.cited,
					}
				})
				.collect(),
		});

		Self {
			run: RunMetadata {
				run_id: state.run_id,
				status: state.status,
				phase: state.phase,
				model: state.model.clone(),
				settings: state.settings.clone(),
				created_at: state.created_at,
				updated_at: state.updated_at,
			},
			question: state.question.clone(),
			plan: state.plan.clone(),
			prisma: PrismaCounts::from_state(state),
			candidates: state.candidates.clone(),
			report,
			audit: state.log.records().to_vec(),
		}
	}

	pub fn to_markdown(&self) -> String {
		let mut out = String::new();
		let prisma = &self.prisma;

		out.push_str(&format!("# Systematic review: {}\n\n", self.question.text.trim()));
		out.push_str(&format!(
			"Run `{}` · status {} · model {}\n\n",
			self.run.run_id,
			self.run.status.as_str(),
			self.run.model
		));
		out.push_str("## Question\n\n");

		let pico = &self.question.pico;

		out.push_str(&format!("- Population: {}\n", pico.population));
		out.push_str(&format!("- Intervention: {}\n", pico.intervention));

		if let Some(comparison) = &pico.comparison {
			out.push_str(&format!("- Comparison: {comparison}\n"));
		}

		out.push_str(&format!("- Outcome: {}\n\n", pico.outcome));
		out.push_str("## Findings\n\n");

		match &self.report {
			Some(report) => {
				out.push_str(report.text.trim());
				out.push_str("\n\n## References\n\n");

				for reference in &report.references {
					out.push_str(&format!("{}. {}", reference.number, reference.title.trim()));

					if let Some(year) = reference.year {
						out.push_str(&format!(" ({year})"));
					}
					if let Some(journal) = &reference.journal {
						out.push_str(&format!(". {journal}"));
					}
					if let Some(doi) = &reference.doi {
						out.push_str(&format!(". doi:{doi}"));
					}
					if !reference.cited {
						out.push_str(" (not cited in text)");
					}

					out.push('\n');
				}

				out.push('\n');
			},
			None => out.push_str("Synthesis has not run.\n\n"),
		}

		out.push_str("## Study flow\n\n| Stage | Records |\n| --- | ---: |\n");

		for (label, count) in [
			("Identified", prisma.identified),
			("Duplicates merged", prisma.duplicates_merged),
			("Screened", prisma.screened),
			("Excluded by screening rules", prisma.excluded_at_filter),
			("Excluded as not relevant", prisma.excluded_at_relevance),
			("Relevance unknown (retained)", prisma.relevance_unknown),
			("Quality assessed", prisma.assessed),
			("Excluded at quality gate", prisma.excluded_at_gate),
			("Uncertain", prisma.uncertain),
			("Included by reviewer", prisma.adjudicated_included),
			("Excluded by reviewer", prisma.adjudicated_excluded),
			("Included", prisma.included),
		] {
			out.push_str(&format!("| {label} | {count} |\n"));
		}

		out
	}
}

#[cfg(test)]
mod tests {
	use time::OffsetDateTime;
	use uuid::Uuid;

	use super::*;
	use crate::ReviewSettings;
	use sieve_domain::{
		candidate::PaperMetadata,
		question::{Pico, ResearchQuestion},
	};

	fn state() -> RunState {
		let question = ResearchQuestion {
			text: "Does metformin reduce cancer incidence?".to_string(),
			pico: Pico {
				population: "adults".to_string(),
				intervention: "metformin".to_string(),
				comparison: None,
				outcome: "cancer incidence".to_string(),
			},
			inclusion_criteria: Vec::new(),
			exclusion_criteria: Vec::new(),
		};
		let mut state = RunState::new(
			Uuid::from_u128(1),
			question,
			ReviewSettings::default(),
			"test-model",
			OffsetDateTime::UNIX_EPOCH,
		);

		state.candidates = vec![
			Candidate::new("a", "Editorial: metformin", "", PaperMetadata::default()),
			Candidate::new("b", "Metformin cohort", "", PaperMetadata::default()),
		];

		state
	}

	#[test]
	fn counts_follow_exclusion_stages() {
		let mut state = state();
		let now = OffsetDateTime::UNIX_EPOCH;

		state.candidates[0]
			.exclude(ExclusionStage::Filter, "Title starts with editorial.", now)
			.expect("First exclusion must succeed.");

		let counts = PrismaCounts::from_state(&state);

		assert_eq!(counts.excluded_at_filter, 1);
		assert_eq!(counts.included, 0);
		assert_eq!(counts.identified, 0);
	}

	#[test]
	fn markdown_without_synthesis_says_so() {
		let markdown = ReviewExport::from_state(&state()).to_markdown();

		assert!(markdown.starts_with("# Systematic review: Does metformin reduce cancer incidence?"));
		assert!(markdown.contains("Synthesis has not run."));
		assert!(markdown.contains("| Screened | 0 |"));
	}
}
