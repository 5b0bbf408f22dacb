//! Recall benchmark: runs a review (or reads a finished export) and checks it against a set of
//! papers known to answer the question. Every miss is traced to the stage that dropped it.

use std::{
	collections::HashSet,
	fs,
	path::{Path, PathBuf},
};

use clap::Parser;
use color_eyre::eyre;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sieve_domain::{phase::RunStatus, question::ResearchQuestion};
use sieve_service::{ReviewExport, SieveService, StartRunRequest};

pub const NOT_RETRIEVED: &str = "not_retrieved";

#[derive(Debug, Parser)]
#[command(
	version = sieve_cli::VERSION,
	rename_all = "kebab",
	styles = sieve_cli::styles(),
)]
pub struct Args {
	/// Configuration for a live run. Required unless --export is given.
	#[arg(long, short = 'c', value_name = "FILE", required_unless_present = "export")]
	pub config: Option<PathBuf>,
	#[arg(long, short = 'd', value_name = "FILE")]
	pub dataset: PathBuf,
	/// Score an existing review export instead of running a new review.
	#[arg(long, value_name = "FILE", conflicts_with = "config")]
	pub export: Option<PathBuf>,
	/// Write the report here instead of stdout.
	#[arg(long, short = 'o', value_name = "FILE")]
	pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecallDataset {
	pub name: Option<String>,
	pub question: ResearchQuestion,
	pub expected_paper_ids: Vec<String>,
	/// Settings patch applied to a live run.
	#[serde(default)]
	pub overrides: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct EvalOutput {
	pub dataset: DatasetInfo,
	pub source: EvalSource,
	pub summary: RecallSummary,
	pub misses: Vec<Miss>,
}

#[derive(Debug, Serialize)]
pub struct DatasetInfo {
	pub name: String,
	pub expected_count: usize,
}

#[derive(Debug, Serialize)]
pub struct EvalSource {
	pub mode: &'static str,
	pub path: String,
	pub run_id: Uuid,
	pub status: RunStatus,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct RecallSummary {
	pub expected_count: usize,
	pub found_count: usize,
	pub included_count: usize,
	pub recall: f64,
	pub precision: f64,
}

/// An expected paper the review did not include.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Miss {
	pub paper_id: String,
	/// Exclusion stage, `uncertain`, `pending`, or `not_retrieved`.
	pub stage: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rationale: Option<String>,
	/// Last audit record about the paper.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub audit_seq: Option<u64>,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let dataset = load_dataset(&args.dataset)?;
	let (source, export) = match (&args.export, &args.config) {
		(Some(path), _) => {
			init_tracing("info");

			let raw = fs::read_to_string(path)?;
			let export: ReviewExport = serde_json::from_str(&raw)?;

			(source("export", path, &export), export)
		},
		(None, Some(path)) => {
			let export = live_review(path, &dataset).await?;

			(source("live", path, &export), export)
		},
		(None, None) => return Err(eyre::eyre!("Either --config or --export is required.")),
	};

	if export.question.text.trim() != dataset.question.text.trim() {
		tracing::warn!(
			run_id = %export.run.run_id,
			"Export question differs from the dataset question; recall may not be meaningful."
		);
	}

	let (summary, misses) = evaluate(&dataset.expected_paper_ids, &export);

	tracing::info!(
		run_id = %export.run.run_id,
		recall = summary.recall,
		misses = misses.len(),
		"Recall evaluated."
	);

	let output = EvalOutput {
		dataset: DatasetInfo {
			name: dataset.name.clone().unwrap_or_else(|| "recall".to_string()),
			expected_count: summary.expected_count,
		},
		source,
		summary,
		misses,
	};
	let json = serde_json::to_string_pretty(&output)?;

	match &args.output {
		Some(path) => fs::write(path, json)?,
		None => println!("{json}"),
	}

	Ok(())
}

/// Scores `export` against the expected ids. Duplicate expected ids count once.
pub fn evaluate(expected_paper_ids: &[String], export: &ReviewExport) -> (RecallSummary, Vec<Miss>) {
	let mut seen = HashSet::new();
	let expected: Vec<&str> = expected_paper_ids
		.iter()
		.map(|paper_id| paper_id.trim())
		.filter(|paper_id| !paper_id.is_empty() && seen.insert(*paper_id))
		.collect();
	let included_count = export.candidates.iter().filter(|candidate| candidate.is_included()).count();
	let mut misses = Vec::new();

	for paper_id in &expected {
		let Some(candidate) = export.candidates.iter().find(|candidate| candidate.paper_id == *paper_id)
		else {
			misses.push(Miss {
				paper_id: paper_id.to_string(),
				stage: NOT_RETRIEVED.to_string(),
				rationale: None,
				audit_seq: None,
			});

			continue;
		};

		if candidate.is_included() {
			continue;
		}

		let (stage, rationale) = match (&candidate.exclusion, &candidate.composite) {
			(Some(exclusion), _) => (exclusion.stage.as_str(), Some(exclusion.rationale.clone())),
			(None, Some(composite)) if candidate.is_uncertain() => ("uncertain", Some(composite.rationale())),
			_ => ("pending", None),
		};
		let audit_seq = export
			.audit
			.iter()
			.rev()
			.find(|record| record.subject.as_deref() == Some(*paper_id))
			.map(|record| record.seq);

		misses.push(Miss { paper_id: paper_id.to_string(), stage: stage.to_string(), rationale, audit_seq });
	}

	let expected_count = expected.len();
	let found_count = expected_count - misses.len();
	let summary = RecallSummary {
		expected_count,
		found_count,
		included_count,
		recall: ratio(found_count, expected_count),
		precision: ratio(found_count, included_count),
	};

	(summary, misses)
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
	if denominator == 0 {
		return 0.0;
	}

	numerator as f64 / denominator as f64
}

fn load_dataset(path: &Path) -> color_eyre::Result<RecallDataset> {
	let raw = fs::read_to_string(path)?;
	let dataset: RecallDataset = serde_json::from_str(&raw)?;

	if dataset.expected_paper_ids.iter().all(|paper_id| paper_id.trim().is_empty()) {
		return Err(eyre::eyre!("Dataset must include at least one expected paper id."));
	}

	Ok(dataset)
}

async fn live_review(config_path: &Path, dataset: &RecallDataset) -> color_eyre::Result<ReviewExport> {
	let mut config = sieve_config::load(config_path)?;

	init_tracing(&config.service.log_level);

	config.runtime.checkpoint_mode = "automatic".to_string();

	let service = SieveService::connect(config).await?;
	let summary = service
		.start_run(StartRunRequest {
			question: dataset.question.clone(),
			overrides: dataset.overrides.clone(),
		})
		.await?;

	if let Some(failure) = &summary.failure {
		tracing::warn!(
			run_id = %summary.run_id,
			phase = failure.phase.as_str(),
			error_code = %failure.error_code,
			"Benchmark run failed; scoring what it produced."
		);
	}

	Ok(service.export(summary.run_id).await?)
}

fn source(mode: &'static str, path: &Path, export: &ReviewExport) -> EvalSource {
	EvalSource {
		mode,
		path: path.display().to_string(),
		run_id: export.run.run_id,
		status: export.run.status,
	}
}

fn init_tracing(log_level: &str) {
	let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_writer(std::io::stderr).with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
	use time::OffsetDateTime;

	use super::*;
	use sieve_domain::{
		audit::AuditEntry,
		candidate::{
			Adjudication, AdjudicationDecision, Candidate, PaperMetadata, RelevanceOutcome,
			RelevanceScore,
		},
		phase::Phase,
		question::Pico,
	};
	use sieve_service::{ReviewSettings, RunState};

	fn question() -> ResearchQuestion {
		ResearchQuestion {
			text: "Does metformin reduce colorectal cancer incidence?".to_string(),
			pico: Pico {
				population: "adults with type 2 diabetes".to_string(),
				intervention: "metformin".to_string(),
				comparison: None,
				outcome: "colorectal cancer incidence".to_string(),
			},
			inclusion_criteria: Vec::new(),
			exclusion_criteria: Vec::new(),
		}
	}

	fn candidate(paper_id: &str) -> Candidate {
		Candidate::new(paper_id, format!("Trial {paper_id}"), "Randomized trial.", PaperMetadata::default())
	}

	fn included(paper_id: &str, at: OffsetDateTime) -> Candidate {
		let mut candidate = candidate(paper_id);

		candidate.adjudication = Some(Adjudication {
			decision: AdjudicationDecision::Include,
			note: "Eligible.".to_string(),
			reviewer: "reviewer".to_string(),
			adjudicated_at: at,
		});

		candidate
	}

	fn export() -> ReviewExport {
		let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("Valid timestamp.");
		let mut state =
			RunState::new(Uuid::new_v4(), question(), ReviewSettings::default(), "test", now);
		let mut off_topic = candidate("pmid:3");

		off_topic
			.attach_relevance(
				RelevanceOutcome::Scored(RelevanceScore {
					score: 2,
					rationale: "Population is pediatric.".to_string(),
					model: "test".to_string(),
					scored_at: now,
				}),
				2.5,
				now,
			)
			.expect("Relevance must attach.");

		state.candidates = vec![included("pmid:1", now), included("pmid:2", now), off_topic];
		state.audit(AuditEntry::new("retrieval", "candidate_pooled").subject("pmid:3"));
		state.audit(
			AuditEntry::new("relevance", "relevance_scored")
				.phase(Phase::FilteringScoring)
				.subject("pmid:3"),
		);

		ReviewExport::from_state(&state)
	}

	#[test]
	fn full_recall_has_no_misses() {
		let (summary, misses) =
			evaluate(&["pmid:1".to_string(), "pmid:2".to_string(), "pmid:1".to_string()], &export());

		assert_eq!(summary.expected_count, 2);
		assert_eq!(summary.found_count, 2);
		assert!((summary.recall - 1.0).abs() < 1e-12);
		assert!((summary.precision - 1.0).abs() < 1e-12);
		assert!(misses.is_empty());
	}

	#[test]
	fn misses_carry_their_exclusion_stage_and_rationale() {
		let expected = ["pmid:1", "pmid:3", "pmid:9"].map(str::to_string);
		let (summary, misses) = evaluate(&expected, &export());

		assert_eq!(summary.found_count, 1);
		assert!((summary.recall - 1.0 / 3.0).abs() < 1e-12, "Unexpected recall: {}", summary.recall);
		assert_eq!(
			misses,
			vec![
				Miss {
					paper_id: "pmid:3".to_string(),
					stage: "relevance".to_string(),
					rationale: Some("Population is pediatric.".to_string()),
					audit_seq: Some(2),
				},
				Miss {
					paper_id: "pmid:9".to_string(),
					stage: NOT_RETRIEVED.to_string(),
					rationale: None,
					audit_seq: None,
				},
			]
		);
	}

	#[test]
	fn ungated_candidates_are_pending() {
		let mut export = export();

		export.candidates.push(candidate("pmid:4"));

		let (_, misses) = evaluate(&["pmid:4".to_string()], &export);

		assert_eq!(misses[0].stage, "pending");
		assert_eq!(misses[0].rationale, None);
	}
}
