use std::{
	fs,
	path::{Path, PathBuf},
};

use clap::Parser;
use color_eyre::eyre;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sieve_service::{ReviewExport, RunSummary, SieveService, StartRunRequest};

pub const EXPORT_FILE: &str = "export.json";
pub const REPORT_FILE: &str = "report.md";

/// Runs one review end to end without checkpoints and writes its exports.
#[derive(Debug, Parser)]
#[command(
	version = sieve_cli::VERSION,
	rename_all = "kebab",
	styles = sieve_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	/// JSON file holding `question` and optional `overrides`.
	#[arg(long, short = 'q', value_name = "FILE", required_unless_present = "resume")]
	pub question: Option<PathBuf>,
	/// Resume a failed run instead of starting a new one.
	#[arg(long, value_name = "RUN_ID", conflicts_with = "question")]
	pub resume: Option<Uuid>,
	#[arg(long, short = 'o', value_name = "DIR", default_value = ".")]
	pub out: PathBuf,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let mut config = sieve_config::load(&args.config)?;
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).init();

	config.runtime.checkpoint_mode = "automatic".to_string();

	let service = SieveService::connect(config).await?;
	let summary = match (&args.resume, &args.question) {
		(Some(run_id), _) => service.resume(*run_id).await?,
		(None, Some(path)) => service.start_run(load_request(path)?).await?,
		(None, None) => return Err(eyre::eyre!("Either --question or --resume is required.")),
	};
	let export = service.export(summary.run_id).await?;
	let (export_path, report_path) = write_outputs(&args.out, &export)?;

	tracing::info!(
		run_id = %summary.run_id,
		status = summary.status.as_str(),
		included = summary.counts.included,
		export = %export_path.display(),
		report = %report_path.display(),
		"Review exports written."
	);

	check_outcome(&summary)
}

pub fn load_request(path: &Path) -> color_eyre::Result<StartRunRequest> {
	let raw = fs::read_to_string(path)?;
	let request: StartRunRequest = serde_json::from_str(&raw)?;

	Ok(request)
}

/// Writes the JSON export and the Markdown report into `dir`, creating it if needed.
pub fn write_outputs(dir: &Path, export: &ReviewExport) -> color_eyre::Result<(PathBuf, PathBuf)> {
	fs::create_dir_all(dir)?;

	let export_path = dir.join(EXPORT_FILE);
	let report_path = dir.join(REPORT_FILE);

	fs::write(&export_path, serde_json::to_string_pretty(export)?)?;
	fs::write(&report_path, export.to_markdown())?;

	Ok((export_path, report_path))
}

fn check_outcome(summary: &RunSummary) -> color_eyre::Result<()> {
	match &summary.failure {
		Some(failure) => Err(eyre::eyre!(
			"Run {} failed during {} with {}: {}. Resume it with --resume {}.",
			summary.run_id,
			failure.phase.as_str(),
			failure.error_code,
			failure.message,
			summary.run_id
		)),
		None => Ok(()),
	}
}

#[cfg(test)]
mod tests {
	use std::env;

	use time::OffsetDateTime;

	use super::*;
	use sieve_domain::question::{Pico, ResearchQuestion};
	use sieve_service::{ReviewSettings, RunState};

	fn export() -> ReviewExport {
		let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("Valid timestamp.");
		let question = ResearchQuestion {
			text: "Does metformin reduce colorectal cancer incidence?".to_string(),
			pico: Pico {
				population: "adults with type 2 diabetes".to_string(),
				intervention: "metformin".to_string(),
				comparison: None,
				outcome: "colorectal cancer incidence".to_string(),
			},
			inclusion_criteria: Vec::new(),
			exclusion_criteria: Vec::new(),
		};

		ReviewExport::from_state(&RunState::new(
			Uuid::new_v4(),
			question,
			ReviewSettings::default(),
			"test",
			now,
		))
	}

	#[test]
	fn outputs_land_in_a_fresh_directory() {
		let dir = env::temp_dir().join(format!("sieve-review-{}", Uuid::new_v4()));
		let export = export();
		let (export_path, report_path) =
			write_outputs(&dir.join("nested"), &export).expect("Outputs must be written.");
		let json: serde_json::Value = serde_json::from_str(
			&fs::read_to_string(&export_path).expect("Export must be readable."),
		)
		.expect("Export must be JSON.");
		let report = fs::read_to_string(&report_path).expect("Report must be readable.");

		assert_eq!(json["run"]["run_id"], export.run.run_id.to_string());
		assert!(report.starts_with("# Systematic review: Does metformin"));

		fs::remove_dir_all(&dir).expect("Failed to remove the output directory.");
	}

	#[test]
	fn request_files_accept_optional_overrides() {
		let dir = env::temp_dir().join(format!("sieve-review-{}", Uuid::new_v4()));

		fs::create_dir_all(&dir).expect("Failed to create the directory.");

		let path = dir.join("question.json");

		fs::write(
			&path,
			r#"{
				"question": {
					"text": "Does metformin reduce colorectal cancer incidence?",
					"pico": { "population": "adults", "intervention": "metformin", "outcome": "cancer" }
				},
				"overrides": { "relevance": { "threshold": 3.0 } }
			}"#,
		)
		.expect("Failed to write the question file.");

		let request = load_request(&path).expect("Request must parse.");

		assert!(request.question.exclusion_criteria.is_empty());
		assert_eq!(request.overrides.and_then(|value| value["relevance"]["threshold"].as_f64()), Some(3.0));

		fs::remove_dir_all(&dir).expect("Failed to remove the directory.");
	}
}
