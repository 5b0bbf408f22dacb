//! Filter cascade over the candidate pool, the first half of the filtering and scoring phase.

use serde_json::json;
use time::OffsetDateTime;

use crate::{PhaseError, RunContext, state::RunState};
use sieve_domain::{audit::AuditEntry, filter::FilterCascade, phase::Phase};

const ACTOR: &str = "screener";

/// Attaches exactly one verdict to every candidate. Failing verdicts exclude at the filter stage.
pub(crate) fn run(ctx: &RunContext, state: &mut RunState) -> Result<(), PhaseError> {
	let cascade = FilterCascade::new(&ctx.settings.filter, &state.question.exclusion_criteria)?;
	let now = OffsetDateTime::now_utc();
	let mut entries = Vec::with_capacity(state.candidates.len());
	let mut excluded = 0;

	for candidate in &mut state.candidates {
		let verdict = cascade.evaluate(&candidate.title, &candidate.abstract_text);
		let action = if verdict.passed { "filter_passed" } else { "filter_excluded" };
		let entry = AuditEntry::new(ACTOR, action)
			.phase(Phase::FilteringScoring)
			.subject(candidate.paper_id.clone())
			.input(candidate.title.clone())
			.output(match verdict.tier.number() {
				Some(tier) => format!("Tier {tier} verdict, passed: {}.", verdict.passed),
				None => format!("No tier fired, passed: {}.", verdict.passed),
			})
			.rationale(verdict.rationale.clone())
			.metrics(json!({
				"tier": verdict.tier,
				"confidence": verdict.confidence,
				"matched_pattern": verdict.matched_pattern,
			}));

		if !verdict.passed {
			excluded += 1;
		}

		candidate.attach_filter_verdict(verdict, now)?;
		entries.push(entry);
	}

	let screened = entries.len();

	for entry in entries {
		state.audit(entry);
	}

	state.audit(
		AuditEntry::new(ACTOR, "filter_summary")
			.phase(Phase::FilteringScoring)
			.input(format!("{screened} candidates screened."))
			.output(format!("{excluded} excluded, {} passed.", screened - excluded))
			.metrics(json!({ "screened": screened, "excluded": excluded })),
	);
	tracing::info!(run_id = %ctx.run_id, screened, excluded, "Filter cascade applied.");

	Ok(())
}
