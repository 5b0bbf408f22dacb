use serde_json::json;
use time::OffsetDateTime;

use crate::{PhaseError, RunContext, state::RunState};
use sieve_domain::{
	audit::AuditEntry,
	composite::{CompositeInputs, GateDecision},
	phase::Phase,
};

const ACTOR: &str = "composite_gate";

/// Scores every candidate still in the review and applies the inclusion gate.
pub(crate) fn run(ctx: &RunContext, state: &mut RunState) -> Result<(), PhaseError> {
	let now = OffsetDateTime::now_utc();
	let mut entries = Vec::new();
	let mut tally = (0_usize, 0_usize, 0_usize);

	for candidate in state.candidates.iter_mut().filter(|candidate| !candidate.is_excluded()) {
		let inputs = CompositeInputs::derive(candidate, &ctx.derivation);
		let composite = ctx.scorer.score(&inputs);
		let (action, output) = match composite.decision {
			GateDecision::Included => {
				tally.0 += 1;

				("gate_included", format!("Composite {:.2} passes the gate.", composite.score))
			},
			GateDecision::Excluded => {
				tally.1 += 1;

				("gate_excluded", format!("Composite {:.2} is below the gate.", composite.score))
			},
			GateDecision::Uncertain => {
				tally.2 += 1;

				(
					"gate_uncertain",
					format!(
						"Coverage {:.2} is too low to decide; awaiting adjudication.",
						composite.coverage
					),
				)
			},
		};

		entries.push(
			AuditEntry::new(ACTOR, action)
				.phase(Phase::QualityAssessment)
				.subject(candidate.paper_id.clone())
				.output(output)
				.rationale(composite.rationale())
				.metrics(json!({
					"score": composite.score,
					"coverage": composite.coverage,
					"gate_threshold": composite.gate_threshold,
					"breakdown": composite.breakdown,
				})),
		);

		candidate.attach_composite(composite, now)?;
	}

	for entry in entries {
		state.audit(entry);
	}

	tracing::info!(
		run_id = %ctx.run_id,
		included = tally.0,
		excluded = tally.1,
		uncertain = tally.2,
		"Composite gate applied."
	);

	Ok(())
}
