//! Quality-assessment phase.
//!
//! Every evaluator whose suitability rule admits a candidate's study type runs as its own pool
//! unit. Suitability looks only at the candidate record, and evaluators never see each other's
//! output, so they are independent by construction. A failed evaluator yields an `Unknown`
//! assessment instead of aborting the candidate. Once every unit has reported, the composite
//! scorer and the gate run over the surviving candidates.

pub mod evaluators;

use std::sync::Arc;

use serde_json::json;
use time::OffsetDateTime;

use crate::{
	BoxFuture, CollaboratorError, PhaseError, Providers, RunContext, WorkPool, gate,
	state::RunState,
};
use sieve_config::Quality;
use sieve_domain::{
	audit::AuditEntry,
	candidate::{AssessmentStatus, Candidate, Confidence, Findings, QualityAssessment},
	phase::Phase,
};

const ACTOR: &str = "quality_orchestrator";

/// Successful evaluator output.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessed {
	pub findings: Findings,
	pub confidence: Confidence,
	pub model: String,
	pub prompt_digest: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorFailure {
	pub error: CollaboratorError,
	pub prompt_digest: String,
}

pub trait Evaluator
where
	Self: Send + Sync,
{
	fn name(&self) -> &'static str;

	fn suitable(&self, candidate: &Candidate) -> bool;

	fn assess<'a>(
		&'a self,
		ctx: &'a RunContext,
		providers: &'a Providers,
		candidate: &'a Candidate,
	) -> BoxFuture<'a, Result<Assessed, EvaluatorFailure>>;
}

/// Evaluators in configuration order. Disabled rules are kept so skips are audited.
pub fn registry(cfg: &Quality) -> Vec<Arc<dyn Evaluator>> {
	cfg.evaluators.iter().filter_map(|rule| evaluators::for_rule(rule.clone())).collect()
}

struct UnitOutcome {
	paper_id: String,
	evaluator: &'static str,
	result: Result<Assessed, EvaluatorFailure>,
}

pub(crate) async fn run(
	ctx: &Arc<RunContext>,
	providers: &Providers,
	state: &mut RunState,
) -> Result<(), PhaseError> {
	let registry = registry(&ctx.settings.quality);
	let mut active: Vec<Candidate> = state.active_candidates().cloned().collect();

	active.sort_by(|a, b| a.paper_id.cmp(&b.paper_id));

	let mut units = Vec::new();
	let mut unit_keys = Vec::new();
	let mut dispatch = Vec::with_capacity(active.len());

	for candidate in active {
		let candidate = Arc::new(candidate);
		let (chosen, skipped): (Vec<_>, Vec<_>) =
			registry.iter().partition(|evaluator| evaluator.suitable(&candidate));

		dispatch.push(
			AuditEntry::new(ACTOR, "evaluators_dispatched")
				.phase(Phase::QualityAssessment)
				.subject(candidate.paper_id.clone())
				.input(format!("Study type hint {}.", candidate.study_type.label()))
				.output(format!("{} evaluators dispatched.", chosen.len()))
				.rationale("Suitability rules matched against the study type hint.")
				.metrics(json!({
					"study_type": candidate.study_type.label(),
					"dispatched": chosen.iter().map(|evaluator| evaluator.name()).collect::<Vec<_>>(),
					"skipped": skipped.iter().map(|evaluator| evaluator.name()).collect::<Vec<_>>(),
				})),
		);

		for evaluator in chosen {
			let evaluator = evaluator.clone();
			let candidate = candidate.clone();
			let ctx = ctx.clone();
			let providers = providers.clone();

			unit_keys.push((candidate.paper_id.clone(), evaluator.name()));
			units.push(async move {
				let result = evaluator.assess(&ctx, &providers, &candidate).await;

				UnitOutcome { paper_id: candidate.paper_id.clone(), evaluator: evaluator.name(), result }
			});
		}
	}

	for entry in dispatch {
		state.audit(entry);
	}

	let pool = WorkPool::new(
		ctx.settings.runtime.max_concurrency,
		ctx.cancel.clone(),
		ctx.settings.runtime.abandon_inflight_on_cancel,
	);
	let run = pool.run_all(units).await;
	let mut completed = 0;
	let mut unknown = 0;

	for (_, outcome) in run.completed {
		let now = OffsetDateTime::now_utc();
		let (assessment, entry) = match outcome.result {
			Ok(assessed) => {
				completed += 1;

				let entry = AuditEntry::new(outcome.evaluator, "quality_assessed")
					.phase(Phase::QualityAssessment)
					.subject(outcome.paper_id.clone())
					.output(findings_summary(&assessed.findings))
					.rationale(findings_rationale(&assessed.findings))
					.metrics(json!({
						"confidence": assessed.confidence,
						"model": assessed.model,
						"prompt_digest": assessed.prompt_digest,
					}));
				let assessment = QualityAssessment {
					evaluator: outcome.evaluator.to_string(),
					status: AssessmentStatus::Completed,
					findings: assessed.findings,
					confidence: assessed.confidence,
					error: None,
					model: assessed.model,
					assessed_at: now,
				};

				(assessment, entry)
			},
			Err(failure) => {
				unknown += 1;

				let entry = AuditEntry::new(outcome.evaluator, "quality_unknown")
					.phase(Phase::QualityAssessment)
					.subject(outcome.paper_id.clone())
					.output("Assessment unavailable; dimension left unknown.")
					.rationale(failure.error.to_string())
					.metrics(json!({
						"error_kind": failure.error.kind(),
						"model": ctx.model(),
						"prompt_digest": failure.prompt_digest,
					}));
				let assessment = QualityAssessment::unknown(
					outcome.evaluator,
					ctx.model(),
					failure.error.to_string(),
					now,
				);

				(assessment, entry)
			},
		};
		let Some(candidate) = state.candidate_mut(&outcome.paper_id) else {
			return Err(PhaseError::invariant(format!(
				"Assessed paper {} is not in the candidate pool.",
				outcome.paper_id
			)));
		};

		candidate.attach_assessment(assessment)?;
		state.audit(entry);
	}

	for (unit, panic) in run.panicked {
		unknown += 1;

		let Some((paper_id, evaluator)) = unit_keys.get(unit) else {
			return Err(PhaseError::invariant(format!("Quality unit {unit} has no dispatch record.")));
		};
		let Some(candidate) = state.candidate_mut(paper_id) else {
			return Err(PhaseError::invariant(format!(
				"Assessed paper {paper_id} is not in the candidate pool."
			)));
		};

		candidate.attach_assessment(QualityAssessment::unknown(
			evaluator,
			ctx.model(),
			panic.clone(),
			OffsetDateTime::now_utc(),
		))?;
		state.audit(
			AuditEntry::new(*evaluator, "quality_unknown")
				.phase(Phase::QualityAssessment)
				.subject(paper_id.clone())
				.output("Assessment unavailable; dimension left unknown.")
				.rationale(panic)
				.metrics(json!({ "error_kind": "panic", "model": ctx.model(), "unit": unit })),
		);
	}

	if run.cancelled {
		return Err(PhaseError::Cancelled);
	}

	tracing::info!(run_id = %ctx.run_id, completed, unknown, "Quality assessment finished.");

	gate::run(ctx, state)
}

fn findings_summary(findings: &Findings) -> String {
	match findings {
		Findings::StudyDesign { design, .. } => format!("Design {design:?}."),
		Findings::RiskOfBias { domains, overall } =>
			format!("Overall risk {overall:?} across {} domains.", domains.len()),
		Findings::Extraction { sample_size, key_findings, .. } => format!(
			"Sample size {}; {} key findings.",
			sample_size.map_or_else(|| "unknown".to_string(), |n| n.to_string()),
			key_findings.len()
		),
		Findings::Compliance { checklist, items } => format!(
			"{checklist}: {}/{} items satisfied.",
			items.iter().filter(|item| item.satisfied).count(),
			items.len()
		),
		Findings::Unavailable => "No findings.".to_string(),
	}
}

fn findings_rationale(findings: &Findings) -> String {
	match findings {
		Findings::StudyDesign { rationale, .. } => rationale.clone(),
		Findings::RiskOfBias { domains, .. } => domains
			.iter()
			.map(|domain| format!("{}: {:?}", domain.domain, domain.rating))
			.collect::<Vec<_>>()
			.join("; "),
		Findings::Extraction { key_findings, .. } => key_findings.join(" "),
		Findings::Compliance { items, .. } => items
			.iter()
			.filter(|item| !item.satisfied)
			.map(|item| format!("missing {}", item.item))
			.collect::<Vec<_>>()
			.join("; "),
		Findings::Unavailable => String::new(),
	}
}
