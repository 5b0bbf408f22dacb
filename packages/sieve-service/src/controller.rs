//! Run lifecycle. The controller is the only place that moves a run between phases: it executes a
//! phase on a draft of the state, commits the draft at the boundary, persists, and then either
//! returns control to the caller (interactive) or approves on its own (automatic).

use std::{future::Future, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
	CancelToken, Checkpoint, Error, FailureRecord, PhaseError, PrismaCounts, Providers, Result,
	ReviewExport, ReviewSettings, RunContext, RunState, RunSummary, SieveService, planner, quality,
	relevance, retrieval, screening, synthesis,
};
use sieve_domain::{
	audit::AuditEntry,
	candidate::{Adjudication, AdjudicationDecision, ExclusionStage},
	phase::{Phase, RunStatus},
	question::ResearchQuestion,
};

const ACTOR: &str = "controller";
const REVIEWER: &str = "reviewer";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRunRequest {
	pub question: ResearchQuestion,
	/// JSON merge patch over the configured review settings.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub overrides: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointDecision {
	Approve,
	Modify,
	Reject,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointParams {
	/// Settings patch for `modify`.
	pub overrides: Option<Value>,
	/// Reviewer decisions carried by `approve` at the quality-assessment checkpoint.
	pub adjudications: Vec<Adjudicate>,
	pub reviewer: Option<String>,
	pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adjudicate {
	pub paper_id: String,
	pub decision: AdjudicationDecision,
	pub note: String,
}

impl SieveService {
	/// Validates and persists a new run without executing any phase.
	pub async fn create_run(&self, request: StartRunRequest) -> Result<RunSummary> {
		request.question.validate()?;

		let base = ReviewSettings::from_config(&self.cfg);
		let settings = match &request.overrides {
			Some(overrides) => base.with_overrides(&self.cfg, overrides)?,
			None => base,
		};
		let run_id = Uuid::new_v4();
		let now = OffsetDateTime::now_utc();

		// Weights and thresholds are checked here so a bad run never reaches PLANNING.
		RunContext::new(&self.cfg, run_id, settings.clone(), now, CancelToken::default())?;

		let mut state =
			RunState::new(run_id, request.question, settings, self.cfg.providers.llm.model.clone(), now);

		state.audit(
			AuditEntry::new(ACTOR, "run_created")
				.input(state.question.text.clone())
				.output(format!("Checkpoint mode is {}.", state.settings.runtime.checkpoint_mode))
				.metrics(json!({
					"settings": serde_json::to_value(&state.settings)?,
					"model": state.model,
				})),
		);
		self.store.save(&state).await?;

		tracing::info!(run_id = %run_id, "Review run created.");

		Ok(state.summary())
	}

	/// Creates a run and drives it to its first checkpoint, or to the end in automatic mode.
	pub async fn start_run(&self, request: StartRunRequest) -> Result<RunSummary> {
		let created = self.create_run(request).await?;

		self.advance(created.run_id).await
	}

	/// Executes phases of a `RUNNING` run until the next checkpoint or a terminal state.
	pub async fn advance(&self, run_id: Uuid) -> Result<RunSummary> {
		self.exclusive(run_id, |cancel| async move {
			let mut state = self.load_state(run_id).await?;

			if state.status != RunStatus::Running {
				return Err(Error::Conflict {
					message: format!("Run {run_id} is {} and cannot advance.", state.status.as_str()),
				});
			}

			self.drive(&mut state, cancel).await?;

			Ok(state.summary())
		})
		.await
	}

	pub async fn get_run(&self, run_id: Uuid) -> Result<RunSummary> {
		Ok(self.load_state(run_id).await?.summary())
	}

	pub async fn get_state(&self, run_id: Uuid) -> Result<RunState> {
		self.load_state(run_id).await
	}

	pub async fn get_pending_checkpoint(&self, run_id: Uuid) -> Result<Option<Checkpoint>> {
		Ok(self.load_state(run_id).await?.checkpoint())
	}

	pub async fn resolve_checkpoint(
		&self,
		run_id: Uuid,
		decision: CheckpointDecision,
		params: CheckpointParams,
	) -> Result<RunSummary> {
		self.exclusive(run_id, |cancel| async move {
			let mut state = self.load_state(run_id).await?;

			if state.status != RunStatus::AwaitingApproval {
				return Err(Error::Conflict {
					message: format!("Run {run_id} has no pending checkpoint."),
				});
			}

			let reviewer = params.reviewer.clone().unwrap_or_else(|| REVIEWER.to_string());

			// Decisions are applied to a copy so a rejected request leaves the run untouched.
			let mut next = state.clone();

			match decision {
				CheckpointDecision::Approve => {
					apply_adjudications(&mut next, &params.adjudications, &reviewer)?;
					next.audit(
						AuditEntry::new(REVIEWER, "checkpoint_approved")
							.phase(next.phase)
							.rationale(params.note.clone().unwrap_or_default())
							.metrics(json!({
								"reviewer": reviewer,
								"adjudications": params.adjudications.len(),
							})),
					);
					approve(&mut next);
				},
				CheckpointDecision::Modify => {
					if !params.adjudications.is_empty() {
						return Err(Error::InvalidRequest {
							message: "Adjudications are only accepted with approve.".to_string(),
						});
					}

					let overrides = params.overrides.clone().unwrap_or_else(|| json!({}));

					next.settings = next.settings.with_overrides(&self.cfg, &overrides)?;
					RunContext::new(
						&self.cfg,
						run_id,
						next.settings.clone(),
						next.created_at,
						CancelToken::default(),
					)?;

					let phase = next.phase;

					next.rewind_to(phase);
					next.audit(
						AuditEntry::new(REVIEWER, "phase_reentered")
							.phase(phase)
							.rationale(params.note.clone().unwrap_or_default())
							.metrics(json!({ "reviewer": reviewer, "overrides": overrides })),
					);
					next.set_status(RunStatus::Running);

					tracing::info!(
						run_id = %run_id,
						phase = %phase,
						"Phase re-entered with adjusted settings."
					);
				},
				CheckpointDecision::Reject => {
					next.audit(
						AuditEntry::new(REVIEWER, "run_rejected")
							.phase(next.phase)
							.rationale(params.note.clone().unwrap_or_default())
							.metrics(json!({ "reviewer": reviewer })),
					);
					next.set_status(RunStatus::Cancelled);

					tracing::info!(run_id = %run_id, phase = %next.phase, "Run rejected at checkpoint.");
				},
			}

			state = next;

			self.store.save(&state).await?;

			if state.status == RunStatus::Running {
				self.drive(&mut state, cancel).await?;
			}

			Ok(state.summary())
		})
		.await
	}

	/// Restarts a failed run, or a running run whose executor died, at the phase it stopped in.
	pub async fn resume(&self, run_id: Uuid) -> Result<RunSummary> {
		self.exclusive(run_id, |cancel| async move {
			let mut state = self.load_state(run_id).await?;

			if !matches!(state.status, RunStatus::Failed | RunStatus::Running) {
				return Err(Error::Conflict {
					message: format!("Run {run_id} is {} and cannot resume.", state.status.as_str()),
				});
			}

			let phase = state.phase;
			let cause = state.failure.take();

			state.rewind_to(phase);
			state.audit(
				AuditEntry::new(ACTOR, "run_resumed")
					.phase(phase)
					.rationale(cause.as_ref().map(|failure| failure.message.clone()).unwrap_or_default())
					.metrics(json!({
						"previous_error_code": cause.as_ref().map(|failure| failure.error_code.clone()),
					})),
			);
			state.set_status(RunStatus::Running);
			self.store.save(&state).await?;

			tracing::info!(run_id = %run_id, phase = %phase, "Run resumed.");

			self.drive(&mut state, cancel).await?;

			Ok(state.summary())
		})
		.await
	}

	/// Signals an executing run, or cancels an idle one directly.
	pub async fn cancel(&self, run_id: Uuid) -> Result<RunSummary> {
		if let Some(token) = self.active_token(run_id) {
			token.cancel();

			tracing::info!(run_id = %run_id, "Cancellation signalled to executing run.");

			return self.get_run(run_id).await;
		}

		let mut state = self.load_state(run_id).await?;

		if state.status.is_terminal() {
			return Err(Error::Conflict {
				message: format!("Run {run_id} is already {}.", state.status.as_str()),
			});
		}

		mark_cancelled(&mut state);
		self.store.save(&state).await?;

		Ok(state.summary())
	}

	pub async fn export(&self, run_id: Uuid) -> Result<ReviewExport> {
		Ok(ReviewExport::from_state(&self.load_state(run_id).await?))
	}

	async fn load_state(&self, run_id: Uuid) -> Result<RunState> {
		self.store
			.load(run_id)
			.await?
			.ok_or_else(|| Error::NotFound { message: format!("Run {run_id} does not exist.") })
	}

	async fn exclusive<'a, F, Fut>(&'a self, run_id: Uuid, body: F) -> Result<RunSummary>
	where
		F: FnOnce(CancelToken) -> Fut,
		Fut: Future<Output = Result<RunSummary>> + 'a,
	{
		let cancel = self.register_active(run_id)?;
		let _active = ActiveRun { service: self, run_id };

		body(cancel).await
	}

	/// Runs phases until a checkpoint needs a human, the run ends, or a phase stops early. Every
	/// boundary is persisted before the next phase starts.
	async fn drive(&self, state: &mut RunState, cancel: CancelToken) -> Result<()> {
		loop {
			if cancel.is_cancelled() {
				mark_cancelled(state);
				self.store.save(state).await?;

				return Ok(());
			}

			let ctx = Arc::new(RunContext::new(
				&self.cfg,
				state.run_id,
				state.settings.clone(),
				state.created_at,
				cancel.clone(),
			)?);
			let phase = state.phase;
			let mut draft = state.clone();

			draft.audit(AuditEntry::new(ACTOR, "phase_started").phase(phase));

			tracing::info!(run_id = %state.run_id, phase = %phase, "Phase started.");

			match execute(phase, &ctx, &self.providers, &mut draft).await {
				Ok(()) => {
					*state = draft;

					let counts = PrismaCounts::from_state(state);

					state.audit(
						AuditEntry::new(ACTOR, "phase_completed")
							.phase(phase)
							.output(format!(
								"{} candidates, {} included.",
								state.candidates.len(),
								counts.included
							))
							.metrics(serde_json::to_value(&counts)?),
					);
					state.set_status(RunStatus::AwaitingApproval);
					self.store.save(state).await?;

					tracing::info!(run_id = %state.run_id, phase = %phase, "Phase completed.");

					if !ctx.settings.is_automatic() {
						return Ok(());
					}

					state.audit(AuditEntry::new(ACTOR, "checkpoint_approved").phase(phase).rationale(
						"Automatic checkpoint mode.",
					));
					approve(state);
					self.store.save(state).await?;

					if state.status == RunStatus::Done {
						return Ok(());
					}
				},
				Err(PhaseError::Cancelled) => {
					*state = draft;

					mark_cancelled(state);
					self.store.save(state).await?;

					return Ok(());
				},
				Err(PhaseError::Failed { error_code, message }) => {
					// Outputs roll back to the boundary; the failed phase's audit trail stays.
					state.log = draft.log;

					tracing::warn!(
						run_id = %state.run_id,
						phase = %phase,
						error_code,
						error = %message,
						"Phase failed."
					);

					state.failure = Some(FailureRecord {
						phase,
						error_code: error_code.to_string(),
						message: message.clone(),
						failed_at: OffsetDateTime::now_utc(),
					});
					state.audit(
						AuditEntry::new(ACTOR, "phase_failed")
							.phase(phase)
							.rationale(message)
							.metrics(json!({ "error_code": error_code })),
					);
					state.set_status(RunStatus::Failed);
					self.store.save(state).await?;

					return Ok(());
				},
			}
		}
	}
}

/// Frees the run's execution slot on drop, including when the caller abandons the future.
struct ActiveRun<'a> {
	service: &'a SieveService,
	run_id: Uuid,
}
impl Drop for ActiveRun<'_> {
	fn drop(&mut self) {
		self.service.release_active(self.run_id);
	}
}

async fn execute(
	phase: Phase,
	ctx: &Arc<RunContext>,
	providers: &Providers,
	state: &mut RunState,
) -> Result<(), PhaseError> {
	match phase {
		Phase::Planning => planner::run(ctx, providers, state).await,
		Phase::Searching => retrieval::run(ctx, providers, state).await,
		Phase::FilteringScoring => {
			screening::run(ctx, state)?;
			relevance::run(ctx, providers, state).await
		},
		Phase::QualityAssessment => quality::run(ctx, providers, state).await,
		Phase::Synthesis => synthesis::run(ctx, providers, state).await,
	}
}

/// Moves past the current checkpoint. Approving synthesis finishes the run.
fn approve(state: &mut RunState) {
	match state.phase.next() {
		Some(next) => {
			state.phase = next;
			state.set_status(RunStatus::Running);
		},
		None => {
			state.audit(
				AuditEntry::new(ACTOR, "run_completed")
					.phase(state.phase)
					.output(format!(
						"{} studies included.",
						state.candidates.iter().filter(|candidate| candidate.is_included()).count()
					)),
			);
			state.set_status(RunStatus::Done);

			tracing::info!(run_id = %state.run_id, "Review run completed.");
		},
	}
}

fn apply_adjudications(state: &mut RunState, adjudications: &[Adjudicate], reviewer: &str) -> Result<()> {
	if adjudications.is_empty() {
		return Ok(());
	}
	if state.phase != Phase::QualityAssessment {
		return Err(Error::InvalidRequest {
			message: "Adjudications are only accepted at the QUALITY_ASSESSMENT checkpoint.".to_string(),
		});
	}

	let now = OffsetDateTime::now_utc();
	let phase = state.phase;

	for item in adjudications {
		let candidate = state.candidate_mut(&item.paper_id).ok_or_else(|| Error::NotFound {
			message: format!("Candidate {} is not part of this run.", item.paper_id),
		})?;

		if !candidate.is_adjudicable() {
			let stage = candidate.exclusion_stage().map(ExclusionStage::as_str).unwrap_or_default();

			return Err(Error::InvalidRequest {
				message: format!(
					"Candidate {} was excluded at the {stage} stage and cannot be adjudicated.",
					item.paper_id
				),
			});
		}

		candidate.adjudicate(Adjudication {
			decision: item.decision,
			note: item.note.clone(),
			reviewer: reviewer.to_string(),
			adjudicated_at: now,
		})?;

		let previous = candidate.composite.as_ref().map(|composite| composite.decision);

		state.audit(
			AuditEntry::new(REVIEWER, "adjudicated")
				.phase(phase)
				.subject(item.paper_id.clone())
				.output(match item.decision {
					AdjudicationDecision::Include => "include",
					AdjudicationDecision::Exclude => "exclude",
				})
				.rationale(item.note.clone())
				.metrics(json!({ "reviewer": reviewer, "gate_decision": previous })),
		);
	}

	Ok(())
}

fn mark_cancelled(state: &mut RunState) {
	state.audit(AuditEntry::new(ACTOR, "run_cancelled").phase(state.phase));
	state.set_status(RunStatus::Cancelled);

	tracing::info!(run_id = %state.run_id, phase = %state.phase, "Run cancelled.");
}
