//! Persisted state of one review run.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
	Documenter, PrismaCounts, ReviewSettings, retrieval::RetrievalStats, synthesis::SynthesisOutput,
};
use sieve_domain::{
	audit::AuditEntry,
	candidate::{Candidate, ExclusionStage},
	composite::GateDecision,
	phase::{Phase, RunStatus},
	plan::SearchPlan,
	question::ResearchQuestion,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
	pub phase: Phase,
	pub error_code: String,
	pub message: String,
	#[serde(with = "sieve_domain::timestamp")]
	pub failed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
	pub run_id: Uuid,
	pub question: ResearchQuestion,
	pub settings: ReviewSettings,
	/// Phase currently executing, awaiting approval, or failed.
	pub phase: Phase,
	pub status: RunStatus,
	pub pending_approval: bool,
	pub model: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub plan: Option<SearchPlan>,
	/// Deduplicated candidates, in retrieval pool order.
	#[serde(default)]
	pub candidates: Vec<Candidate>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retrieval: Option<RetrievalStats>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub synthesis: Option<SynthesisOutput>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub failure: Option<FailureRecord>,
	pub log: Documenter,
	#[serde(with = "sieve_domain::timestamp")]
	pub created_at: OffsetDateTime,
	#[serde(with = "sieve_domain::timestamp")]
	pub updated_at: OffsetDateTime,
}
impl RunState {
	pub fn new(
		run_id: Uuid,
		question: ResearchQuestion,
		settings: ReviewSettings,
		model: impl Into<String>,
		now: OffsetDateTime,
	) -> Self {
		Self {
			run_id,
			question,
			settings,
			phase: Phase::Planning,
			status: RunStatus::Running,
			pending_approval: false,
			model: model.into(),
			plan: None,
			candidates: Vec::new(),
			retrieval: None,
			synthesis: None,
			failure: None,
			log: Documenter::default(),
			created_at: now,
			updated_at: now,
		}
	}

	pub fn audit(&mut self, entry: AuditEntry) {
		self.log.record(self.run_id, entry);
	}

	pub fn set_status(&mut self, status: RunStatus) {
		self.status = status;
		self.pending_approval = status == RunStatus::AwaitingApproval;
		self.updated_at = OffsetDateTime::now_utc();
	}

	pub fn candidate(&self, paper_id: &str) -> Option<&Candidate> {
		self.candidates.iter().find(|candidate| candidate.paper_id == paper_id)
	}

	pub fn candidate_mut(&mut self, paper_id: &str) -> Option<&mut Candidate> {
		self.candidates.iter_mut().find(|candidate| candidate.paper_id == paper_id)
	}

	/// Candidates still in the review after every exclusion so far.
	pub fn active_candidates(&self) -> impl Iterator<Item = &Candidate> {
		self.candidates.iter().filter(|candidate| !candidate.is_excluded())
	}

	/// Drops every output produced by `phase` and the phases after it.
	pub fn rewind_to(&mut self, phase: Phase) {
		if phase <= Phase::Planning {
			self.plan = None;
		}
		if phase <= Phase::Searching {
			self.candidates.clear();
			self.retrieval = None;
		} else {
			for candidate in &mut self.candidates {
				candidate.rewind(phase);
			}
		}

		self.synthesis = None;
		self.phase = phase;
	}

	pub fn summary(&self) -> RunSummary {
		RunSummary {
			run_id: self.run_id,
			status: self.status,
			phase: self.phase,
			pending_approval: self.pending_approval,
			question: self.question.text.clone(),
			counts: PrismaCounts::from_state(self),
			failure: self.failure.clone(),
			audit_records: self.log.len(),
			created_at: self.created_at,
			updated_at: self.updated_at,
		}
	}

	pub fn checkpoint(&self) -> Option<Checkpoint> {
		if self.status != RunStatus::AwaitingApproval {
			return None;
		}

		Some(Checkpoint { run_id: self.run_id, phase: self.phase, snapshot: CheckpointSnapshot::of(self) })
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
	pub run_id: Uuid,
	pub status: RunStatus,
	pub phase: Phase,
	pub pending_approval: bool,
	pub question: String,
	pub counts: PrismaCounts,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub failure: Option<FailureRecord>,
	pub audit_records: usize,
	#[serde(with = "sieve_domain::timestamp")]
	pub created_at: OffsetDateTime,
	#[serde(with = "sieve_domain::timestamp")]
	pub updated_at: OffsetDateTime,
}

/// A phase boundary waiting on a reviewer decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
	pub run_id: Uuid,
	/// The phase whose output is under review.
	pub phase: Phase,
	pub snapshot: CheckpointSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
	pub counts: PrismaCounts,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub plan: Option<SearchPlan>,
	pub candidates: Vec<CandidateSummary>,
	/// Papers the gate could not decide; adjudicate them before approving quality assessment.
	pub uncertain: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub report: Option<String>,
}
impl CheckpointSnapshot {
	pub fn of(state: &RunState) -> Self {
		Self {
			counts: PrismaCounts::from_state(state),
			plan: state.plan.clone(),
			candidates: state.candidates.iter().map(CandidateSummary::of).collect(),
			uncertain: state
				.candidates
				.iter()
				.filter(|candidate| candidate.is_uncertain())
				.map(|candidate| candidate.paper_id.clone())
				.collect(),
			report: state.synthesis.as_ref().map(|synthesis| synthesis.report.text.clone()),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSummary {
	pub paper_id: String,
	pub title: String,
	pub study_type: String,
	pub retrieval_score: f64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub relevance: Option<u8>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub composite: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub decision: Option<GateDecision>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub excluded_at: Option<ExclusionStage>,
	pub included: bool,
}
impl CandidateSummary {
	fn of(candidate: &Candidate) -> Self {
		Self {
			paper_id: candidate.paper_id.clone(),
			title: candidate.title.clone(),
			study_type: candidate.study_type.label().to_string(),
			retrieval_score: candidate.retrieval_score,
			relevance: candidate.relevance.as_ref().and_then(|outcome| outcome.score()),
			composite: candidate.composite.as_ref().map(|composite| composite.score),
			decision: candidate.composite.as_ref().map(|composite| composite.decision),
			excluded_at: candidate.exclusion_stage(),
			included: candidate.is_included(),
		}
	}
}
