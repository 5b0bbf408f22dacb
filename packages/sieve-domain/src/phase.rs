use serde::{Deserialize, Serialize};

/// Review phases in execution order. Each phase ends at a checkpoint boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
	Planning,
	Searching,
	FilteringScoring,
	QualityAssessment,
	Synthesis,
}
impl Phase {
	pub const ALL: [Phase; 5] = [
		Phase::Planning,
		Phase::Searching,
		Phase::FilteringScoring,
		Phase::QualityAssessment,
		Phase::Synthesis,
	];

	pub fn next(self) -> Option<Phase> {
		match self {
			Phase::Planning => Some(Phase::Searching),
			Phase::Searching => Some(Phase::FilteringScoring),
			Phase::FilteringScoring => Some(Phase::QualityAssessment),
			Phase::QualityAssessment => Some(Phase::Synthesis),
			Phase::Synthesis => None,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Phase::Planning => "PLANNING",
			Phase::Searching => "SEARCHING",
			Phase::FilteringScoring => "FILTERING_SCORING",
			Phase::QualityAssessment => "QUALITY_ASSESSMENT",
			Phase::Synthesis => "SYNTHESIS",
		}
	}
}
impl std::fmt::Display for Phase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
	/// A phase is executing or about to execute.
	Running,
	/// The phase finished and its checkpoint waits for a decision.
	AwaitingApproval,
	Done,
	Cancelled,
	Failed,
}
impl RunStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, RunStatus::Done | RunStatus::Cancelled)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			RunStatus::Running => "RUNNING",
			RunStatus::AwaitingApproval => "AWAITING_APPROVAL",
			RunStatus::Done => "DONE",
			RunStatus::Cancelled => "CANCELLED",
			RunStatus::Failed => "FAILED",
		}
	}
}
