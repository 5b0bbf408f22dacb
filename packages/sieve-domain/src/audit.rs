use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::phase::Phase;

/// One action taken by one component. Records are never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
	pub record_id: Uuid,
	pub run_id: Uuid,
	/// Position in the run's log, starting at 1.
	pub seq: u64,
	pub actor: String,
	pub action: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub phase: Option<Phase>,
	/// Paper, batch, or query the action concerns.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub subject: Option<String>,
	pub input_summary: String,
	pub output_summary: String,
	pub rationale: String,
	pub metrics: Value,
	#[serde(with = "crate::timestamp")]
	pub ts: OffsetDateTime,
}

/// An audit entry before the documenter assigns its id, sequence number, and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
	pub actor: String,
	pub action: String,
	pub phase: Option<Phase>,
	pub subject: Option<String>,
	pub input_summary: String,
	pub output_summary: String,
	pub rationale: String,
	pub metrics: Value,
}
impl AuditEntry {
	pub fn new(actor: impl Into<String>, action: impl Into<String>) -> Self {
		Self {
			actor: actor.into(),
			action: action.into(),
			phase: None,
			subject: None,
			input_summary: String::new(),
			output_summary: String::new(),
			rationale: String::new(),
			metrics: Value::Object(Default::default()),
		}
	}

	pub fn phase(mut self, phase: Phase) -> Self {
		self.phase = Some(phase);

		self
	}

	pub fn subject(mut self, subject: impl Into<String>) -> Self {
		self.subject = Some(subject.into());

		self
	}

	pub fn input(mut self, summary: impl Into<String>) -> Self {
		self.input_summary = summary.into();

		self
	}

	pub fn output(mut self, summary: impl Into<String>) -> Self {
		self.output_summary = summary.into();

		self
	}

	pub fn rationale(mut self, rationale: impl Into<String>) -> Self {
		self.rationale = rationale.into();

		self
	}

	pub fn metrics(mut self, metrics: Value) -> Self {
		self.metrics = metrics;

		self
	}

	pub fn into_record(self, run_id: Uuid, seq: u64, ts: OffsetDateTime) -> AuditRecord {
		AuditRecord {
			record_id: Uuid::new_v4(),
			run_id,
			seq,
			actor: self.actor,
			action: self.action,
			phase: self.phase,
			subject: self.subject,
			input_summary: self.input_summary,
			output_summary: self.output_summary,
			rationale: self.rationale,
			metrics: self.metrics,
			ts,
		}
	}
}
