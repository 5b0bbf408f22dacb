use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReviewRunRow {
	pub run_id: Uuid,
	pub status: String,
	pub phase: String,
	pub question: String,
	/// Serialized run state.
	pub state: Value,
	pub failure: Option<String>,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRecordRow {
	pub record_id: Uuid,
	pub run_id: Uuid,
	pub seq: i64,
	pub actor: String,
	pub action: String,
	pub phase: Option<String>,
	pub subject: Option<String>,
	pub input_summary: String,
	pub output_summary: String,
	pub rationale: String,
	pub metrics: Value,
	pub ts: OffsetDateTime,
}
