//! Review run snapshots and the append-only audit log.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
	Error, Result,
	models::{AuditRecordRow, ReviewRunRow},
};
use sieve_domain::{audit::AuditRecord, phase::Phase};

/// Inserts or replaces the snapshot of one run.
pub async fn upsert_run(conn: &mut PgConnection, row: &ReviewRunRow) -> Result<()> {
	sqlx::query(
		"\
INSERT INTO review_runs (
	run_id,
	status,
	phase,
	question,
	state,
	failure,
	created_at,
	updated_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (run_id) DO UPDATE
SET
	status = EXCLUDED.status,
	phase = EXCLUDED.phase,
	state = EXCLUDED.state,
	failure = EXCLUDED.failure,
	updated_at = EXCLUDED.updated_at",
	)
	.bind(row.run_id)
	.bind(row.status.as_str())
	.bind(row.phase.as_str())
	.bind(row.question.as_str())
	.bind(&row.state)
	.bind(row.failure.as_deref())
	.bind(row.created_at)
	.bind(row.updated_at)
	.execute(conn)
	.await?;

	Ok(())
}

pub async fn get_run(pool: &PgPool, run_id: Uuid) -> Result<Option<ReviewRunRow>> {
	let row = sqlx::query_as::<_, ReviewRunRow>(
		"\
SELECT run_id, status, phase, question, state, failure, created_at, updated_at
FROM review_runs
WHERE run_id = $1",
	)
	.bind(run_id)
	.fetch_optional(pool)
	.await?;

	Ok(row)
}

pub async fn list_run_ids(pool: &PgPool) -> Result<Vec<Uuid>> {
	let ids = sqlx::query_scalar::<_, Uuid>(
		"\
SELECT run_id
FROM review_runs
ORDER BY created_at ASC, run_id ASC",
	)
	.fetch_all(pool)
	.await?;

	Ok(ids)
}

/// Appends audit records. A record already stored under the same `(run_id, seq)` is left
/// untouched, so re-saving a snapshot never rewrites history.
pub async fn append_audit_records(conn: &mut PgConnection, records: &[AuditRecord]) -> Result<()> {
	for record in records {
		let seq = i64::try_from(record.seq)
			.map_err(|_| Error::InvalidArgument(format!("audit seq {} is out of range.", record.seq)))?;

		sqlx::query(
			"\
INSERT INTO audit_records (
	record_id,
	run_id,
	seq,
	actor,
	action,
	phase,
	subject,
	input_summary,
	output_summary,
	rationale,
	metrics,
	ts
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
ON CONFLICT (run_id, seq) DO NOTHING",
		)
		.bind(record.record_id)
		.bind(record.run_id)
		.bind(seq)
		.bind(record.actor.as_str())
		.bind(record.action.as_str())
		.bind(record.phase.map(Phase::as_str))
		.bind(record.subject.as_deref())
		.bind(record.input_summary.as_str())
		.bind(record.output_summary.as_str())
		.bind(record.rationale.as_str())
		.bind(&record.metrics)
		.bind(record.ts)
		.execute(&mut *conn)
		.await?;
	}

	Ok(())
}

pub async fn list_audit_records(pool: &PgPool, run_id: Uuid) -> Result<Vec<AuditRecord>> {
	let rows = sqlx::query_as::<_, AuditRecordRow>(
		"\
SELECT
	record_id,
	run_id,
	seq,
	actor,
	action,
	phase,
	subject,
	input_summary,
	output_summary,
	rationale,
	metrics,
	ts
FROM audit_records
WHERE run_id = $1
ORDER BY seq ASC",
	)
	.bind(run_id)
	.fetch_all(pool)
	.await?;

	rows.into_iter().map(audit_record_from_row).collect()
}

fn audit_record_from_row(row: AuditRecordRow) -> Result<AuditRecord> {
	let phase = match row.phase {
		Some(raw) => Some(serde_json::from_value::<Phase>(serde_json::Value::String(raw))?),
		None => None,
	};
	let seq = u64::try_from(row.seq)
		.map_err(|_| Error::InvalidArgument(format!("audit seq {} is negative.", row.seq)))?;

	Ok(AuditRecord {
		record_id: row.record_id,
		run_id: row.run_id,
		seq,
		actor: row.actor,
		action: row.action,
		phase,
		subject: row.subject,
		input_summary: row.input_summary,
		output_summary: row.output_summary,
		rationale: row.rationale,
		metrics: row.metrics,
		ts: row.ts,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stored_phase_text_round_trips_to_the_enum() {
		let row = AuditRecordRow {
			record_id: Uuid::from_u128(1),
			run_id: Uuid::from_u128(2),
			seq: 3,
			actor: "controller".to_string(),
			action: "phase_started".to_string(),
			phase: Some(Phase::FilteringScoring.as_str().to_string()),
			subject: None,
			input_summary: String::new(),
			output_summary: String::new(),
			rationale: String::new(),
			metrics: serde_json::json!({}),
			ts: time::OffsetDateTime::UNIX_EPOCH,
		};
		let record = audit_record_from_row(row).expect("Failed to decode audit row.");

		assert_eq!(record.phase, Some(Phase::FilteringScoring));
		assert_eq!(record.seq, 3);
	}
}
