use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use sieve_domain::audit::{AuditEntry, AuditRecord};

/// Append-only audit log for one run. Sequence numbers start at 1 and never repeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Documenter {
	records: Vec<AuditRecord>,
}
impl Documenter {
	pub fn record(&mut self, run_id: Uuid, entry: AuditEntry) -> &AuditRecord {
		self.record_at(run_id, entry, OffsetDateTime::now_utc())
	}

	pub fn record_at(&mut self, run_id: Uuid, entry: AuditEntry, ts: OffsetDateTime) -> &AuditRecord {
		let seq = self.next_seq();

		tracing::debug!(
			run_id = %run_id,
			seq,
			actor = %entry.actor,
			action = %entry.action,
			"Audit record appended."
		);

		self.records.push(entry.into_record(run_id, seq, ts));

		&self.records[self.records.len() - 1]
	}

	pub fn records(&self) -> &[AuditRecord] {
		&self.records
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	/// Records at or after `seq`, for incremental persistence.
	pub fn since(&self, seq: u64) -> &[AuditRecord] {
		let start = self.records.partition_point(|record| record.seq < seq);

		&self.records[start..]
	}

	pub fn next_seq(&self) -> u64 {
		self.records.last().map_or(1, |record| record.seq + 1)
	}
}

#[cfg(test)]
mod tests {
	use uuid::Uuid;

	use super::Documenter;
	use sieve_domain::audit::AuditEntry;

	#[test]
	fn sequence_is_gapless_and_since_slices_the_tail() {
		let run_id = Uuid::from_u128(1);
		let mut log = Documenter::default();

		for action in ["a", "b", "c"] {
			log.record(run_id, AuditEntry::new("controller", action));
		}

		assert_eq!(log.records().iter().map(|record| record.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
		assert_eq!(log.since(2).len(), 2);
		assert_eq!(log.since(4).len(), 0);
		assert_eq!(log.next_seq(), 4);
	}
}
