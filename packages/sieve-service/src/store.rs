//! Durable run state. The controller saves at every phase boundary and on every failure, so a
//! run can be resumed from its last completed phase after a restart.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use uuid::Uuid;

use crate::{BoxFuture, Error, Result, state::RunState};
use sieve_storage::{db::Db, models::ReviewRunRow, runs};

pub trait RunStore
where
	Self: Send + Sync,
{
	fn save<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<()>>;

	fn load<'a>(&'a self, run_id: Uuid) -> BoxFuture<'a, Result<Option<RunState>>>;

	fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<Uuid>>>;
}

/// In-process store. States are kept as JSON so loads see exactly what a durable store would.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunStore {
	runs: Arc<Mutex<HashMap<Uuid, serde_json::Value>>>,
}
impl MemoryRunStore {
	pub fn new() -> Self {
		Self::default()
	}
}
impl RunStore for MemoryRunStore {
	fn save<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let value = serde_json::to_value(state)?;
			let mut runs = self.runs.lock().map_err(|_| poisoned())?;

			runs.insert(state.run_id, value);

			Ok(())
		})
	}

	fn load<'a>(&'a self, run_id: Uuid) -> BoxFuture<'a, Result<Option<RunState>>> {
		Box::pin(async move {
			let value = self.runs.lock().map_err(|_| poisoned())?.get(&run_id).cloned();

			match value {
				Some(value) => Ok(Some(serde_json::from_value(value)?)),
				None => Ok(None),
			}
		})
	}

	fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<Uuid>>> {
		Box::pin(async move {
			let mut ids: Vec<Uuid> = self.runs.lock().map_err(|_| poisoned())?.keys().copied().collect();

			ids.sort();

			Ok(ids)
		})
	}
}

/// Postgres-backed store: one `review_runs` row per run plus the append-only `audit_records`.
pub struct PgRunStore {
	db: Db,
	persisted_seq: Mutex<HashMap<Uuid, u64>>,
}
impl PgRunStore {
	pub fn new(db: Db) -> Self {
		Self { db, persisted_seq: Mutex::new(HashMap::new()) }
	}

	pub fn db(&self) -> &Db {
		&self.db
	}

	async fn save_state(&self, state: &RunState) -> Result<()> {
		let row = ReviewRunRow {
			run_id: state.run_id,
			status: state.status.as_str().to_string(),
			phase: state.phase.as_str().to_string(),
			question: state.question.text.clone(),
			state: serde_json::to_value(state)?,
			failure: state.failure.as_ref().map(|failure| failure.message.clone()),
			created_at: state.created_at,
			updated_at: state.updated_at,
		};
		let from_seq = self
			.persisted_seq
			.lock()
			.map_err(|_| poisoned())?
			.get(&state.run_id)
			.map_or(1, |seq| seq + 1);
		let pending = state.log.since(from_seq);
		let mut tx = self.db.pool.begin().await?;

		runs::upsert_run(&mut *tx, &row).await?;
		runs::append_audit_records(&mut *tx, pending).await?;

		tx.commit().await?;

		if let Some(last) = pending.last() {
			self.persisted_seq.lock().map_err(|_| poisoned())?.insert(state.run_id, last.seq);
		}

		Ok(())
	}
}
impl RunStore for PgRunStore {
	fn save<'a>(&'a self, state: &'a RunState) -> BoxFuture<'a, Result<()>> {
		Box::pin(self.save_state(state))
	}

	fn load<'a>(&'a self, run_id: Uuid) -> BoxFuture<'a, Result<Option<RunState>>> {
		Box::pin(async move {
			let Some(row) = runs::get_run(&self.db.pool, run_id).await? else {
				return Ok(None);
			};
			let state: RunState = serde_json::from_value(row.state)?;

			Ok(Some(state))
		})
	}

	fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<Uuid>>> {
		Box::pin(async move { Ok(runs::list_run_ids(&self.db.pool).await?) })
	}
}

fn poisoned() -> Error {
	Error::Storage { message: "Run store lock is poisoned.".to_string() }
}
