//! Scratch Postgres databases for the review-store tests. Each test creates its own database
//! from `SIEVE_PG_DSN` and drops it when done, so runs and audit rows never leak between tests.

mod error;

pub use error::{Error, Result};

use std::{env, str::FromStr, thread};

use sqlx::{
	ConnectOptions, Connection, Executor,
	postgres::{PgConnectOptions, PgConnection},
};
use tokio::runtime::Builder;
use uuid::Uuid;

pub const DSN_ENV: &str = "SIEVE_PG_DSN";

const ADMIN_DATABASE: &str = "postgres";
const NAME_PREFIX: &str = "sieve_review_";

/// Base DSN for Postgres-backed tests, if one is configured.
pub fn env_dsn() -> Option<String> {
	env::var(DSN_ENV).ok().filter(|dsn| !dsn.trim().is_empty())
}

pub struct ScratchDatabase {
	name: String,
	dsn: String,
	admin: PgConnectOptions,
	dropped: bool,
}
impl ScratchDatabase {
	pub async fn create(base_dsn: &str) -> Result<Self> {
		let base = PgConnectOptions::from_str(base_dsn).map_err(Error::InvalidDsn)?;
		let admin = base.clone().database(ADMIN_DATABASE);
		let name = scratch_name();
		let mut conn = PgConnection::connect_with(&admin).await.map_err(Error::AdminUnavailable)?;

		conn.execute(format!(r#"CREATE DATABASE "{name}""#).as_str()).await.map_err(|source| {
			Error::Statement { action: "create", name: name.clone(), source }
		})?;

		let dsn = base.database(&name).to_url_lossy().to_string();

		Ok(Self { name, dsn, admin, dropped: false })
	}

	pub fn dsn(&self) -> &str {
		&self.dsn
	}

	/// Connection settings for a review store backed by this database.
	pub fn postgres(&self, pool_max_conns: u32) -> sieve_config::Postgres {
		sieve_config::Postgres { dsn: self.dsn.clone(), pool_max_conns }
	}

	/// Drops the database. Close every pool on it first; open sessions are terminated.
	pub async fn drop_database(mut self) -> Result<()> {
		self.dropped = true;

		drop_scratch(&self.name, &self.admin).await
	}
}
impl Drop for ScratchDatabase {
	fn drop(&mut self) {
		if self.dropped {
			return;
		}

		let name = self.name.clone();
		let admin = self.admin.clone();
		// A failed test may drop this inside its runtime, so the cleanup gets a runtime of its own.
		let cleanup = thread::spawn(move || {
			let result = Builder::new_current_thread()
				.enable_all()
				.build()
				.map_err(|err| err.to_string())
				.and_then(|runtime| {
					runtime.block_on(drop_scratch(&name, &admin)).map_err(|err| err.to_string())
				});

			if let Err(err) = result {
				eprintln!("Scratch database {name} was not dropped: {err}.");
			}
		});

		let _ = cleanup.join();
	}
}

fn scratch_name() -> String {
	format!("{NAME_PREFIX}{}", Uuid::new_v4().simple())
}

async fn drop_scratch(name: &str, admin: &PgConnectOptions) -> Result<()> {
	let mut conn = PgConnection::connect_with(admin).await.map_err(Error::AdminUnavailable)?;

	conn.execute(format!(r#"DROP DATABASE IF EXISTS "{name}" WITH (FORCE)"#).as_str())
		.await
		.map_err(|source| Error::Statement { action: "drop", name: name.to_string(), source })?;

	Ok(())
}
