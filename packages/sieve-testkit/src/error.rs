pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("SIEVE_PG_DSN is not a usable Postgres DSN: {0}")]
	InvalidDsn(#[source] sqlx::Error),
	#[error("Failed to reach the Postgres admin database: {0}")]
	AdminUnavailable(#[source] sqlx::Error),
	#[error("Failed to {action} scratch database {name}: {source}")]
	Statement {
		action: &'static str,
		name: String,
		#[source]
		source: sqlx::Error,
	},
}
