pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Configuration error: {message}")]
	Configuration { message: String },
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Conflict: {message}")]
	Conflict { message: String },
	#[error("Corpus unavailable: {message}")]
	CorpusUnavailable { message: String },
	#[error("Provider error: {message}")]
	Provider { message: String },
	#[error("Malformed result: {message}")]
	MalformedResult { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
	#[error("Run was cancelled.")]
	Cancelled,
}
impl Error {
	pub fn code(&self) -> &'static str {
		match self {
			Self::Configuration { .. } => "CONFIGURATION",
			Self::InvalidRequest { .. } => "INVALID_REQUEST",
			Self::NotFound { .. } => "NOT_FOUND",
			Self::Conflict { .. } => "CONFLICT",
			Self::CorpusUnavailable { .. } => "CORPUS_UNAVAILABLE",
			Self::Provider { .. } => "PROVIDER",
			Self::MalformedResult { .. } => "MALFORMED_RESULT",
			Self::Storage { .. } => "STORAGE",
			Self::Cancelled => "CANCELLED",
		}
	}
}
impl From<sieve_config::Error> for Error {
	fn from(err: sieve_config::Error) -> Self {
		Self::Configuration { message: err.to_string() }
	}
}
impl From<sieve_domain::Error> for Error {
	fn from(err: sieve_domain::Error) -> Self {
		match err {
			sieve_domain::Error::InvalidWeights { .. } | sieve_domain::Error::InvalidThreshold { .. } =>
				Self::Configuration { message: err.to_string() },
			sieve_domain::Error::InvalidPattern(inner) =>
				Self::Configuration { message: format!("screening pattern failed to compile: {inner}") },
			sieve_domain::Error::AnnotationConflict { .. } => Self::Conflict { message: err.to_string() },
			sieve_domain::Error::InvalidQuestion { .. }
			| sieve_domain::Error::EmptyRationale { .. }
			| sieve_domain::Error::UnknownCitation { .. } =>
				Self::InvalidRequest { message: err.to_string() },
		}
	}
}
impl From<sieve_storage::Error> for Error {
	fn from(err: sieve_storage::Error) -> Self {
		match err {
			sieve_storage::Error::Sqlx(inner) => Self::Storage { message: inner.to_string() },
			sieve_storage::Error::SerdeJson(inner) => Self::Storage { message: inner.to_string() },
			sieve_storage::Error::InvalidArgument(message) => Self::InvalidRequest { message },
			sieve_storage::Error::NotFound(message) => Self::NotFound { message },
			sieve_storage::Error::Qdrant(inner) => Self::CorpusUnavailable { message: inner.to_string() },
		}
	}
}
impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}
impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}

/// Failure of one call into the corpus, LLM, or embedding backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
	#[error("Transient collaborator failure: {message}")]
	Transient { message: String },
	#[error("Collaborator call timed out after {timeout_ms} ms.")]
	Timeout { timeout_ms: u64 },
	#[error("Malformed collaborator result: {message}")]
	Malformed { message: String },
	#[error("Collaborator unavailable: {message}")]
	Unavailable { message: String },
}
impl CollaboratorError {
	pub fn transient(message: impl Into<String>) -> Self {
		Self::Transient { message: message.into() }
	}

	pub fn malformed(message: impl Into<String>) -> Self {
		Self::Malformed { message: message.into() }
	}

	pub fn unavailable(message: impl Into<String>) -> Self {
		Self::Unavailable { message: message.into() }
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Self::Transient { .. } => "transient",
			Self::Timeout { .. } => "timeout",
			Self::Malformed { .. } => "malformed",
			Self::Unavailable { .. } => "unavailable",
		}
	}

	/// Malformed output is retried too: a second sample often parses.
	pub fn is_retryable(&self) -> bool {
		!matches!(self, Self::Unavailable { .. })
	}

	/// Classifies a provider error. `timeout_ms` is the client timeout the call ran under.
	pub fn from_provider(err: sieve_providers::Error, timeout_ms: u64) -> Self {
		if err.is_timeout() {
			return Self::Timeout { timeout_ms };
		}
		if err.is_transient() {
			return Self::Transient { message: err.to_string() };
		}
		if err.is_malformed() {
			return Self::Malformed { message: err.to_string() };
		}

		Self::Unavailable { message: err.to_string() }
	}
}
impl From<sieve_storage::Error> for CollaboratorError {
	fn from(err: sieve_storage::Error) -> Self {
		match err {
			sieve_storage::Error::Qdrant(inner) => Self::Transient { message: inner.to_string() },
			sieve_storage::Error::InvalidArgument(message) => Self::Malformed { message },
			other => Self::Unavailable { message: other.to_string() },
		}
	}
}

/// Why a phase stopped before completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PhaseError {
	Failed { error_code: &'static str, message: String },
	Cancelled,
}
impl PhaseError {
	pub(crate) fn corpus_unavailable(message: impl Into<String>) -> Self {
		Self::Failed { error_code: "CORPUS_UNAVAILABLE", message: message.into() }
	}

	pub(crate) fn invariant(message: impl Into<String>) -> Self {
		Self::Failed { error_code: "CONFLICT", message: message.into() }
	}
}
impl From<sieve_domain::Error> for PhaseError {
	fn from(err: sieve_domain::Error) -> Self {
		let err = Error::from(err);

		Self::Failed { error_code: err.code(), message: err.to_string() }
	}
}
