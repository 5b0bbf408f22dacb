pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	SerdeJson(#[from] serde_json::Error),
	#[error(transparent)]
	InvalidHeaderName(#[from] reqwest::header::InvalidHeaderName),
	#[error(transparent)]
	InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
	#[error("{message}")]
	InvalidConfig { message: String },
	#[error("{message}")]
	InvalidResponse { message: String },
}
impl Error {
	/// Whether retrying the same request may succeed: timeouts, connection failures, rate limits,
	/// and server errors.
	pub fn is_transient(&self) -> bool {
		match self {
			Error::Reqwest(err) => {
				if err.is_timeout() || err.is_connect() {
					return true;
				}

				err.status().is_some_and(|status| {
					status.as_u16() == 429 || status.is_server_error()
				})
			},
			_ => false,
		}
	}

	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Reqwest(err) if err.is_timeout())
	}

	/// Whether the backend answered but the payload could not be used.
	pub fn is_malformed(&self) -> bool {
		matches!(self, Error::SerdeJson(_) | Error::InvalidResponse { .. })
	}
}
