//! Timeout and retry policy for collaborator calls.

use std::{future::Future, time::Duration};

use crate::CollaboratorError;
use sieve_config::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
	pub timeout: Duration,
	pub max_retries: u32,
	pub backoff_base: Duration,
	pub backoff_max: Duration,
}
impl CallPolicy {
	pub fn from_runtime(cfg: &Runtime) -> Self {
		Self {
			timeout: Duration::from_millis(cfg.call_timeout_ms),
			max_retries: cfg.max_retries,
			backoff_base: Duration::from_millis(cfg.backoff_base_ms),
			backoff_max: Duration::from_millis(cfg.backoff_max_ms),
		}
	}

	/// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped at `backoff_max`.
	pub fn backoff(&self, attempt: u32) -> Duration {
		let factor = 1_u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);

		self.backoff_base.saturating_mul(factor).min(self.backoff_max)
	}

	/// Runs `call` under the per-call timeout, retrying retryable failures. Every attempt gets a
	/// fresh future from `call`.
	pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, CollaboratorError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, CollaboratorError>>,
	{
		let mut attempt = 0;

		loop {
			let err = match tokio::time::timeout(self.timeout, call()).await {
				Ok(Ok(value)) => return Ok(value),
				Ok(Err(err)) => err,
				Err(_) => CollaboratorError::Timeout {
					timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
				},
			};

			if !err.is_retryable() || attempt >= self.max_retries {
				tracing::warn!(
					call = label,
					attempts = attempt + 1,
					kind = err.kind(),
					error = %err,
					"Collaborator call failed."
				);

				return Err(err);
			}

			let delay = self.backoff(attempt);

			tracing::debug!(
				call = label,
				attempt = attempt + 1,
				delay_ms = delay.as_millis() as u64,
				error = %err,
				"Retrying collaborator call."
			);
			tokio::time::sleep(delay).await;

			attempt += 1;
		}
	}
}
