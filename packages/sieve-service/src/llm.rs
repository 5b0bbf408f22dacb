use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{CollaboratorError, Providers, RunContext};
use sieve_providers::llm::CompletionRequest;

pub(crate) struct Prompt<'a> {
	pub(crate) label: &'a str,
	pub(crate) system: &'a str,
	pub(crate) user: String,
	pub(crate) schema: &'a Value,
}
impl Prompt<'_> {
	/// Stable digest of everything the model sees, recorded in audit metrics.
	pub(crate) fn fingerprint(&self) -> String {
		let mut hasher = blake3::Hasher::new();

		hasher.update(self.system.as_bytes());
		hasher.update(b"\n");
		hasher.update(self.user.as_bytes());
		hasher.update(b"\n");
		hasher.update(self.schema.to_string().as_bytes());

		hasher.finalize().to_hex().to_string()
	}
}

pub(crate) struct Structured<T> {
	pub(crate) value: T,
	pub(crate) model: String,
}

/// Calls the LLM under the run's retry policy and decodes the reply into `T`. A reply that does
/// not decode counts as malformed and is retried like any other retryable failure.
pub(crate) async fn call_structured<T>(
	ctx: &RunContext,
	providers: &Providers,
	prompt: &Prompt<'_>,
) -> Result<Structured<T>, CollaboratorError>
where
	T: DeserializeOwned,
{
	ctx.policy
		.run(prompt.label, || async {
			let request =
				CompletionRequest { system: prompt.system, user: &prompt.user, schema: prompt.schema };
			let completion = providers.llm.complete(&ctx.llm, request).await?;
			let value = serde_json::from_value(completion.value).map_err(|err| {
				CollaboratorError::malformed(format!("{} reply does not fit its schema: {err}", prompt.label))
			})?;

			Ok(Structured { value, model: completion.model })
		})
		.await
}
