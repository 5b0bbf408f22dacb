//! Structured completion over an OpenAI-compatible chat endpoint.
//!
//! The caller supplies a prompt and the JSON schema the answer must follow. The schema is placed
//! in the system message; the reply content is parsed as a JSON object. Retries belong to the
//! caller.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
	/// Task instructions.
	pub system: &'a str,
	/// Task input, usually a JSON document.
	pub user: &'a str,
	pub schema: &'a Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
	pub value: Value,
	/// Model identity reported by the backend, or the configured model.
	pub model: String,
}

pub fn build_messages(request: &CompletionRequest<'_>) -> Result<Vec<Value>> {
	let schema = serde_json::to_string(request.schema)?;
	let system = format!(
		"{}\nReturn only one JSON object that matches this JSON schema. No prose, no code fences.\nSchema: {schema}",
		request.system.trim_end()
	);

	Ok(vec![
		serde_json::json!({ "role": "system", "content": system }),
		serde_json::json!({ "role": "user", "content": request.user }),
	])
}

pub async fn complete(
	cfg: &sieve_config::LlmProviderConfig,
	request: &CompletionRequest<'_>,
) -> Result<Completion> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = format!("{}{}", cfg.api_base, cfg.path);
	let body = serde_json::json!({
		"model": cfg.model,
		"temperature": cfg.temperature,
		"messages": build_messages(request)?,
		"response_format": { "type": "json_object" },
	});
	let res = client
		.post(&url)
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&body)
		.send()
		.await?;
	let json: Value = res.error_for_status()?.json().await?;
	let model = json.get("model").and_then(Value::as_str).unwrap_or(&cfg.model).to_string();
	let value = parse_completion_json(json)?;

	Ok(Completion { value, model })
}

fn parse_completion_json(json: Value) -> Result<Value> {
	if let Some(content) = json
		.get("choices")
		.and_then(|v| v.as_array())
		.and_then(|arr| arr.first())
		.and_then(|choice| choice.get("message"))
		.and_then(|msg| msg.get("content"))
		.and_then(|c| c.as_str())
	{
		let parsed: Value = serde_json::from_str(strip_code_fence(content)).map_err(|_| {
			Error::InvalidResponse { message: "Completion content is not valid JSON.".to_string() }
		})?;

		if !parsed.is_object() {
			return Err(Error::InvalidResponse {
				message: "Completion content must be a JSON object.".to_string(),
			});
		}

		return Ok(parsed);
	}

	Err(Error::InvalidResponse { message: "Completion response is missing message content.".to_string() })
}

fn strip_code_fence(content: &str) -> &str {
	let trimmed = content.trim();
	let Some(rest) = trimmed.strip_prefix("```") else {
		return trimmed;
	};
	let rest = rest.strip_prefix("json").unwrap_or(rest);

	rest.strip_suffix("```").unwrap_or(rest).trim()
}
