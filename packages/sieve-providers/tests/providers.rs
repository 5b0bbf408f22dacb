use reqwest::header::{AUTHORIZATION, HeaderName};
use serde_json::{Map, Value};

#[test]
fn builds_bearer_auth_header() {
	let headers =
		sieve_providers::auth_headers("secret", &Map::new()).expect("Failed to build headers.");
	let value = headers.get(AUTHORIZATION).expect("Missing authorization header.");

	assert_eq!(value, "Bearer secret");
}

#[test]
fn default_headers_are_forwarded() {
	let mut defaults = Map::new();

	defaults.insert("x-review-tenant".to_string(), Value::String("lab-7".to_string()));

	let headers =
		sieve_providers::auth_headers("secret", &defaults).expect("Failed to build headers.");
	let value = headers
		.get(HeaderName::from_static("x-review-tenant"))
		.expect("Missing forwarded header.");

	assert_eq!(value, "lab-7");
}

#[test]
fn non_string_default_header_is_a_config_error() {
	let mut defaults = Map::new();

	defaults.insert("x-retries".to_string(), Value::from(3));

	let err = sieve_providers::auth_headers("secret", &defaults)
		.expect_err("Numeric header values must be rejected.");

	assert!(matches!(err, sieve_providers::Error::InvalidConfig { .. }));
}

#[tokio::test]
async fn unreachable_backend_is_transient() {
	let cfg = sieve_config::LlmProviderConfig {
		provider_id: "local".to_string(),
		api_base: "http://127.0.0.1:9".to_string(),
		api_key: "secret".to_string(),
		path: "/v1/chat/completions".to_string(),
		model: "test-model".to_string(),
		temperature: 0.0,
		timeout_ms: 500,
		default_headers: Map::new(),
	};
	let schema = serde_json::json!({ "type": "object" });
	let request =
		sieve_providers::llm::CompletionRequest { system: "Ping.", user: "{}", schema: &schema };
	let err = sieve_providers::llm::complete(&cfg, &request)
		.await
		.expect_err("Nothing listens on the discard port.");

	assert!(err.is_transient(), "Unexpected error: {err:?}");
}
