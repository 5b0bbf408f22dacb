use std::sync::Arc;

use sieve_domain::phase::{Phase, RunStatus};
use sieve_service::{MemoryRunStore, PgRunStore, RunStore};
use sieve_storage::{db::Db, runs};
use sieve_testkit::ScratchDatabase;

use super::{ScriptedLlm, harness, harness_with_store, request, test_config, trials};

#[tokio::test]
async fn every_boundary_is_persisted_and_reloads_identically() {
	let store = Arc::new(MemoryRunStore::new());
	let h = harness_with_store(
		test_config("interactive"),
		ScriptedLlm::default(),
		trials("pmid:p", 2),
		store.clone(),
	);
	let summary = h.service.start_run(request(None)).await.expect("Run must start.");
	let stored = store
		.load(summary.run_id)
		.await
		.expect("Store must load.")
		.expect("Run must be persisted at its first checkpoint.");

	assert_eq!(stored.status, RunStatus::AwaitingApproval);
	assert_eq!(stored.phase, Phase::Planning);

	let live = h.service.get_state(summary.run_id).await.expect("State must load.");

	assert_eq!(stored.log.records(), live.log.records());
	assert_eq!(store.list().await.expect("Store must list."), vec![summary.run_id]);
}

#[tokio::test]
async fn report_markdown_carries_references_and_study_flow() {
	let h = harness(test_config("automatic"), ScriptedLlm::default(), trials("pmid:md", 2));
	let summary = h.service.start_run(request(None)).await.expect("Run must complete.");
	let export = h.service.export(summary.run_id).await.expect("Export must build.");
	let markdown = export.to_markdown();

	assert!(markdown.contains("## References"));
	assert!(markdown.contains("## Study flow"));
	assert!(markdown.contains("pmid:md01") || markdown.contains("Metformin and colorectal cancer"));

	let json = serde_json::to_value(&export).expect("Export must serialize.");

	assert_eq!(json["prisma"]["included"], 2);
	assert_eq!(json["report"]["references"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set SIEVE_PG_DSN to run."]
async fn postgres_store_persists_state_and_append_only_audit() {
	let Some(base_dsn) = sieve_testkit::env_dsn() else {
		eprintln!(
			"Skipping postgres_store_persists_state_and_append_only_audit; set SIEVE_PG_DSN to run this test."
		);

		return;
	};
	let scratch =
		ScratchDatabase::create(&base_dsn).await.expect("Failed to create scratch database.");
	let db = Db::connect(&scratch.postgres(2)).await.expect("Failed to connect to scratch database.");

	db.ensure_schema().await.expect("Failed to apply schema.");

	let pool = db.pool.clone();
	let store = Arc::new(PgRunStore::new(db));
	let h = harness_with_store(
		test_config("automatic"),
		ScriptedLlm::default(),
		trials("pmid:pg", 3),
		store.clone(),
	);
	let summary = h.service.start_run(request(None)).await.expect("Run must complete.");

	assert_eq!(summary.status, RunStatus::Done);

	let reloaded = store
		.load(summary.run_id)
		.await
		.expect("Store must load.")
		.expect("Run must be persisted.");
	let audit = runs::list_audit_records(&pool, summary.run_id)
		.await
		.expect("Audit records must load.");

	assert_eq!(reloaded.status, RunStatus::Done);
	assert_eq!(reloaded.candidates.len(), 3);
	assert_eq!(audit.len(), reloaded.log.len());
	assert!(audit.windows(2).all(|pair| pair[0].seq + 1 == pair[1].seq));

	drop(h);
	drop(store);
	pool.close().await;
	scratch.drop_database().await.expect("Failed to drop scratch database.");
}
