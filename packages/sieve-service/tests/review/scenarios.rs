use std::{collections::HashSet, sync::atomic::Ordering, time::Duration};

use sieve_domain::{
	candidate::{AssessmentStatus, ExclusionStage},
	citation,
	composite::{EVALUATOR_RISK_OF_BIAS, GateDecision},
	phase::{Phase, RunStatus},
};
use sieve_service::{Error, synthesis::SynthesisPath};

use super::{ScriptedLlm, harness, paper, request, test_config, trials};

#[tokio::test]
async fn five_strong_candidates_take_the_direct_path() {
	let h = harness(test_config("automatic"), ScriptedLlm::default(), trials("pmid:a", 5));
	let summary = h.service.start_run(request(None)).await.expect("Run must complete.");

	assert_eq!(summary.status, RunStatus::Done);
	assert!(summary.failure.is_none());

	let state = h.service.get_state(summary.run_id).await.expect("State must load.");
	let synthesis = state.synthesis.as_ref().expect("Synthesis must be recorded.");

	assert_eq!(synthesis.path, SynthesisPath::Direct);
	assert_eq!(synthesis.report.references.len(), 5);
	assert!(synthesis.report.references.iter().all(|reference| reference.cited));
	assert!(synthesis.report.unknown_citations.is_empty());
	synthesis.report.verify(&synthesis.registry).expect("Report must verify.");

	for number in 1..=5 {
		assert!(synthesis.report.text.contains(&format!("[{number}]")));
	}
	for candidate in &state.candidates {
		let composite = candidate.composite.as_ref().expect("Every candidate must be gated.");

		assert!(composite.score >= 4.0, "{} scored {}.", candidate.paper_id, composite.score);
		assert_eq!(composite.decision, GateDecision::Included);
	}

	assert_eq!(summary.counts.included, 5);
}

#[tokio::test]
async fn evaluator_timeouts_leave_unknown_dimensions_and_the_run_completes() {
	let mut papers = trials("pmid:g", 12);
	let mut llm = ScriptedLlm::default();

	for index in 1..=4 {
		let id = format!("pmid:l{index:02}");

		llm.relevance.insert(id.clone(), 1);
		papers.push(super::trial(&id));
	}

	papers.push(paper(
		"pmid:e01",
		"Editorial: metformin and cancer, a cautionary note",
		"Opinion on recent observational findings.",
		"Editorial",
	));
	papers.push(paper(
		"pmid:e02",
		"Erratum: metformin exposure in colorectal cancer",
		"Corrects table 2.",
		"Published Erratum",
	));
	papers.push(paper(
		"pmid:c01",
		"Lactic acidosis after metformin overdose: a case report",
		"A 70-year-old woman presented with severe acidosis.",
		"Case Reports",
	));
	papers.push(paper(
		"pmid:c02",
		"Colon adenocarcinoma in a metformin user: case report",
		"We describe a 58-year-old man with a rapidly growing tumour.",
		"Case Reports",
	));
	llm.stalled_risk_of_bias.insert("pmid:g03".to_string());
	llm.stalled_risk_of_bias.insert("pmid:g07".to_string());

	let h = harness(test_config("automatic"), llm, papers);
	let summary = h.service.start_run(request(None)).await.expect("Run must complete.");

	assert_eq!(summary.status, RunStatus::Done);
	assert!(summary.failure.is_none());
	assert_eq!(summary.counts.excluded_at_filter, 4);
	assert_eq!(summary.counts.excluded_at_relevance, 4);
	assert_eq!(summary.counts.included, 12);

	let state = h.service.get_state(summary.run_id).await.expect("State must load.");

	for paper_id in ["pmid:g03", "pmid:g07"] {
		let candidate = state.candidate(paper_id).expect("Stalled candidate must exist.");
		let assessment =
			candidate.assessment(EVALUATOR_RISK_OF_BIAS).expect("Failure must still be recorded.");
		let composite = candidate.composite.as_ref().expect("Composite must be computed.");

		assert_eq!(assessment.status, AssessmentStatus::Unknown);
		assert!(composite.coverage < 1.0);
		assert_eq!(composite.decision, GateDecision::Included);
		assert!(state.log.records().iter().any(|record| {
			record.action == "quality_unknown" && record.subject.as_deref() == Some(paper_id)
		}));
	}

	let synthesis = state.synthesis.as_ref().expect("Synthesis must be recorded.");

	assert_eq!(synthesis.path, SynthesisPath::Direct);
	assert_eq!(synthesis.report.references.len(), 12);
}

#[tokio::test]
async fn crashed_evaluators_leave_unknown_dimensions_like_timeouts() {
	let mut llm = ScriptedLlm::default();

	llm.crashing_risk_of_bias.insert("pmid:p02".to_string());

	let h = harness(test_config("automatic"), llm, trials("pmid:p", 3));
	let summary = h.service.start_run(request(None)).await.expect("Run must complete.");

	assert_eq!(summary.status, RunStatus::Done);

	let state = h.service.get_state(summary.run_id).await.expect("State must load.");
	let candidate = state.candidate("pmid:p02").expect("Crashed candidate must exist.");
	let assessment =
		candidate.assessment(EVALUATOR_RISK_OF_BIAS).expect("The crash must still be recorded.");

	assert_eq!(assessment.status, AssessmentStatus::Unknown);
	assert!(assessment.error.as_deref().is_some_and(|error| !error.is_empty()));
	assert!(candidate.composite.as_ref().is_some_and(|composite| composite.coverage < 1.0));
	assert!(state.log.records().iter().any(|record| {
		record.action == "quality_unknown"
			&& record.subject.as_deref() == Some("pmid:p02")
			&& record.metrics["error_kind"] == "panic"
	}));
}

#[tokio::test]
async fn corpus_outage_fails_searching_and_resume_restarts_there() {
	let h = harness(test_config("interactive"), ScriptedLlm::default(), trials("pmid:s", 6));
	let created = h.service.start_run(request(None)).await.expect("Planning must complete.");

	assert_eq!(created.status, RunStatus::AwaitingApproval);
	assert_eq!(created.phase, Phase::Planning);

	h.corpus.healthy.store(false, Ordering::SeqCst);

	let failed = h
		.service
		.resolve_checkpoint(created.run_id, sieve_service::CheckpointDecision::Approve, Default::default())
		.await
		.expect("Approval must be accepted.");

	assert_eq!(failed.status, RunStatus::Failed);
	assert_eq!(failed.phase, Phase::Searching);

	let failure = failed.failure.as_ref().expect("Failure must be recorded.");

	assert_eq!(failure.error_code, "CORPUS_UNAVAILABLE");
	assert_eq!(failure.phase, Phase::Searching);

	let stored = h.service.get_state(created.run_id).await.expect("State must load.");

	assert!(stored.plan.is_some(), "The plan from the last checkpoint must survive the failure.");
	assert!(stored.candidates.is_empty());

	let failed_queries: Vec<_> =
		stored.log.records().iter().filter(|record| record.action == "query_failed").collect();
	let phase_failed = stored
		.log
		.records()
		.iter()
		.find(|record| record.action == "phase_failed")
		.expect("The failure must be audited.");

	assert!(!failed_queries.is_empty(), "Per-query failures must survive the rollback.");
	assert!(failed_queries.iter().all(|record| {
		record.seq < phase_failed.seq && record.metrics["failed_call"] == "corpus"
	}));

	h.corpus.healthy.store(true, Ordering::SeqCst);

	let resumed = h.service.resume(created.run_id).await.expect("Resume must run.");

	assert_eq!(resumed.status, RunStatus::AwaitingApproval);
	assert_eq!(resumed.phase, Phase::Searching);
	assert!(resumed.failure.is_none());
	assert_eq!(h.llm.plan_calls.load(Ordering::SeqCst), 1, "Planning must not run again.");

	let state = h.service.get_state(created.run_id).await.expect("State must load.");
	let actions: Vec<&str> = state.log.records().iter().map(|record| record.action.as_str()).collect();

	assert_eq!(state.candidates.len(), 6);
	assert!(actions.contains(&"phase_failed"));
	assert!(actions.contains(&"run_resumed"));
	assert_eq!(actions.iter().filter(|action| **action == "plan_generated").count(), 1);
}

#[tokio::test]
async fn numbered_brackets_written_by_the_model_are_dropped_not_fatal() {
	let llm = ScriptedLlm {
		narrative_suffix: Some(" Earlier meta-analyses agree [7].".to_string()),
		..ScriptedLlm::default()
	};
	let h = harness(test_config("automatic"), llm, trials("pmid:n", 3));
	let summary = h.service.start_run(request(None)).await.expect("Run must complete.");

	assert_eq!(summary.status, RunStatus::Done);
	assert!(summary.failure.is_none());

	let state = h.service.get_state(summary.run_id).await.expect("State must load.");
	let synthesis = state.synthesis.as_ref().expect("Synthesis must be recorded.");

	assert!(!synthesis.fallback_used);
	assert_eq!(synthesis.report.unknown_citations, vec!["[7]".to_string()]);
	assert!(synthesis.report.text.ends_with("Earlier meta-analyses agree."));
	assert!(!synthesis.report.text.contains("[7]"));
	synthesis.report.verify(&synthesis.registry).expect("Report must verify.");
	assert!(state.log.records().iter().any(|record| {
		record.action == "citation_unknown" && record.subject.as_deref() == Some("[7]")
	}));
}

#[tokio::test]
async fn abandoned_advance_releases_the_run() {
	let llm = ScriptedLlm { plan_delay: Some(Duration::from_millis(150)), ..ScriptedLlm::default() };
	let h = harness(test_config("interactive"), llm, trials("pmid:d", 3));
	let created = h.service.create_run(request(None)).await.expect("Run must be created.");
	let abandoned =
		tokio::time::timeout(Duration::from_millis(20), h.service.advance(created.run_id)).await;

	assert!(abandoned.is_err(), "Planning must still be running when the caller gives up.");

	let summary = h.service.advance(created.run_id).await.expect("A retry must not conflict.");

	assert_eq!(summary.status, RunStatus::AwaitingApproval);
	assert_eq!(summary.phase, Phase::Planning);
}

#[tokio::test]
async fn map_reduce_references_resolve_exactly_once() {
	let h = harness(test_config("automatic"), ScriptedLlm::default(), trials("pmid:m", 20));
	let summary = h.service.start_run(request(None)).await.expect("Run must complete.");
	let state = h.service.get_state(summary.run_id).await.expect("State must load.");
	let synthesis = state.synthesis.as_ref().expect("Synthesis must be recorded.");

	assert_eq!(synthesis.path, SynthesisPath::MapReduce);
	assert_eq!(synthesis.report.references.len(), 20);
	synthesis.report.verify(&synthesis.registry).expect("Report must verify.");

	let minted: HashSet<_> =
		synthesis.registry.citations().iter().map(|citation| citation.citation_id).collect();
	let resolved: HashSet<_> =
		synthesis.report.references.iter().map(|reference| reference.citation_id).collect();

	assert_eq!(minted, resolved);

	let numbers = citation::bracket_numbers(&synthesis.report.text);

	assert!(!numbers.is_empty());
	assert!(numbers.iter().all(|number| (1..=20).contains(number)));
	assert!(state.log.records().iter().any(|record| record.action == "map_completed"));
}

#[tokio::test]
async fn recall_misses_are_traceable_to_an_exclusion_stage() {
	let mut llm = ScriptedLlm::default();
	let mut papers = trials("pmid:r", 3);

	llm.relevance.insert("pmid:r02".to_string(), 2);
	papers.push(paper(
		"pmid:x01",
		"Editorial: what metformin trials cannot tell us",
		"Commentary.",
		"Editorial",
	));

	let h = harness(test_config("automatic"), llm, papers);
	let summary = h.service.start_run(request(None)).await.expect("Run must complete.");
	let export = h.service.export(summary.run_id).await.expect("Export must build.");
	let missed = export
		.candidates
		.iter()
		.find(|candidate| candidate.paper_id == "pmid:r02")
		.expect("Missed paper must be exported.");
	let exclusion = missed.exclusion.as_ref().expect("Miss must carry an exclusion.");

	assert_eq!(exclusion.stage, ExclusionStage::Relevance);
	assert_eq!(exclusion.rationale, "Scored 2 against the PICO question.");
	assert!(export.audit.iter().any(|record| {
		record.action == "relevance_scored" && record.subject.as_deref() == Some("pmid:r02")
	}));
}

#[tokio::test]
async fn configuration_errors_are_rejected_before_any_phase() {
	let h = harness(test_config("automatic"), ScriptedLlm::default(), trials("pmid:w", 2));
	let overrides = serde_json::json!({ "composite": { "weights": { "relevance": 0.5 } } });
	let err = h
		.service
		.start_run(request(Some(overrides)))
		.await
		.expect_err("Weights off by 0.15 must be rejected.");

	assert!(matches!(err, Error::Configuration { .. }), "Unexpected error: {err:?}.");
	assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
	assert_eq!(h.corpus.calls.load(Ordering::SeqCst), 0);
}
