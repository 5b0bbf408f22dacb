use serde_json::json;
use uuid::Uuid;

use sieve_domain::{
	candidate::{AdjudicationDecision, ExclusionStage},
	phase::{Phase, RunStatus},
};
use sieve_service::{Adjudicate, CheckpointDecision, CheckpointParams, Error};

use super::{ScriptedLlm, harness, paper, request, test_config, trials};

#[tokio::test]
async fn interactive_run_pauses_at_every_phase_boundary() {
	let h = harness(test_config("interactive"), ScriptedLlm::default(), trials("pmid:i", 3));
	let mut summary = h.service.start_run(request(None)).await.expect("Run must start.");

	for phase in Phase::ALL {
		assert_eq!(summary.status, RunStatus::AwaitingApproval);
		assert_eq!(summary.phase, phase);
		assert!(summary.pending_approval);

		let checkpoint = h
			.service
			.get_pending_checkpoint(summary.run_id)
			.await
			.expect("Checkpoint lookup must succeed.")
			.expect("A checkpoint must be pending.");

		assert_eq!(checkpoint.phase, phase);

		if phase == Phase::Planning {
			assert!(checkpoint.snapshot.plan.is_some());
		}
		if phase == Phase::Synthesis {
			assert!(checkpoint.snapshot.report.is_some());
		}

		summary = h
			.service
			.resolve_checkpoint(summary.run_id, CheckpointDecision::Approve, CheckpointParams::default())
			.await
			.expect("Approval must succeed.");
	}

	assert_eq!(summary.status, RunStatus::Done);
	assert!(
		h.service
			.get_pending_checkpoint(summary.run_id)
			.await
			.expect("Checkpoint lookup must succeed.")
			.is_none()
	);
}

#[tokio::test]
async fn modify_reenters_the_phase_with_new_settings() {
	let mut llm = ScriptedLlm::default();

	llm.relevance.insert("pmid:f01".to_string(), 4);
	llm.relevance.insert("pmid:f02".to_string(), 4);

	let h = harness(test_config("interactive"), llm, trials("pmid:f", 4));
	let run_id = h.service.start_run(request(None)).await.expect("Run must start.").run_id;

	for _ in 0..2 {
		h.service
			.resolve_checkpoint(run_id, CheckpointDecision::Approve, CheckpointParams::default())
			.await
			.expect("Approval must succeed.");
	}

	let before = h.service.get_run(run_id).await.expect("Run must load.");

	assert_eq!(before.phase, Phase::FilteringScoring);
	assert_eq!(before.counts.excluded_at_relevance, 0);

	let params = CheckpointParams {
		overrides: Some(json!({ "relevance": { "threshold": 4.5 } })),
		note: Some("Tighten relevance.".to_string()),
		..CheckpointParams::default()
	};
	let after = h
		.service
		.resolve_checkpoint(run_id, CheckpointDecision::Modify, params)
		.await
		.expect("Modify must succeed.");

	assert_eq!(after.status, RunStatus::AwaitingApproval);
	assert_eq!(after.phase, Phase::FilteringScoring);
	assert_eq!(after.counts.excluded_at_relevance, 2);

	let state = h.service.get_state(run_id).await.expect("State must load.");

	assert_eq!(state.settings.relevance.threshold, 4.5);
	assert!(state.log.records().iter().any(|record| record.action == "phase_reentered"));
	assert_eq!(
		state.candidate("pmid:f01").and_then(|candidate| candidate.exclusion_stage()),
		Some(ExclusionStage::Relevance)
	);
}

#[tokio::test]
async fn invalid_modify_leaves_the_checkpoint_untouched() {
	let h = harness(test_config("interactive"), ScriptedLlm::default(), trials("pmid:v", 2));
	let run_id = h.service.start_run(request(None)).await.expect("Run must start.").run_id;
	let before = h.service.get_state(run_id).await.expect("State must load.");
	let params = CheckpointParams {
		overrides: Some(json!({ "composite": { "gate_threshold": 12.0 } })),
		..CheckpointParams::default()
	};
	let err = h
		.service
		.resolve_checkpoint(run_id, CheckpointDecision::Modify, params)
		.await
		.expect_err("Gate threshold above 10 must be rejected.");

	assert!(matches!(err, Error::Configuration { .. }), "Unexpected error: {err:?}.");

	let after = h.service.get_state(run_id).await.expect("State must load.");

	assert_eq!(after.status, RunStatus::AwaitingApproval);
	assert_eq!(after.log.len(), before.log.len());
}

#[tokio::test]
async fn reviewer_adjudication_overrides_the_gate() {
	let overrides = json!({ "composite": { "gate_threshold": 9.9 } });
	let h = harness(test_config("interactive"), ScriptedLlm::default(), trials("pmid:j", 3));
	let run_id = h.service.start_run(request(Some(overrides))).await.expect("Run must start.").run_id;

	for _ in 0..3 {
		h.service
			.resolve_checkpoint(run_id, CheckpointDecision::Approve, CheckpointParams::default())
			.await
			.expect("Approval must succeed.");
	}

	let gated = h.service.get_run(run_id).await.expect("Run must load.");

	assert_eq!(gated.phase, Phase::QualityAssessment);
	assert_eq!(gated.counts.excluded_at_gate, 3);
	assert_eq!(gated.counts.included, 0);

	let params = CheckpointParams {
		adjudications: vec![Adjudicate {
			paper_id: "pmid:j02".to_string(),
			decision: AdjudicationDecision::Include,
			note: "Large, well-conducted trial; gate is too strict for it.".to_string(),
		}],
		reviewer: Some("dr.ito".to_string()),
		..CheckpointParams::default()
	};
	let at_synthesis = h
		.service
		.resolve_checkpoint(run_id, CheckpointDecision::Approve, params)
		.await
		.expect("Approval with adjudication must succeed.");

	assert_eq!(at_synthesis.phase, Phase::Synthesis);
	assert_eq!(at_synthesis.counts.adjudicated_included, 1);
	assert_eq!(at_synthesis.counts.included, 1);
	assert_eq!(at_synthesis.counts.excluded_at_gate, 2, "Gate exclusions are net of overrides.");
	assert_eq!(
		at_synthesis.counts.excluded_at_gate + at_synthesis.counts.included,
		at_synthesis.counts.assessed
	);

	let state = h.service.get_state(run_id).await.expect("State must load.");
	let synthesis = state.synthesis.as_ref().expect("Synthesis must be recorded.");

	assert_eq!(synthesis.report.references.len(), 1);
	assert_eq!(synthesis.report.references[0].paper_id, "pmid:j02");
	assert!(state.log.records().iter().any(|record| {
		record.action == "adjudicated" && record.actor == "reviewer"
	}));
}

#[tokio::test]
async fn adjudication_cannot_revive_a_filtered_paper() {
	let mut papers = trials("pmid:f", 2);

	papers.push(paper(
		"pmid:case",
		"Metformin exposure and colorectal cancer: a case report",
		"We describe a single patient with type 2 diabetes on metformin.",
		"Case Reports",
	));

	let h = harness(test_config("interactive"), ScriptedLlm::default(), papers);
	let run_id = h.service.start_run(request(None)).await.expect("Run must start.").run_id;

	for _ in 0..3 {
		h.service
			.resolve_checkpoint(run_id, CheckpointDecision::Approve, CheckpointParams::default())
			.await
			.expect("Approval must succeed.");
	}

	let before = h.service.get_state(run_id).await.expect("State must load.");
	let case = before
		.candidates
		.iter()
		.find(|c| c.paper_id == "pmid:case")
		.expect("Case report must be pooled.");

	assert_eq!(before.phase, Phase::QualityAssessment);
	assert_eq!(case.exclusion_stage(), Some(ExclusionStage::Filter));

	let params = CheckpointParams {
		adjudications: vec![Adjudicate {
			paper_id: "pmid:case".to_string(),
			decision: AdjudicationDecision::Include,
			note: "Mechanistically interesting.".to_string(),
		}],
		..CheckpointParams::default()
	};
	let err = h
		.service
		.resolve_checkpoint(run_id, CheckpointDecision::Approve, params)
		.await
		.expect_err("Adjudicating a filtered paper must be rejected.");

	assert!(matches!(err, Error::InvalidRequest { .. }), "Unexpected error: {err:?}.");

	let after = h.service.get_state(run_id).await.expect("State must load.");

	assert_eq!(after.status, RunStatus::AwaitingApproval);
	assert_eq!(after.phase, Phase::QualityAssessment);
	assert_eq!(after.log.len(), before.log.len());
	assert!(after.candidates.iter().all(|c| c.adjudication.is_none()));
}

#[tokio::test]
async fn adjudication_outside_quality_assessment_is_rejected() {
	let h = harness(test_config("interactive"), ScriptedLlm::default(), trials("pmid:k", 1));
	let run_id = h.service.start_run(request(None)).await.expect("Run must start.").run_id;
	let params = CheckpointParams {
		adjudications: vec![Adjudicate {
			paper_id: "pmid:k01".to_string(),
			decision: AdjudicationDecision::Exclude,
			note: "Too early.".to_string(),
		}],
		..CheckpointParams::default()
	};
	let err = h
		.service
		.resolve_checkpoint(run_id, CheckpointDecision::Approve, params)
		.await
		.expect_err("Adjudication at PLANNING must be rejected.");

	assert!(matches!(err, Error::InvalidRequest { .. }), "Unexpected error: {err:?}.");
	assert_eq!(
		h.service.get_run(run_id).await.expect("Run must load.").status,
		RunStatus::AwaitingApproval
	);
}

#[tokio::test]
async fn reject_cancels_and_closes_the_run() {
	let h = harness(test_config("interactive"), ScriptedLlm::default(), trials("pmid:n", 1));
	let run_id = h.service.start_run(request(None)).await.expect("Run must start.").run_id;
	let rejected = h
		.service
		.resolve_checkpoint(run_id, CheckpointDecision::Reject, CheckpointParams::default())
		.await
		.expect("Reject must succeed.");

	assert_eq!(rejected.status, RunStatus::Cancelled);

	let err = h
		.service
		.resolve_checkpoint(run_id, CheckpointDecision::Approve, CheckpointParams::default())
		.await
		.expect_err("A cancelled run has no checkpoint.");

	assert!(matches!(err, Error::Conflict { .. }));

	let err = h.service.resume(run_id).await.expect_err("A cancelled run cannot resume.");

	assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn cancel_stops_an_idle_run_once() {
	let h = harness(test_config("interactive"), ScriptedLlm::default(), trials("pmid:q", 1));
	let run_id = h.service.start_run(request(None)).await.expect("Run must start.").run_id;
	let cancelled = h.service.cancel(run_id).await.expect("Cancel must succeed.");

	assert_eq!(cancelled.status, RunStatus::Cancelled);

	let err = h.service.cancel(run_id).await.expect_err("Second cancel must conflict.");

	assert!(matches!(err, Error::Conflict { .. }));

	let state = h.service.get_state(run_id).await.expect("State must load.");

	assert_eq!(state.log.records().last().map(|record| record.action.as_str()), Some("run_cancelled"));
}

#[tokio::test]
async fn unknown_runs_are_not_found() {
	let h = harness(test_config("interactive"), ScriptedLlm::default(), Vec::new());
	let err = h.service.get_run(Uuid::new_v4()).await.expect_err("Unknown run must not load.");

	assert!(matches!(err, Error::NotFound { .. }));
	assert_eq!(err.code(), "NOT_FOUND");
}
