//! Batched LLM relevance scoring, the second half of the filtering and scoring phase.
//!
//! Survivors of the filter cascade are sorted by paper id before batching, and each batch prompt
//! lists its papers in that order. Batch membership and prompt content therefore depend only on
//! the set of candidates, never on retrieval order. A failed batch, or a paper the reply leaves
//! out, gets an `Unknown` outcome: the paper stays in the review and the relevance dimension is
//! dropped from its composite.

use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, LazyLock},
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::{
	CollaboratorError, PhaseError, Providers, RunContext, WorkPool,
	llm::{self, Prompt},
	state::RunState,
};
use sieve_domain::{
	audit::AuditEntry,
	candidate::{RelevanceOutcome, RelevanceScore},
	phase::Phase,
	question::ResearchQuestion,
};

const ACTOR: &str = "relevance_scorer";
const SYSTEM: &str = "\
You screen papers for a systematic review. Score how relevant each paper is to the research \
question on an integer scale from 1 (irrelevant) to 5 (directly answers the question), applying \
the inclusion and exclusion criteria. Give a one-sentence rationale for every score. Score every \
listed paper exactly once and identify it by its paper_id.";

static SCHEMA: LazyLock<Value> = LazyLock::new(|| {
	json!({
		"type": "object",
		"properties": {
			"scores": {
				"type": "array",
				"items": {
					"type": "object",
					"properties": {
						"paper_id": { "type": "string" },
						"score": { "type": "integer", "minimum": 1, "maximum": 5 },
						"rationale": { "type": "string" }
					},
					"required": ["paper_id", "score", "rationale"]
				}
			}
		},
		"required": ["scores"]
	})
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct BatchItem {
	paper_id: String,
	title: String,
	#[serde(rename = "abstract")]
	abstract_text: String,
}

#[derive(Debug, Deserialize)]
struct ScoreReply {
	scores: Vec<ScoreItem>,
}

#[derive(Debug, Deserialize)]
struct ScoreItem {
	paper_id: String,
	score: f64,
	#[serde(default)]
	rationale: String,
}

#[derive(Debug, Clone, PartialEq)]
enum ItemScore {
	Scored { score: u8, rationale: String },
	Invalid { reason: String },
}

#[derive(Debug, Default, PartialEq)]
struct Interpretation {
	scores: HashMap<String, ItemScore>,
	/// Ids in the reply that were not part of the batch.
	unexpected: Vec<String>,
}

struct BatchOutcome {
	items: Vec<BatchItem>,
	digest: String,
	result: Result<(Interpretation, String), CollaboratorError>,
}

pub(crate) async fn run(
	ctx: &Arc<RunContext>,
	providers: &Providers,
	state: &mut RunState,
) -> Result<(), PhaseError> {
	let items: Vec<BatchItem> = state
		.active_candidates()
		.map(|candidate| BatchItem {
			paper_id: candidate.paper_id.clone(),
			title: candidate.title.clone(),
			abstract_text: candidate.abstract_text.clone(),
		})
		.collect();
	let batches = batches(items, ctx.settings.relevance.batch_size as usize);
	let question = Arc::new(state.question.clone());
	let pool = WorkPool::new(
		ctx.settings.runtime.max_concurrency,
		ctx.cancel.clone(),
		ctx.settings.runtime.abandon_inflight_on_cancel,
	);
	let units = batches
		.into_iter()
		.map(|items| {
			let ctx = ctx.clone();
			let providers = providers.clone();
			let question = question.clone();

			async move {
				let prompt = Prompt {
					label: "relevance",
					system: SYSTEM,
					user: batch_payload(&question, &items),
					schema: &SCHEMA,
				};
				let digest = prompt.fingerprint();
				let result = llm::call_structured::<ScoreReply>(&ctx, &providers, &prompt)
					.await
					.map(|reply| (interpret(&reply.value, &items), reply.model));

				BatchOutcome { items, digest, result }
			}
		})
		.collect();
	let run = pool.run_all(units).await;
	let threshold = ctx.settings.relevance.threshold;
	let mut totals = (0_usize, 0_usize, 0_usize);

	for (batch_no, outcome) in run.completed {
		let now = OffsetDateTime::now_utc();
		let (interpretation, model, batch_error) = match outcome.result {
			Ok((interpretation, model)) => (interpretation, model, None),
			Err(err) => (Interpretation::default(), ctx.model().to_string(), Some(err)),
		};
		let mut scored = 0;
		let mut unknown = 0;
		let mut excluded = 0;

		for item in &outcome.items {
			let relevance = match interpretation.scores.get(&item.paper_id) {
				Some(ItemScore::Scored { score, rationale }) => {
					let rationale = if rationale.trim().is_empty() {
						format!("Scored {score}/5 without a stated rationale.")
					} else {
						rationale.clone()
					};

					RelevanceOutcome::Scored(RelevanceScore {
						score: *score,
						rationale,
						model: model.clone(),
						scored_at: now,
					})
				},
				Some(ItemScore::Invalid { reason }) => RelevanceOutcome::Unknown {
					reason: reason.clone(),
					model: model.clone(),
					recorded_at: now,
				},
				None => RelevanceOutcome::Unknown {
					reason: match &batch_error {
						Some(err) => format!("Batch scoring failed: {err}"),
						None => "The reply did not score this paper.".to_string(),
					},
					model: model.clone(),
					recorded_at: now,
				},
			};
			let entry = paper_entry(item, &relevance, threshold, &model, &outcome.digest);
			let Some(candidate) = state.candidate_mut(&item.paper_id) else {
				return Err(PhaseError::invariant(format!(
					"Scored paper {} is not in the candidate pool.",
					item.paper_id
				)));
			};

			candidate.attach_relevance(relevance, threshold, now)?;

			match candidate.relevance.as_ref().and_then(|outcome| outcome.score()) {
				Some(_) => scored += 1,
				None => unknown += 1,
			}
			if candidate.is_excluded() {
				excluded += 1;
			}

			state.audit(entry);
		}

		totals = (totals.0 + scored, totals.1 + unknown, totals.2 + excluded);

		state.audit(
			AuditEntry::new(ACTOR, "relevance_batch")
				.phase(Phase::FilteringScoring)
				.subject(format!("batch-{}", batch_no + 1))
				.input(format!("{} papers.", outcome.items.len()))
				.output(format!("{scored} scored, {unknown} unknown, {excluded} excluded."))
				.rationale(batch_error.as_ref().map(ToString::to_string).unwrap_or_default())
				.metrics(json!({
					"papers": outcome.items.len(),
					"scored": scored,
					"unknown": unknown,
					"excluded": excluded,
					"unexpected_ids": interpretation.unexpected,
					"error_kind": batch_error.as_ref().map(CollaboratorError::kind),
					"model": model,
					"prompt_digest": outcome.digest,
				})),
		);
	}

	for (batch_no, panic) in run.panicked {
		state.audit(
			AuditEntry::new(ACTOR, "relevance_batch_failed")
				.phase(Phase::FilteringScoring)
				.subject(format!("batch-{}", batch_no + 1))
				.rationale(panic),
		);
	}

	if run.cancelled {
		return Err(PhaseError::Cancelled);
	}

	let unscored: Vec<String> = state
		.candidates
		.iter()
		.filter(|candidate| !candidate.is_excluded() && candidate.relevance.is_none())
		.map(|candidate| candidate.paper_id.clone())
		.collect();

	// Papers whose batch never reported back still need an outcome.
	for paper_id in unscored {
		let now = OffsetDateTime::now_utc();
		let outcome = RelevanceOutcome::Unknown {
			reason: "Scoring unit did not complete.".to_string(),
			model: ctx.model().to_string(),
			recorded_at: now,
		};

		if let Some(candidate) = state.candidate_mut(&paper_id) {
			candidate.attach_relevance(outcome, threshold, now)?;
		}

		totals.1 += 1;

		state.audit(
			AuditEntry::new(ACTOR, "relevance_unknown")
				.phase(Phase::FilteringScoring)
				.subject(paper_id)
				.rationale("Scoring unit did not complete."),
		);
	}

	tracing::info!(
		run_id = %ctx.run_id,
		scored = totals.0,
		unknown = totals.1,
		excluded = totals.2,
		"Relevance scoring finished."
	);

	Ok(())
}

fn batches(mut items: Vec<BatchItem>, size: usize) -> Vec<Vec<BatchItem>> {
	items.sort_by(|a, b| a.paper_id.cmp(&b.paper_id));

	items.chunks(size.max(1)).map(<[BatchItem]>::to_vec).collect()
}

fn batch_payload(question: &ResearchQuestion, items: &[BatchItem]) -> String {
	json!({
		"question": question.text,
		"pico": question.pico,
		"inclusion_criteria": question.inclusion_criteria,
		"exclusion_criteria": question.exclusion_criteria,
		"papers": items,
	})
	.to_string()
}

/// Keeps the first score per batch paper; anything off the 1-5 integer scale is invalid.
fn interpret(reply: &ScoreReply, items: &[BatchItem]) -> Interpretation {
	let expected: HashSet<&str> = items.iter().map(|item| item.paper_id.as_str()).collect();
	let mut out = Interpretation::default();

	for item in &reply.scores {
		let paper_id = item.paper_id.trim();

		if !expected.contains(paper_id) {
			out.unexpected.push(paper_id.to_string());

			continue;
		}
		if out.scores.contains_key(paper_id) {
			continue;
		}

		let rounded = item.score.round();
		let score = if item.score.is_finite()
			&& (item.score - rounded).abs() < 1e-6
			&& (1.0..=5.0).contains(&rounded)
		{
			ItemScore::Scored { score: rounded as u8, rationale: item.rationale.trim().to_string() }
		} else {
			ItemScore::Invalid { reason: format!("Score {} is not an integer from 1 to 5.", item.score) }
		};

		out.scores.insert(paper_id.to_string(), score);
	}

	out
}

fn paper_entry(
	item: &BatchItem,
	outcome: &RelevanceOutcome,
	threshold: f64,
	model: &str,
	digest: &str,
) -> AuditEntry {
	match outcome {
		RelevanceOutcome::Scored(score) => {
			let retained = f64::from(score.score) >= threshold;

			AuditEntry::new(ACTOR, "relevance_scored")
				.phase(Phase::FilteringScoring)
				.subject(item.paper_id.clone())
				.input(item.title.clone())
				.output(format!(
					"Score {}/5, {}.",
					score.score,
					if retained { "retained" } else { "excluded" }
				))
				.rationale(score.rationale.clone())
				.metrics(json!({
					"score": score.score,
					"threshold": threshold,
					"model": model,
					"prompt_digest": digest,
				}))
		},
		RelevanceOutcome::Unknown { reason, .. } => AuditEntry::new(ACTOR, "relevance_unknown")
			.phase(Phase::FilteringScoring)
			.subject(item.paper_id.clone())
			.input(item.title.clone())
			.output("Relevance unknown; paper retained.")
			.rationale(reason.clone())
			.metrics(json!({ "model": model, "prompt_digest": digest })),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn item(id: &str) -> BatchItem {
		BatchItem { paper_id: id.to_string(), title: format!("T{id}"), abstract_text: String::new() }
	}

	fn reply(scores: &[(&str, f64)]) -> ScoreReply {
		ScoreReply {
			scores: scores
				.iter()
				.map(|(id, score)| ScoreItem {
					paper_id: id.to_string(),
					score: *score,
					rationale: "because".to_string(),
				})
				.collect(),
		}
	}

	#[test]
	fn batches_do_not_depend_on_input_order() {
		let forward = batches(vec![item("c"), item("a"), item("b"), item("d")], 3);
		let reverse = batches(vec![item("d"), item("b"), item("a"), item("c")], 3);

		assert_eq!(forward, reverse);
		assert_eq!(forward[0].iter().map(|i| i.paper_id.as_str()).collect::<Vec<_>>(), vec!["a", "b", "c"]);
	}

	#[test]
	fn interpret_flags_out_of_scale_scores_and_strangers() {
		let items = vec![item("a"), item("b"), item("c")];
		let out = interpret(&reply(&[("a", 4.0), ("b", 7.0), ("z", 3.0), ("a", 1.0)]), &items);

		assert_eq!(
			out.scores.get("a"),
			Some(&ItemScore::Scored { score: 4, rationale: "because".to_string() })
		);
		assert!(matches!(out.scores.get("b"), Some(ItemScore::Invalid { .. })));
		assert!(!out.scores.contains_key("c"));
		assert_eq!(out.unexpected, vec!["z".to_string()]);
	}

	#[test]
	fn fractional_scores_are_invalid() {
		let out = interpret(&reply(&[("a", 3.5)]), &[item("a")]);

		assert!(matches!(out.scores.get("a"), Some(ItemScore::Invalid { .. })));
	}
}
