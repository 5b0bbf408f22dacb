//! Planning phase: turns the research question into a multi-strategy search plan.
//!
//! The LLM proposes queries and drafts a hypothetical abstract for HyDE search. Whatever it
//! returns is normalized, deduplicated, topped up from the PICO terms until every strategy is
//! covered and the minimum count is met, then capped. Planning never fails: without a usable LLM
//! reply the plan is built entirely from the question.

use std::{collections::HashSet, sync::LazyLock};

use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
	PhaseError, Providers, RunContext,
	llm::{self, Prompt},
	state::RunState,
};
use sieve_domain::{
	audit::AuditEntry,
	phase::Phase,
	plan::{Query, SearchPlan, Strategy},
	question::ResearchQuestion,
};

const ACTOR: &str = "planner";
const PLAN_SYSTEM: &str = "\
You plan literature searches for a systematic review. Propose between 8 and 12 search queries \
that together cover the question. Use every strategy at least once: \"semantic\" (natural-language \
description for embedding search), \"keyword\" (terse terms for BM25 search), \
\"hypothetical_document\" (a query answered by a drafted abstract), and \"hybrid\" (terms suitable \
for both). Also draft one plausible abstract of a study that would answer the question.";
const HYDE_SYSTEM: &str = "\
Draft a plausible abstract of a clinical or empirical study that would directly answer the \
research question. Write it the way a journal abstract is written. Do not invent citations.";

static PLAN_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
	json!({
		"type": "object",
		"properties": {
			"queries": {
				"type": "array",
				"items": {
					"type": "object",
					"properties": {
						"strategy": {
							"type": "string",
							"enum": ["semantic", "keyword", "hypothetical_document", "hybrid"]
						},
						"text": { "type": "string" },
						"label": { "type": "string" }
					},
					"required": ["strategy", "text"]
				}
			},
			"hypothetical_abstract": { "type": "string" }
		},
		"required": ["queries"]
	})
});
static HYDE_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
	json!({
		"type": "object",
		"properties": { "abstract": { "type": "string" } },
		"required": ["abstract"]
	})
});

#[derive(Debug, Deserialize)]
struct PlanReply {
	#[serde(default)]
	queries: Vec<PlannedQuery>,
	#[serde(default)]
	hypothetical_abstract: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlannedQuery {
	strategy: String,
	text: String,
	#[serde(default)]
	label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HydeReply {
	#[serde(rename = "abstract")]
	abstract_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Draft {
	strategy: Strategy,
	text: String,
	label: Option<String>,
	fallback: bool,
}

pub(crate) async fn run(
	ctx: &RunContext,
	providers: &Providers,
	state: &mut RunState,
) -> Result<(), PhaseError> {
	if ctx.cancel.is_cancelled() {
		return Err(PhaseError::Cancelled);
	}

	let question = state.question.clone();
	let user = question_payload(&question);
	let prompt = Prompt { label: "planner", system: PLAN_SYSTEM, user, schema: &PLAN_SCHEMA };
	let digest = prompt.fingerprint();
	let mut drafts = Vec::new();
	let mut document = None;
	let mut model = ctx.model().to_string();

	match llm::call_structured::<PlanReply>(ctx, providers, &prompt).await {
		Ok(reply) => {
			model = reply.model;
			document = reply.value.hypothetical_abstract.filter(|text| !text.trim().is_empty());

			for item in reply.value.queries {
				let Some(strategy) = Strategy::parse(&item.strategy) else {
					tracing::debug!(strategy = %item.strategy, "Dropping query with unknown strategy.");

					continue;
				};

				drafts.push(Draft { strategy, text: item.text, label: item.label, fallback: false });
			}
		},
		Err(err) => {
			tracing::warn!(run_id = %ctx.run_id, error = %err, "Planner fell back to PICO queries.");
			state.audit(
				AuditEntry::new(ACTOR, "planner_fallback")
					.phase(Phase::Planning)
					.input(question.text.clone())
					.output("Plan will be built from the PICO terms.")
					.rationale(err.to_string())
					.metrics(json!({
						"error_kind": err.kind(),
						"model": model,
						"prompt_digest": digest,
					})),
			);
		},
	}

	let document = match document {
		Some(document) => document,
		None => draft_hypothetical_abstract(ctx, providers, state, &question).await,
	};
	let llm_count = drafts.len();
	let drafts = top_up(normalize(drafts), &question, ctx.settings.planner.min_queries as usize);
	let drafts = cap(drafts, ctx.settings.planner.max_queries as usize);
	let plan = build_plan(ctx.run_id, drafts.clone(), &document);
	let fallback_count = drafts.iter().filter(|draft| draft.fallback).count();
	let per_strategy: serde_json::Map<String, Value> = Strategy::ALL
		.iter()
		.map(|strategy| {
			let count = plan.queries.iter().filter(|query| query.strategy == *strategy).count();

			(strategy.as_str().to_string(), json!(count))
		})
		.collect();

	if !plan.covers_all_strategies() {
		return Err(PhaseError::invariant("Search plan does not cover every strategy."));
	}

	state.audit(
		AuditEntry::new(ACTOR, "plan_generated")
			.phase(Phase::Planning)
			.input(question.text.clone())
			.output(format!("{} queries across {} strategies.", plan.queries.len(), Strategy::ALL.len()))
			.rationale(format!(
				"{llm_count} queries proposed by the model; {fallback_count} derived from PICO terms."
			))
			.metrics(json!({
				"queries": plan.queries.len(),
				"per_strategy": per_strategy,
				"fallback_queries": fallback_count,
				"model": model,
				"prompt_digest": digest,
			})),
	);
	tracing::info!(run_id = %ctx.run_id, queries = plan.queries.len(), "Search plan generated.");

	state.plan = Some(plan);

	Ok(())
}

async fn draft_hypothetical_abstract(
	ctx: &RunContext,
	providers: &Providers,
	state: &mut RunState,
	question: &ResearchQuestion,
) -> String {
	let prompt = Prompt {
		label: "hyde",
		system: HYDE_SYSTEM,
		user: question_payload(question),
		schema: &HYDE_SCHEMA,
	};

	match llm::call_structured::<HydeReply>(ctx, providers, &prompt).await {
		Ok(reply) if !reply.value.abstract_text.trim().is_empty() => reply.value.abstract_text,
		Ok(_) => template_abstract(question),
		Err(err) => {
			state.audit(
				AuditEntry::new(ACTOR, "hyde_fallback")
					.phase(Phase::Planning)
					.input(question.text.clone())
					.output("Hypothetical abstract built from the PICO terms.")
					.rationale(err.to_string())
					.metrics(json!({ "error_kind": err.kind(), "prompt_digest": prompt.fingerprint() })),
			);

			template_abstract(question)
		},
	}
}

fn question_payload(question: &ResearchQuestion) -> String {
	json!({
		"question": question.text,
		"pico": question.pico,
		"inclusion_criteria": question.inclusion_criteria,
		"exclusion_criteria": question.exclusion_criteria,
	})
	.to_string()
}

/// Stand-in abstract shaped like the studies the question is after.
fn template_abstract(question: &ResearchQuestion) -> String {
	let pico = &question.pico;
	let comparison =
		pico.comparison.as_deref().map(|c| format!(" compared with {c}")).unwrap_or_default();

	format!(
		"Background: {question}. Methods: We studied {population} receiving {intervention}{comparison}. \
		 Results: {intervention} was associated with a change in {outcome}. Conclusions: The findings \
		 address the effect of {intervention} on {outcome} in {population}.",
		question = question.text.trim().trim_end_matches('?'),
		population = pico.population.trim(),
		intervention = pico.intervention.trim(),
		outcome = pico.outcome.trim(),
	)
}

fn normalize_text(text: &str) -> String {
	text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapses whitespace, drops blanks, and removes case-insensitive duplicates per strategy.
fn normalize(drafts: Vec<Draft>) -> Vec<Draft> {
	let mut seen = HashSet::new();

	drafts
		.into_iter()
		.filter_map(|draft| {
			let text = normalize_text(&draft.text);

			if text.is_empty() || !seen.insert((draft.strategy, text.to_lowercase())) {
				return None;
			}

			let label = draft.label.map(|label| normalize_text(&label)).filter(|label| !label.is_empty());

			Some(Draft { text, label, ..draft })
		})
		.collect()
}

fn fallback_drafts(question: &ResearchQuestion) -> Vec<Draft> {
	let pico = &question.pico;
	let terms = pico.terms().join(" ");
	let population = pico.population.trim();
	let intervention = pico.intervention.trim();
	let outcome = pico.outcome.trim();
	let mut out = vec![
		(Strategy::Semantic, question.text.clone()),
		(Strategy::Keyword, terms.clone()),
		(Strategy::HypotheticalDocument, question.text.clone()),
		(Strategy::Hybrid, format!("{intervention} {outcome}")),
		(Strategy::Semantic, format!("effect of {intervention} on {outcome} in {population}")),
		(Strategy::Keyword, format!("{intervention} {outcome}")),
		(Strategy::Hybrid, format!("{population} {intervention}")),
		(Strategy::Keyword, format!("{population} {outcome}")),
	];

	if let Some(comparison) = pico.comparison.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
		out.push((Strategy::Semantic, format!("{intervention} versus {comparison} for {outcome}")));
		out.push((Strategy::Keyword, format!("{intervention} {comparison} {outcome}")));
	}

	out.push((Strategy::Hybrid, terms));

	out.into_iter()
		.map(|(strategy, text)| Draft { strategy, text, label: None, fallback: true })
		.collect()
}

/// Adds PICO-derived queries until every strategy is present and `min` is reached.
fn top_up(mut drafts: Vec<Draft>, question: &ResearchQuestion, min: usize) -> Vec<Draft> {
	let fallback = normalize(fallback_drafts(question));

	for strategy in Strategy::ALL {
		if drafts.iter().any(|draft| draft.strategy == strategy) {
			continue;
		}
		if let Some(extra) = fallback.iter().find(|draft| draft.strategy == strategy) {
			drafts.push(extra.clone());
		}
	}

	for extra in fallback {
		if drafts.len() >= min {
			break;
		}

		let duplicate = drafts.iter().any(|draft| {
			draft.strategy == extra.strategy && draft.text.eq_ignore_ascii_case(&extra.text)
		});

		if !duplicate {
			drafts.push(extra);
		}
	}

	drafts
}

/// Keeps at most `max` drafts, reserving one slot per strategy, and preserves the original order.
fn cap(drafts: Vec<Draft>, max: usize) -> Vec<Draft> {
	if drafts.len() <= max {
		return drafts;
	}

	let mut keep = vec![false; drafts.len()];
	let mut kept = 0;

	for strategy in Strategy::ALL {
		if let Some(index) = drafts.iter().position(|draft| draft.strategy == strategy)
			&& kept < max
		{
			keep[index] = true;
			kept += 1;
		}
	}
	for flag in keep.iter_mut() {
		if kept >= max {
			break;
		}
		if !*flag {
			*flag = true;
			kept += 1;
		}
	}

	drafts.into_iter().zip(keep).filter(|(_, keep)| *keep).map(|(draft, _)| draft).collect()
}

fn build_plan(run_id: Uuid, drafts: Vec<Draft>, document: &str) -> SearchPlan {
	let mut ordinals = [0_usize; 4];
	let queries = drafts
		.into_iter()
		.map(|draft| {
			let slot = Strategy::ALL.iter().position(|s| *s == draft.strategy).unwrap_or(0);

			ordinals[slot] += 1;

			let key = format!("{}:{}", draft.strategy.as_str(), draft.text.to_lowercase());

			Query {
				query_id: Uuid::new_v5(&run_id, key.as_bytes()),
				strategy: draft.strategy,
				label: draft
					.label
					.unwrap_or_else(|| format!("{}-{}", draft.strategy.as_str(), ordinals[slot])),
				hypothetical_document: (draft.strategy == Strategy::HypotheticalDocument)
					.then(|| document.to_string()),
				text: draft.text,
			}
		})
		.collect();

	SearchPlan { queries }
}
