//! Synthesis phase.
//!
//! Included papers get one citation UUID each, minted per run. Up to the configured threshold the
//! model writes the findings in one call; above it, batches are summarized into themes in
//! parallel and the themes are merged in a final call. Intermediate text cites `[uuid]` tokens
//! only. One deterministic pass then numbers citations by first appearance, drops tokens that
//! were never minted, and appends references the text never cited. Every repair is audited.
//! If a model call fails, a deterministic rendering of the sources stands in for its output.

use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, LazyLock},
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
	PhaseError, Providers, RunContext, WorkPool,
	llm::{self, Prompt},
	state::RunState,
};
use sieve_domain::{
	audit::AuditEntry,
	candidate::{Candidate, Findings},
	citation::{self, CitationRegistry, ResolvedReport},
	composite::{EVALUATOR_EXTRACTION, EVALUATOR_STUDY_DESIGN},
	phase::Phase,
	question::ResearchQuestion,
};

const ACTOR: &str = "synthesizer";
const NO_STUDIES: &str = "No studies met the inclusion criteria.";
const DIRECT_SYSTEM: &str = "\
Write the findings section of a systematic review from the sources provided. Support every claim \
with the citation token of the source it comes from, copied exactly, for example \
[2f1c6a0e-7f0b-4a57-9d55-6f3a1c2b9e10]. Group tokens like [uuid1, uuid2]. Cite only the tokens \
provided and cite every source at least once. Never number citations yourself.";
const MAP_SYSTEM: &str = "\
Group the sources into themes relevant to the research question. For each theme give a short \
title, a summary of what the sources report, and the citation tokens of the supporting sources, \
copied exactly. Every source must support at least one theme.";
const REDUCE_SYSTEM: &str = "\
Merge the themes into the findings section of a systematic review. Keep every citation token \
exactly as given, attached to the claims it supports, grouped like [uuid1, uuid2] where several \
apply. Do not add citation tokens that are not in the themes and never number citations yourself.";

static NARRATIVE_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
	json!({
		"type": "object",
		"properties": { "narrative": { "type": "string" } },
		"required": ["narrative"]
	})
});
static THEMES_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
	json!({
		"type": "object",
		"properties": {
			"themes": {
				"type": "array",
				"items": {
					"type": "object",
					"properties": {
						"title": { "type": "string" },
						"summary": { "type": "string" },
						"citations": { "type": "array", "items": { "type": "string" } }
					},
					"required": ["title", "summary", "citations"]
				}
			}
		},
		"required": ["themes"]
	})
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisPath {
	/// Nothing was included; no model call was made.
	Empty,
	Direct,
	MapReduce,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Theme {
	pub title: String,
	pub summary: String,
	pub citations: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOutput {
	pub path: SynthesisPath,
	pub registry: CitationRegistry,
	#[serde(default)]
	pub themes: Vec<Theme>,
	/// Model text before citation resolution.
	pub draft: String,
	pub report: ResolvedReport,
	/// Whether any deterministic stand-in replaced model output.
	pub fallback_used: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Source {
	citation: String,
	title: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	year: Option<i32>,
	study_type: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	design: Option<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	key_findings: Vec<String>,
	#[serde(rename = "abstract")]
	abstract_text: String,
	#[serde(skip)]
	citation_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct NarrativeReply {
	narrative: String,
}

#[derive(Debug, Deserialize)]
struct ThemesReply {
	themes: Vec<ThemeReply>,
}

#[derive(Debug, Deserialize)]
struct ThemeReply {
	title: String,
	summary: String,
	#[serde(default)]
	citations: Vec<String>,
}

struct MapOutcome {
	themes: Vec<Theme>,
	fallback: Option<String>,
	dropped: Vec<String>,
	model: String,
	digest: String,
}

pub(crate) async fn run(
	ctx: &Arc<RunContext>,
	providers: &Providers,
	state: &mut RunState,
) -> Result<(), PhaseError> {
	if ctx.cancel.is_cancelled() {
		return Err(PhaseError::Cancelled);
	}

	let mut included: Vec<&Candidate> =
		state.candidates.iter().filter(|candidate| candidate.is_included()).collect();

	included.sort_by(|a, b| a.paper_id.cmp(&b.paper_id));

	let registry = CitationRegistry::mint(included.iter().map(|candidate| candidate.paper_id.clone()));
	let sources: Vec<Source> = included
		.iter()
		.zip(registry.citations())
		.map(|(candidate, citation)| source(candidate, citation.citation_id))
		.collect();
	let question = state.question.clone();

	state.audit(
		AuditEntry::new(ACTOR, "citations_minted")
			.phase(Phase::Synthesis)
			.output(format!("{} citations minted.", registry.len()))
			.metrics(json!({
				"citations": registry
					.citations()
					.iter()
					.map(|citation| json!({ "citation_id": citation.citation_id, "paper_id": citation.paper_id }))
					.collect::<Vec<_>>(),
			})),
	);

	let threshold = ctx.settings.synthesis.map_reduce_threshold as usize;
	let (path, themes, draft, mut fallback_used) = if sources.is_empty() {
		(SynthesisPath::Empty, Vec::new(), NO_STUDIES.to_string(), false)
	} else if sources.len() <= threshold {
		let (draft, fallback_used) = direct(ctx, providers, state, &question, &sources).await;

		(SynthesisPath::Direct, Vec::new(), draft, fallback_used)
	} else {
		let (themes, draft, fallback_used) =
			map_reduce(ctx, providers, state, &question, &sources).await?;

		(SynthesisPath::MapReduce, themes, draft, fallback_used)
	};
	let mut report = citation::resolve(&draft, &registry);

	if let Err(err) = report.verify(&registry) {
		tracing::warn!(run_id = %ctx.run_id, error = %err, "Synthesized citations failed verification.");
		state.audit(
			AuditEntry::new(ACTOR, "citation_verification_failed")
				.phase(Phase::Synthesis)
				.output("Deterministic narrative used instead.")
				.rationale(err.to_string()),
		);

		report = citation::resolve(&fallback_narrative(&sources), &registry);
		fallback_used = true;

		report.verify(&registry)?;
	}

	for token in &report.unknown_citations {
		state.audit(
			AuditEntry::new(ACTOR, "citation_unknown")
				.phase(Phase::Synthesis)
				.subject(token.clone())
				.output("Token removed from the report.")
				.rationale("The token does not match any citation minted for this run."),
		);
	}
	for citation_id in &report.uncited {
		let paper_id = registry.get(citation_id).map(|citation| citation.paper_id.clone());

		state.audit(
			AuditEntry::new(ACTOR, "citation_uncited")
				.phase(Phase::Synthesis)
				.subject(paper_id.unwrap_or_else(|| citation_id.to_string()))
				.output("Reference appended to the list.")
				.rationale("The included paper is not cited in the synthesized text.")
				.metrics(json!({ "citation_id": citation_id })),
		);
	}

	state.audit(
		AuditEntry::new(ACTOR, "synthesis_completed")
			.phase(Phase::Synthesis)
			.input(format!("{} included papers.", sources.len()))
			.output(format!("{} references.", report.references.len()))
			.metrics(json!({
				"path": path,
				"themes": themes.len(),
				"references": report.references.len(),
				"unknown_citations": report.unknown_citations.len(),
				"uncited": report.uncited.len(),
				"fallback_used": fallback_used,
			})),
	);
	tracing::info!(
		run_id = %ctx.run_id,
		sources = sources.len(),
		references = report.references.len(),
		"Synthesis finished."
	);

	state.synthesis = Some(SynthesisOutput { path, registry, themes, draft, report, fallback_used });

	Ok(())
}

async fn direct(
	ctx: &RunContext,
	providers: &Providers,
	state: &mut RunState,
	question: &ResearchQuestion,
	sources: &[Source],
) -> (String, bool) {
	let prompt = Prompt {
		label: "synthesis_direct",
		system: DIRECT_SYSTEM,
		user: json!({ "question": question.text, "sources": sources }).to_string(),
		schema: &NARRATIVE_SCHEMA,
	};
	let digest = prompt.fingerprint();

	match llm::call_structured::<NarrativeReply>(ctx, providers, &prompt).await {
		Ok(reply) if !reply.value.narrative.trim().is_empty() => {
			state.audit(
				AuditEntry::new(ACTOR, "synthesis_drafted")
					.phase(Phase::Synthesis)
					.input(format!("{} sources.", sources.len()))
					.output(format!("{} characters drafted.", reply.value.narrative.len()))
					.metrics(json!({ "model": reply.model, "prompt_digest": digest })),
			);

			(reply.value.narrative, false)
		},
		outcome => {
			let reason = match outcome {
				Err(err) => err.to_string(),
				Ok(_) => "The model returned an empty narrative.".to_string(),
			};

			state.audit(
				AuditEntry::new(ACTOR, "synthesis_fallback")
					.phase(Phase::Synthesis)
					.input(format!("{} sources.", sources.len()))
					.output("Deterministic source summary used as the narrative.")
					.rationale(reason)
					.metrics(json!({ "prompt_digest": digest })),
			);

			(fallback_narrative(sources), true)
		},
	}
}

async fn map_reduce(
	ctx: &Arc<RunContext>,
	providers: &Providers,
	state: &mut RunState,
	question: &ResearchQuestion,
	sources: &[Source],
) -> Result<(Vec<Theme>, String, bool), PhaseError> {
	let batch_size = (ctx.settings.synthesis.map_batch_size as usize).max(1);
	let question_text = Arc::new(question.text.clone());
	let pool = WorkPool::new(
		ctx.settings.runtime.max_concurrency,
		ctx.cancel.clone(),
		ctx.settings.runtime.abandon_inflight_on_cancel,
	);
	let units = sources
		.chunks(batch_size)
		.map(|batch| {
			let batch = batch.to_vec();
			let ctx = ctx.clone();
			let providers = providers.clone();
			let question_text = question_text.clone();

			async move { map_batch(&ctx, &providers, &question_text, &batch).await }
		})
		.collect();
	let run = pool.run_all(units).await;

	if run.cancelled {
		return Err(PhaseError::Cancelled);
	}

	let mut themes = Vec::new();
	let mut fallback_used = false;
	let mut covered: HashSet<Uuid> = HashSet::new();

	for (batch_no, outcome) in run.completed {
		let action = if outcome.fallback.is_some() { "map_fallback" } else { "map_completed" };

		fallback_used |= outcome.fallback.is_some();

		state.audit(
			AuditEntry::new(ACTOR, action)
				.phase(Phase::Synthesis)
				.subject(format!("batch-{}", batch_no + 1))
				.output(format!("{} themes.", outcome.themes.len()))
				.rationale(outcome.fallback.clone().unwrap_or_default())
				.metrics(json!({
					"themes": outcome.themes.len(),
					"dropped_citations": outcome.dropped,
					"model": outcome.model,
					"prompt_digest": outcome.digest,
				})),
		);

		for theme in &outcome.themes {
			covered.extend(theme.citations.iter().copied());
		}

		themes.extend(outcome.themes);
	}

	// A panicked batch still owes its sources a theme each.
	for (batch_no, panic) in run.panicked {
		fallback_used = true;

		state.audit(
			AuditEntry::new(ACTOR, "map_fallback")
				.phase(Phase::Synthesis)
				.subject(format!("batch-{}", batch_no + 1))
				.rationale(panic),
		);
	}

	themes.extend(
		sources
			.iter()
			.filter(|source| !covered.contains(&source.citation_id))
			.map(fallback_theme),
	);

	let themes = merge_themes(themes);
	let prompt = Prompt {
		label: "synthesis_reduce",
		system: REDUCE_SYSTEM,
		user: json!({ "question": question.text, "themes": themes_payload(&themes) }).to_string(),
		schema: &NARRATIVE_SCHEMA,
	};
	let digest = prompt.fingerprint();
	let draft = match llm::call_structured::<NarrativeReply>(ctx, providers, &prompt).await {
		Ok(reply) if !reply.value.narrative.trim().is_empty() => {
			state.audit(
				AuditEntry::new(ACTOR, "reduce_completed")
					.phase(Phase::Synthesis)
					.input(format!("{} themes.", themes.len()))
					.output(format!("{} characters drafted.", reply.value.narrative.len()))
					.metrics(json!({ "model": reply.model, "prompt_digest": digest })),
			);

			reply.value.narrative
		},
		outcome => {
			let reason = match outcome {
				Err(err) => err.to_string(),
				Ok(_) => "The model returned an empty narrative.".to_string(),
			};

			fallback_used = true;

			state.audit(
				AuditEntry::new(ACTOR, "reduce_fallback")
					.phase(Phase::Synthesis)
					.input(format!("{} themes.", themes.len()))
					.output("Themes rendered directly as the narrative.")
					.rationale(reason)
					.metrics(json!({ "prompt_digest": digest })),
			);

			render_themes(&themes)
		},
	};

	Ok((themes, draft, fallback_used))
}

async fn map_batch(
	ctx: &RunContext,
	providers: &Providers,
	question: &str,
	batch: &[Source],
) -> MapOutcome {
	let prompt = Prompt {
		label: "synthesis_map",
		system: MAP_SYSTEM,
		user: json!({ "question": question, "sources": batch }).to_string(),
		schema: &THEMES_SCHEMA,
	};
	let digest = prompt.fingerprint();

	match llm::call_structured::<ThemesReply>(ctx, providers, &prompt).await {
		Ok(reply) => {
			let allowed: HashMap<Uuid, &Source> =
				batch.iter().map(|source| (source.citation_id, source)).collect();
			let mut dropped = Vec::new();
			let mut themes = Vec::new();

			for theme in reply.value.themes {
				let mut citations = Vec::new();

				for raw in &theme.citations {
					match parse_token(raw).filter(|id| allowed.contains_key(id)) {
						Some(id) if !citations.contains(&id) => citations.push(id),
						Some(_) => {},
						None => dropped.push(raw.clone()),
					}
				}

				if citations.is_empty() || theme.title.trim().is_empty() {
					continue;
				}

				themes.push(Theme {
					title: theme.title.trim().to_string(),
					summary: theme.summary.trim().to_string(),
					citations,
				});
			}

			let covered: HashSet<Uuid> =
				themes.iter().flat_map(|theme| theme.citations.iter().copied()).collect();

			themes.extend(
				batch.iter().filter(|source| !covered.contains(&source.citation_id)).map(fallback_theme),
			);

			MapOutcome { themes, fallback: None, dropped, model: reply.model, digest }
		},
		Err(err) => MapOutcome {
			themes: batch.iter().map(fallback_theme).collect(),
			fallback: Some(err.to_string()),
			dropped: Vec::new(),
			model: ctx.model().to_string(),
			digest,
		},
	}
}

fn source(candidate: &Candidate, citation_id: Uuid) -> Source {
	let design = candidate.assessment(EVALUATOR_STUDY_DESIGN).and_then(|assessment| {
		match &assessment.findings {
			Findings::StudyDesign { design, .. } =>
				serde_json::to_value(design).ok().and_then(|v| v.as_str().map(str::to_string)),
			_ => None,
		}
	});
	let key_findings = candidate
		.assessment(EVALUATOR_EXTRACTION)
		.and_then(|assessment| match &assessment.findings {
			Findings::Extraction { key_findings, .. } => Some(key_findings.clone()),
			_ => None,
		})
		.unwrap_or_default();

	Source {
		citation: format!("[{citation_id}]"),
		title: candidate.title.clone(),
		year: candidate.metadata.year,
		study_type: candidate.study_type.label().to_string(),
		design,
		key_findings,
		abstract_text: candidate.abstract_text.clone(),
		citation_id,
	}
}

fn parse_token(raw: &str) -> Option<Uuid> {
	Uuid::parse_str(raw.trim().trim_start_matches('[').trim_end_matches(']').trim()).ok()
}

fn first_sentence(text: &str) -> &str {
	let text = text.trim();

	match text.find(". ") {
		Some(end) => &text[..=end],
		None => text,
	}
}

fn source_line(source: &Source) -> String {
	let finding = source
		.key_findings
		.first()
		.map(String::as_str)
		.unwrap_or_else(|| first_sentence(&source.abstract_text));
	let year = source.year.map(|year| format!(" ({year})")).unwrap_or_default();
	let finding = finding.trim().trim_end_matches('.');

	if finding.is_empty() {
		format!("{}{year} addresses the question {}.", source.title.trim(), source.citation)
	} else {
		format!("{}{year}: {finding} {}.", source.title.trim(), source.citation)
	}
}

fn fallback_narrative(sources: &[Source]) -> String {
	sources.iter().map(source_line).collect::<Vec<_>>().join("\n\n")
}

fn fallback_theme(source: &Source) -> Theme {
	Theme {
		title: source.title.trim().to_string(),
		summary: source_line(source),
		citations: vec![source.citation_id],
	}
}

/// Merges themes whose titles match case-insensitively, in first-seen order.
fn merge_themes(themes: Vec<Theme>) -> Vec<Theme> {
	let mut out: Vec<Theme> = Vec::new();

	for theme in themes {
		match out.iter_mut().find(|existing| existing.title.eq_ignore_ascii_case(&theme.title)) {
			Some(existing) => {
				if !theme.summary.is_empty() && !existing.summary.contains(&theme.summary) {
					existing.summary.push(' ');
					existing.summary.push_str(&theme.summary);
				}

				for id in theme.citations {
					if !existing.citations.contains(&id) {
						existing.citations.push(id);
					}
				}
			},
			None => out.push(theme),
		}
	}

	out
}

fn themes_payload(themes: &[Theme]) -> Vec<Value> {
	themes
		.iter()
		.map(|theme| {
			json!({
				"title": theme.title,
				"summary": theme.summary,
				"citations": theme.citations.iter().map(|id| format!("[{id}]")).collect::<Vec<_>>(),
			})
		})
		.collect()
}

fn render_themes(themes: &[Theme]) -> String {
	themes
		.iter()
		.map(|theme| {
			let missing: Vec<String> = theme
				.citations
				.iter()
				.map(Uuid::to_string)
				.filter(|id| !theme.summary.contains(id.as_str()))
				.collect();

			if missing.is_empty() {
				format!("**{}.** {}", theme.title, theme.summary)
			} else {
				format!("**{}.** {} [{}]", theme.title, theme.summary, missing.join(", "))
			}
		})
		.collect::<Vec<_>>()
		.join("\n\n")
}
