use std::sync::{Arc, LazyLock};

use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::{
	BoxFuture, CollaboratorError, Providers, RunContext,
	llm::{self, Prompt},
	quality::{Assessed, Evaluator, EvaluatorFailure},
};
use sieve_config::EvaluatorRule;
use sieve_domain::{
	candidate::{BiasDomainRating, Candidate, ChecklistItem, Confidence, Findings},
	composite::{
		EVALUATOR_COMPLIANCE, EVALUATOR_EXTRACTION, EVALUATOR_RISK_OF_BIAS, EVALUATOR_STUDY_DESIGN,
	},
	question::Pico,
	study::{RiskOfBias, StudyDesign},
};

const STUDY_DESIGN_SYSTEM: &str = "\
Classify the study design of the paper. Use one of: meta_analysis, systematic_review, \
randomized_trial, non_randomized_trial, cohort, case_control, cross_sectional, qualitative, \
case_series, case_report, narrative, other. Justify the classification in one or two sentences \
and state your confidence as high, medium, or low.";
const RISK_OF_BIAS_SYSTEM: &str = "\
Assess risk of bias for the paper using the domains appropriate to its design (for trials: \
randomization, deviations from intended interventions, missing outcome data, outcome measurement, \
selection of reported results). Rate each domain low, some_concerns, high, or unclear, give an \
overall judgement on the same scale, and state your confidence as high, medium, or low.";
const EXTRACTION_SYSTEM: &str = "\
Extract the study's population, intervention, comparison, and outcome, the total sample size as \
an integer when reported, and up to five key findings quoted or closely paraphrased from the \
abstract. Use null for anything not reported. State your confidence as high, medium, or low.";
const COMPLIANCE_SYSTEM: &str = "\
Check the review against the PRISMA 2020 reporting checklist items that can be judged from the \
title and abstract. Report each item with whether it is satisfied, and state your confidence as \
high, medium, or low.";
const COMPLIANCE_CHECKLIST: &str = "PRISMA 2020";

static STUDY_DESIGN_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
	json!({
		"type": "object",
		"properties": {
			"design": { "type": "string" },
			"rationale": { "type": "string" },
			"confidence": { "type": "string", "enum": ["high", "medium", "low"] }
		},
		"required": ["design", "rationale", "confidence"]
	})
});
static RISK_OF_BIAS_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
	json!({
		"type": "object",
		"properties": {
			"domains": {
				"type": "array",
				"items": {
					"type": "object",
					"properties": {
						"domain": { "type": "string" },
						"rating": { "type": "string" },
						"note": { "type": "string" }
					},
					"required": ["domain", "rating"]
				}
			},
			"overall": { "type": "string" },
			"confidence": { "type": "string", "enum": ["high", "medium", "low"] }
		},
		"required": ["domains", "overall", "confidence"]
	})
});
static EXTRACTION_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
	json!({
		"type": "object",
		"properties": {
			"population": { "type": ["string", "null"] },
			"intervention": { "type": ["string", "null"] },
			"comparison": { "type": ["string", "null"] },
			"outcome": { "type": ["string", "null"] },
			"sample_size": { "type": ["integer", "null"] },
			"key_findings": { "type": "array", "items": { "type": "string" } },
			"confidence": { "type": "string", "enum": ["high", "medium", "low"] }
		},
		"required": ["key_findings", "confidence"]
	})
});
static COMPLIANCE_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
	json!({
		"type": "object",
		"properties": {
			"items": {
				"type": "array",
				"items": {
					"type": "object",
					"properties": {
						"item": { "type": "string" },
						"satisfied": { "type": "boolean" }
					},
					"required": ["item", "satisfied"]
				}
			},
			"confidence": { "type": "string", "enum": ["high", "medium", "low"] }
		},
		"required": ["items", "confidence"]
	})
});

#[derive(Debug, Deserialize)]
struct StudyDesignReply {
	design: String,
	#[serde(default)]
	rationale: String,
	confidence: String,
}

#[derive(Debug, Deserialize)]
struct RiskOfBiasReply {
	domains: Vec<DomainReply>,
	overall: String,
	confidence: String,
}

#[derive(Debug, Deserialize)]
struct DomainReply {
	domain: String,
	rating: String,
	#[serde(default)]
	note: String,
}

#[derive(Debug, Deserialize)]
struct ExtractionReply {
	#[serde(default)]
	population: Option<String>,
	#[serde(default)]
	intervention: Option<String>,
	#[serde(default)]
	comparison: Option<String>,
	#[serde(default)]
	outcome: Option<String>,
	#[serde(default)]
	sample_size: Option<f64>,
	#[serde(default)]
	key_findings: Vec<String>,
	confidence: String,
}

#[derive(Debug, Deserialize)]
struct ComplianceReply {
	items: Vec<ChecklistItem>,
	confidence: String,
}

/// Builds the evaluator a configuration rule names. Unknown names were rejected at load time.
pub fn for_rule(rule: EvaluatorRule) -> Option<Arc<dyn Evaluator>> {
	let evaluator: Arc<dyn Evaluator> = match rule.name.as_str() {
		EVALUATOR_STUDY_DESIGN => Arc::new(StudyDesignEvaluator { rule }),
		EVALUATOR_RISK_OF_BIAS => Arc::new(RiskOfBiasEvaluator { rule }),
		EVALUATOR_EXTRACTION => Arc::new(ExtractionEvaluator { rule }),
		EVALUATOR_COMPLIANCE => Arc::new(ComplianceEvaluator { rule }),
		_ => return None,
	};

	Some(evaluator)
}

pub struct StudyDesignEvaluator {
	rule: EvaluatorRule,
}
impl Evaluator for StudyDesignEvaluator {
	fn name(&self) -> &'static str {
		EVALUATOR_STUDY_DESIGN
	}

	fn suitable(&self, candidate: &Candidate) -> bool {
		self.rule.admits(candidate.study_type.label())
	}

	fn assess<'a>(
		&'a self,
		ctx: &'a RunContext,
		providers: &'a Providers,
		candidate: &'a Candidate,
	) -> BoxFuture<'a, Result<Assessed, EvaluatorFailure>> {
		Box::pin(async move {
			let reply = ask::<StudyDesignReply>(
				ctx,
				providers,
				self.name(),
				STUDY_DESIGN_SYSTEM,
				&STUDY_DESIGN_SCHEMA,
				candidate,
			)
			.await?;
			let design = StudyDesign::parse(&reply.value.design).ok_or_else(|| {
				reply.malformed(format!("Unrecognized study design {:?}.", reply.value.design))
			})?;

			Ok(reply.finish(
				Findings::StudyDesign { design, rationale: reply.value.rationale.clone() },
				&reply.value.confidence,
			))
		})
	}
}

pub struct RiskOfBiasEvaluator {
	rule: EvaluatorRule,
}
impl Evaluator for RiskOfBiasEvaluator {
	fn name(&self) -> &'static str {
		EVALUATOR_RISK_OF_BIAS
	}

	fn suitable(&self, candidate: &Candidate) -> bool {
		self.rule.admits(candidate.study_type.label())
	}

	fn assess<'a>(
		&'a self,
		ctx: &'a RunContext,
		providers: &'a Providers,
		candidate: &'a Candidate,
	) -> BoxFuture<'a, Result<Assessed, EvaluatorFailure>> {
		Box::pin(async move {
			let reply = ask::<RiskOfBiasReply>(
				ctx,
				providers,
				self.name(),
				RISK_OF_BIAS_SYSTEM,
				&RISK_OF_BIAS_SCHEMA,
				candidate,
			)
			.await?;
			let overall = RiskOfBias::parse(&reply.value.overall).ok_or_else(|| {
				reply.malformed(format!("Unrecognized overall rating {:?}.", reply.value.overall))
			})?;
			let mut domains = Vec::with_capacity(reply.value.domains.len());

			for domain in &reply.value.domains {
				let rating = RiskOfBias::parse(&domain.rating).ok_or_else(|| {
					reply.malformed(format!(
						"Unrecognized rating {:?} for domain {}.",
						domain.rating, domain.domain
					))
				})?;

				domains.push(BiasDomainRating {
					domain: domain.domain.trim().to_string(),
					rating,
					note: domain.note.trim().to_string(),
				});
			}

			Ok(reply.finish(Findings::RiskOfBias { domains, overall }, &reply.value.confidence))
		})
	}
}

pub struct ExtractionEvaluator {
	rule: EvaluatorRule,
}
impl Evaluator for ExtractionEvaluator {
	fn name(&self) -> &'static str {
		EVALUATOR_EXTRACTION
	}

	fn suitable(&self, candidate: &Candidate) -> bool {
		self.rule.admits(candidate.study_type.label())
	}

	fn assess<'a>(
		&'a self,
		ctx: &'a RunContext,
		providers: &'a Providers,
		candidate: &'a Candidate,
	) -> BoxFuture<'a, Result<Assessed, EvaluatorFailure>> {
		Box::pin(async move {
			let reply = ask::<ExtractionReply>(
				ctx,
				providers,
				self.name(),
				EXTRACTION_SYSTEM,
				&EXTRACTION_SCHEMA,
				candidate,
			)
			.await?;
			let value = &reply.value;
			let text = |field: &Option<String>| {
				field.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
			};
			let sample_size = value
				.sample_size
				.filter(|n| n.is_finite() && *n >= 1.0 && *n <= f64::from(u32::MAX))
				.map(|n| n.round() as u32);
			let findings = Findings::Extraction {
				pico: Pico {
					population: text(&value.population).unwrap_or_default(),
					intervention: text(&value.intervention).unwrap_or_default(),
					comparison: text(&value.comparison),
					outcome: text(&value.outcome).unwrap_or_default(),
				},
				sample_size,
				key_findings: value
					.key_findings
					.iter()
					.map(|finding| finding.trim().to_string())
					.filter(|finding| !finding.is_empty())
					.collect(),
			};

			Ok(reply.finish(findings, &value.confidence))
		})
	}
}

pub struct ComplianceEvaluator {
	rule: EvaluatorRule,
}
impl Evaluator for ComplianceEvaluator {
	fn name(&self) -> &'static str {
		EVALUATOR_COMPLIANCE
	}

	fn suitable(&self, candidate: &Candidate) -> bool {
		self.rule.admits(candidate.study_type.label())
	}

	fn assess<'a>(
		&'a self,
		ctx: &'a RunContext,
		providers: &'a Providers,
		candidate: &'a Candidate,
	) -> BoxFuture<'a, Result<Assessed, EvaluatorFailure>> {
		Box::pin(async move {
			let reply = ask::<ComplianceReply>(
				ctx,
				providers,
				self.name(),
				COMPLIANCE_SYSTEM,
				&COMPLIANCE_SCHEMA,
				candidate,
			)
			.await?;

			if reply.value.items.is_empty() {
				return Err(reply.malformed("Compliance reply lists no checklist items."));
			}

			let findings = Findings::Compliance {
				checklist: COMPLIANCE_CHECKLIST.to_string(),
				items: reply.value.items.clone(),
			};

			Ok(reply.finish(findings, &reply.value.confidence))
		})
	}
}

struct Reply<T> {
	value: T,
	model: String,
	prompt_digest: String,
}
impl<T> Reply<T> {
	fn malformed(&self, message: impl Into<String>) -> EvaluatorFailure {
		EvaluatorFailure {
			error: CollaboratorError::malformed(message),
			prompt_digest: self.prompt_digest.clone(),
		}
	}

	fn finish(&self, findings: Findings, confidence: &str) -> Assessed {
		Assessed {
			findings,
			confidence: Confidence::parse(confidence).unwrap_or(Confidence::Low),
			model: self.model.clone(),
			prompt_digest: self.prompt_digest.clone(),
		}
	}
}

async fn ask<T>(
	ctx: &RunContext,
	providers: &Providers,
	label: &str,
	system: &str,
	schema: &Value,
	candidate: &Candidate,
) -> Result<Reply<T>, EvaluatorFailure>
where
	T: DeserializeOwned,
{
	let prompt = Prompt { label, system, user: paper_payload(candidate), schema };
	let prompt_digest = prompt.fingerprint();

	match llm::call_structured::<T>(ctx, providers, &prompt).await {
		Ok(structured) => Ok(Reply { value: structured.value, model: structured.model, prompt_digest }),
		Err(error) => Err(EvaluatorFailure { error, prompt_digest }),
	}
}

fn paper_payload(candidate: &Candidate) -> String {
	json!({
		"paper_id": candidate.paper_id,
		"title": candidate.title,
		"abstract": candidate.abstract_text,
		"year": candidate.metadata.year,
		"journal": candidate.metadata.journal,
		"publication_types": candidate.metadata.publication_types,
		"study_type_hint": candidate.study_type.label(),
	})
	.to_string()
}
