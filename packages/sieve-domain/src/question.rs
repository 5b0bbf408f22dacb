use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pico {
	pub population: String,
	pub intervention: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub comparison: Option<String>,
	pub outcome: String,
}
impl Pico {
	/// Non-blank PICO elements in P, I, C, O order.
	pub fn terms(&self) -> Vec<&str> {
		[
			Some(self.population.as_str()),
			Some(self.intervention.as_str()),
			self.comparison.as_deref(),
			Some(self.outcome.as_str()),
		]
		.into_iter()
		.flatten()
		.map(str::trim)
		.filter(|term| !term.is_empty())
		.collect()
	}
}

/// The question under review. Immutable once a run has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchQuestion {
	pub text: String,
	pub pico: Pico,
	#[serde(default)]
	pub inclusion_criteria: Vec<String>,
	#[serde(default)]
	pub exclusion_criteria: Vec<String>,
}
impl ResearchQuestion {
	pub fn validate(&self) -> Result<()> {
		if self.text.trim().is_empty() {
			return Err(Error::InvalidQuestion {
				message: "question text must be non-empty.".to_string(),
			});
		}
		if self.pico.terms().is_empty() {
			return Err(Error::InvalidQuestion {
				message: "at least one PICO element must be non-empty.".to_string(),
			});
		}
		if self.exclusion_criteria.iter().any(|criterion| criterion.trim().is_empty()) {
			return Err(Error::InvalidQuestion {
				message: "exclusion criteria must not contain blank entries.".to_string(),
			});
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn question() -> ResearchQuestion {
		ResearchQuestion {
			text: "Does metformin reduce cancer incidence in adults with type 2 diabetes?".to_string(),
			pico: Pico {
				population: "adults with type 2 diabetes".to_string(),
				intervention: "metformin".to_string(),
				comparison: None,
				outcome: " cancer incidence ".to_string(),
			},
			inclusion_criteria: vec!["human studies".to_string()],
			exclusion_criteria: vec!["case reports".to_string()],
		}
	}

	#[test]
	fn pico_terms_skip_missing_comparison_and_trim() {
		assert_eq!(
			question().pico.terms(),
			vec!["adults with type 2 diabetes", "metformin", "cancer incidence"]
		);
	}

	#[test]
	fn blank_question_is_rejected() {
		let mut question = question();

		question.text = "  ".to_string();

		assert!(matches!(question.validate(), Err(Error::InvalidQuestion { .. })));
	}
}
