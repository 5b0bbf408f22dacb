pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid composite weights: {message}")]
	InvalidWeights { message: String },
	#[error("Invalid threshold: {message}")]
	InvalidThreshold { message: String },
	#[error("Invalid research question: {message}")]
	InvalidQuestion { message: String },
	#[error(transparent)]
	InvalidPattern(#[from] regex::Error),
	#[error("Annotation conflict on {paper_id}: {message}")]
	AnnotationConflict { paper_id: String, message: String },
	#[error("Citation {citation} {message}")]
	UnknownCitation { citation: String, message: String },
	#[error("Exclusion of {paper_id} requires a non-empty rationale.")]
	EmptyRationale { paper_id: String },
}
