/// Errors surfaced by the research engine.
///
/// Dependency failures (retriever, LLM) are absorbed inside the loop and
/// recorded in result metadata; they never appear here. Only bad input and
/// genuine programming errors reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("invalid question: {reason}")]
    InvalidQuestion { reason: String },

    #[error("invalid options: {reason}")]
    InvalidOptions { reason: String },

    /// Both the LLM path and every fallback failed before a single hop ran.
    #[error("no dependency available to make progress: {reason}")]
    DependencyUnavailable { reason: String },

    #[error("internal invariant violated: {details}")]
    Invariant { details: String },
}

pub type Result<T> = std::result::Result<T, ResearchError>;
