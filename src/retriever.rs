use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A retrieved text chunk with provenance and a similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    /// Stable identifier within the retriever.
    pub id: String,
    /// Body text used for coverage matching and citation snippets.
    pub text: String,
    pub title: String,
    pub filename: String,
    /// Similarity score in [0, 1], higher is better.
    pub score: f64,
    /// Opaque retriever-specific fields, passed through untouched.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Passage {
    pub fn new(id: impl Into<String>, text: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            title: String::new(),
            filename: String::new(),
            score,
            metadata: HashMap::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }
}

/// Passage source scoped to the caller's corpus.
///
/// Scoping to a user is the host's responsibility; the engine never passes
/// identity. Implementations must return `Ok(vec![])` on "no results" and
/// reserve `Err` for real failures; the engine treats a failure as a
/// zero-passage hop and keeps going.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: usize) -> anyhow::Result<Vec<Passage>>;
}
