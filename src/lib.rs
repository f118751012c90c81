//! Multi-hop research engine.
//!
//! Answers complex natural-language questions by decomposing them into
//! facets (aspects), retrieving passages for one focused sub-query per
//! hop, tracking per-aspect coverage, and synthesizing a cited answer
//! once the core facets are covered or the hop budget runs out.
//!
//! The engine owns no I/O of its own: retrieval and text generation
//! arrive through the [`Retriever`] and [`LlmClient`] traits. The LLM is
//! optional everywhere: without one, extraction, planning, and synthesis
//! all run on deterministic heuristics.
//!
//! ```no_run
//! use std::sync::Arc;
//! use magellan::{HttpLlmClient, ResearchEngine, Retriever, RunOptions};
//!
//! # async fn example(retriever: Arc<dyn Retriever>) -> anyhow::Result<()> {
//! let llm = Arc::new(HttpLlmClient::from_env()?);
//! let engine = ResearchEngine::new(retriever, llm);
//! let result = engine
//!     .run("Compare self-attention vs multi-head attention", &RunOptions::default())
//!     .await?;
//! println!("{}", result.answer);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod llm;
pub mod research;
pub mod retriever;

pub use error::ResearchError;
pub use llm::{GenerateOptions, HttpLlmClient, LlmClient, Message};
pub use research::aspect::{Aspect, AspectType};
pub use research::coverage::{AspectCoverage, AspectSnapshot};
pub use research::stopping::StopReason;
pub use research::synthesis::Citation;
pub use research::{
    HopRecord, Mode, ResearchEngine, ResearchResult, RunMetadata, RunOptions,
};
pub use retriever::{Passage, Retriever};
