//! Per-node annotation generation.
//!
//! The [`Summarizer`] trait is the seam to the external language model; the
//! pipeline in `mls-core` only ever talks to it. [`GeminiSummarizer`] is the
//! production implementation, and [`with_retry`] wraps any call in
//! exponential backoff for retryable failures.

pub mod gemini;
pub mod prompt;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use mls_shared::{Result, Span};

pub use gemini::GeminiSummarizer;
pub use prompt::build_prompt;
pub use retry::{RetryPolicy, with_retry};

/// Everything the summarizer is told about one outline node.
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    /// Node key (`section-1.2`).
    pub node_id: String,
    pub title: String,
    pub span: Span,
    /// Resolved excerpt, when the outline was resolved against the root text.
    pub excerpt: Option<String>,
    pub parent_id: Option<String>,
    pub parent_title: Option<String>,
    /// Full commentary text, shared across requests.
    pub commentary: Arc<str>,
    /// The whole outline (excerpts stripped) as pretty JSON, shared across
    /// requests.
    pub outline_json: Arc<str>,
}

/// Produces an opaque annotation object for one node.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Identifier of the model behind this summarizer, recorded in artifacts.
    fn model(&self) -> &str;

    /// Generate the annotation for `request`.
    ///
    /// Errors are `MlsError::ExternalCall`; `retryable` tells the caller
    /// whether another attempt could succeed.
    async fn summarize(&self, request: &SummaryRequest) -> Result<Value>;
}
