//! Resumable per-node annotation generation.
//!
//! Walks the outline in document order and asks the summarizer for one
//! annotation per node. Nodes whose artifact already exists are skipped, so
//! an interrupted run picks up where it stopped. A node that keeps failing
//! is recorded in the report and the batch moves on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, instrument, warn};

use mls_outline::{RenderOptions, index_keys, render_outline};
use mls_shared::{
    GenerationConfig, MlsError, NodeArtifact, NoteKind, Outline, OutlineNode, ProcessingNote,
    Result,
};
use mls_storage::AnnotationStore;
use mls_summarizer::{RetryPolicy, SummaryRequest, Summarizer, with_retry};

/// Configuration for [`generate_annotations`].
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    /// Maximum summarizer calls in flight.
    pub concurrency: usize,
    /// Delay after each generated annotation.
    pub pacing: Duration,
    pub retry: RetryPolicy,
}

impl From<&GenerationConfig> for GenerateConfig {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            pacing: Duration::from_millis(config.pacing_ms),
            retry: RetryPolicy::from(config),
        }
    }
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

/// What happened to one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Generated,
    /// An artifact already existed.
    Skipped,
    Failed,
}

/// Result of [`generate_annotations`].
#[derive(Debug, Clone, Default)]
pub struct GenerateReport {
    pub total: usize,
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// `external_call_failure` and `stale_annotation` notes, in document order.
    pub notes: Vec<ProcessingNote>,
    pub elapsed: Duration,
}

/// Progress callback for generation.
pub trait GenerateProgress: Send + Sync {
    /// Called when a node is finished, in completion order.
    fn node_done(&self, node_id: &str, outcome: NodeOutcome, completed: usize, total: usize);
    /// Called once when the run completes.
    fn done(&self, report: &GenerateReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl GenerateProgress for SilentProgress {
    fn node_done(&self, _node_id: &str, _outcome: NodeOutcome, _completed: usize, _total: usize) {}
    fn done(&self, _report: &GenerateReport) {}
}

/// SHA-256 of an excerpt, recorded in artifacts to detect stale annotations.
pub fn excerpt_fingerprint(excerpt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(excerpt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One unit of work: a node plus its position and parent context.
struct Job {
    index: usize,
    request: SummaryRequest,
}

struct JobResult {
    index: usize,
    node_id: String,
    outcome: NodeOutcome,
    note: Option<ProcessingNote>,
}

/// Generate and store an annotation for every node of `outline`.
///
/// Excerpts on the outline (from a prior resolve step) are passed to the
/// summarizer and fingerprinted into the artifact. Summarizer failures
/// become `external_call_failure` notes; storage failures abort the run.
#[instrument(skip_all, fields(nodes = outline.node_count(), concurrency = config.concurrency))]
pub async fn generate_annotations(
    config: &GenerateConfig,
    outline: &Outline,
    commentary: &str,
    summarizer: &dyn Summarizer,
    store: &dyn AnnotationStore,
    progress: &dyn GenerateProgress,
) -> Result<GenerateReport> {
    let start = Instant::now();
    let keys = index_keys(&outline.nodes)?;
    store.check_keys(&keys)?;

    let context = render_outline(
        outline,
        None,
        &RenderOptions {
            include_excerpts: false,
            ..RenderOptions::default()
        },
    );
    let outline_json: Arc<str> = serde_json::to_string_pretty(&context)
        .map_err(|e| MlsError::validation(format!("JSON serialization failed: {e}")))?
        .into();
    let commentary: Arc<str> = Arc::from(commentary);

    let mut jobs = Vec::with_capacity(outline.node_count());
    collect_jobs(&outline.nodes, None, &commentary, &outline_json, &mut jobs);
    let total = jobs.len();

    info!(total, model = summarizer.model(), "starting annotation generation");

    let mut report = GenerateReport {
        total,
        ..Default::default()
    };
    let mut results: Vec<JobResult> = Vec::with_capacity(total);

    let mut stream = futures::stream::iter(jobs)
        .map(|job| process_node(job, config, summarizer, store))
        .buffer_unordered(config.concurrency.max(1));

    while let Some(result) = stream.next().await {
        let result = result?;
        match result.outcome {
            NodeOutcome::Generated => report.generated += 1,
            NodeOutcome::Skipped => report.skipped += 1,
            NodeOutcome::Failed => report.failed += 1,
        }
        progress.node_done(&result.node_id, result.outcome, results.len() + 1, total);
        results.push(result);
    }

    results.sort_by_key(|r| r.index);
    report.notes = results.into_iter().filter_map(|r| r.note).collect();
    report.elapsed = start.elapsed();

    info!(
        generated = report.generated,
        skipped = report.skipped,
        failed = report.failed,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "annotation generation complete"
    );
    progress.done(&report);

    Ok(report)
}

/// Flatten the tree into jobs in document (pre-)order.
fn collect_jobs(
    nodes: &[OutlineNode],
    parent: Option<&OutlineNode>,
    commentary: &Arc<str>,
    outline_json: &Arc<str>,
    jobs: &mut Vec<Job>,
) {
    for node in nodes {
        jobs.push(Job {
            index: jobs.len(),
            request: SummaryRequest {
                node_id: node.key(),
                title: node.title.clone(),
                span: node.span,
                excerpt: node.text_excerpt.clone(),
                parent_id: parent.map(OutlineNode::key),
                parent_title: parent.map(|p| p.title.clone()),
                commentary: Arc::clone(commentary),
                outline_json: Arc::clone(outline_json),
            },
        });
        collect_jobs(&node.children, Some(node), commentary, outline_json, jobs);
    }
}

async fn process_node(
    job: Job,
    config: &GenerateConfig,
    summarizer: &dyn Summarizer,
    store: &dyn AnnotationStore,
) -> Result<JobResult> {
    let Job { index, request } = job;
    let node_id = request.node_id.clone();
    let fingerprint = request.excerpt.as_deref().map(excerpt_fingerprint);

    if let Some(existing) = store.get(&node_id).await? {
        debug!(node = %node_id, "artifact exists, skipping");
        let note = match (existing.excerpt_sha256.as_deref(), fingerprint.as_deref()) {
            (Some(stored), Some(current)) if stored != current => {
                warn!(node = %node_id, "existing annotation was generated from a different excerpt");
                Some(ProcessingNote::new(
                    &node_id,
                    NoteKind::StaleAnnotation,
                    "existing annotation was generated from a different excerpt",
                ))
            }
            _ => None,
        };
        return Ok(JobResult {
            index,
            node_id,
            outcome: NodeOutcome::Skipped,
            note,
        });
    }

    let annotation = match with_retry(&config.retry, &node_id, || summarizer.summarize(&request)).await {
        Ok(annotation) => annotation,
        Err(e) => {
            error!(node = %node_id, error = %e, "annotation generation failed");
            return Ok(JobResult {
                index,
                note: Some(ProcessingNote::new(
                    &node_id,
                    NoteKind::ExternalCallFailure,
                    e.to_string(),
                )),
                node_id,
                outcome: NodeOutcome::Failed,
            });
        }
    };

    let artifact = NodeArtifact {
        node_id: node_id.clone(),
        annotation,
        model: Some(summarizer.model().to_string()),
        excerpt_sha256: fingerprint,
        generated_at: Utc::now(),
    };
    let written = store.put(&node_id, &artifact).await?;
    if !written {
        debug!(node = %node_id, "artifact appeared concurrently, keeping existing");
    }

    if !config.pacing.is_zero() {
        tokio::time::sleep(config.pacing).await;
    }

    Ok(JobResult {
        index,
        node_id,
        outcome: if written {
            NodeOutcome::Generated
        } else {
            NodeOutcome::Skipped
        },
        note: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use mls_outline::{ParseOptions, parse_outline};
    use mls_shared::Span;
    use mls_storage::FsAnnotationStore;
    use serde_json::{Value, json};
    use uuid::Uuid;

    /// Summarizer double that records calls and fails on demand.
    #[derive(Default)]
    struct ScriptedSummarizer {
        calls: Mutex<Vec<String>>,
        /// node id -> number of transient failures before success
        transient: Mutex<HashMap<String, u32>>,
        /// node ids that always fail permanently
        broken: Vec<String>,
    }

    impl ScriptedSummarizer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Summarizer for ScriptedSummarizer {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn summarize(&self, request: &SummaryRequest) -> Result<Value> {
            self.calls.lock().unwrap().push(request.node_id.clone());
            if self.broken.contains(&request.node_id) {
                return Err(MlsError::external("400 bad request"));
            }
            if let Some(left) = self.transient.lock().unwrap().get_mut(&request.node_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(MlsError::transient("429 rate limited"));
                }
            }
            Ok(json!({
                "content_summary": format!("summary of {}", request.node_id),
                "parent": request.parent_id,
            }))
        }
    }

    fn fixture_outline() -> Outline {
        let text = std::fs::read_to_string("../../../fixtures/json/outline.fixture.json")
            .expect("read outline fixture");
        parse_outline(&text, &ParseOptions::default()).expect("parse fixture")
    }

    fn test_store() -> FsAnnotationStore {
        let dir = std::env::temp_dir().join(format!("mls-pipeline-test-{}", Uuid::now_v7()));
        FsAnnotationStore::open(dir).expect("open store")
    }

    fn cleanup(store: &FsAnnotationStore) {
        let _ = std::fs::remove_dir_all(store.dir());
    }

    fn fast_config(concurrency: usize) -> GenerateConfig {
        GenerateConfig {
            concurrency,
            pacing: Duration::ZERO,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        }
    }

    const DOCUMENT_ORDER: [&str; 7] = [
        "chapter-1",
        "section-1.1",
        "subsection-1.1.1",
        "subsection-1.1.2",
        "section-1.2",
        "subsection-1.2.1",
        "subsection-1.2.2",
    ];

    #[tokio::test]
    async fn generates_every_node_in_document_order() {
        let summarizer = ScriptedSummarizer::default();
        let store = test_store();

        let report = generate_annotations(
            &fast_config(1),
            &fixture_outline(),
            "commentary",
            &summarizer,
            &store,
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(report.total, 7);
        assert_eq!(report.generated, 7);
        assert!(report.notes.is_empty());
        assert_eq!(summarizer.calls(), DOCUMENT_ORDER);

        let artifact = store.get("section-1.1").await.unwrap().unwrap();
        assert_eq!(artifact.model.as_deref(), Some("scripted"));
        assert_eq!(artifact.annotation["parent"], "chapter-1");

        cleanup(&store);
    }

    #[tokio::test]
    async fn resumes_by_skipping_existing_artifacts() {
        let store = test_store();
        let first = ScriptedSummarizer {
            broken: vec!["section-1.2".into()],
            ..Default::default()
        };
        let report = generate_annotations(
            &fast_config(1),
            &fixture_outline(),
            "",
            &first,
            &store,
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(report.generated, 6);
        assert_eq!(report.failed, 1);

        let second = ScriptedSummarizer::default();
        let report = generate_annotations(
            &fast_config(1),
            &fixture_outline(),
            "",
            &second,
            &store,
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(report.skipped, 6);
        assert_eq!(report.generated, 1);
        assert_eq!(second.calls(), ["section-1.2"]);

        cleanup(&store);
    }

    #[tokio::test]
    async fn permanent_failure_is_noted_and_not_retried() {
        let summarizer = ScriptedSummarizer {
            broken: vec!["subsection-1.1.2".into()],
            ..Default::default()
        };
        let store = test_store();

        let report = generate_annotations(
            &fast_config(1),
            &fixture_outline(),
            "",
            &summarizer,
            &store,
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.generated, 6);
        assert_eq!(report.notes.len(), 1);
        assert_eq!(report.notes[0].node, "subsection-1.1.2");
        assert_eq!(report.notes[0].kind, NoteKind::ExternalCallFailure);
        assert_eq!(
            summarizer.calls().iter().filter(|c| *c == "subsection-1.1.2").count(),
            1
        );
        assert!(!store.has("subsection-1.1.2").await.unwrap());

        cleanup(&store);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let summarizer = ScriptedSummarizer {
            transient: Mutex::new(HashMap::from([("chapter-1".to_string(), 2)])),
            ..Default::default()
        };
        let store = test_store();

        let report = generate_annotations(
            &fast_config(1),
            &fixture_outline(),
            "",
            &summarizer,
            &store,
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(report.generated, 7);
        assert_eq!(
            summarizer.calls().iter().filter(|c| *c == "chapter-1").count(),
            3
        );

        cleanup(&store);
    }

    #[tokio::test]
    async fn bounded_concurrency_covers_every_node() {
        let summarizer = ScriptedSummarizer {
            broken: vec!["subsection-1.2.2".into(), "section-1.1".into()],
            ..Default::default()
        };
        let store = test_store();

        let report = generate_annotations(
            &fast_config(4),
            &fixture_outline(),
            "",
            &summarizer,
            &store,
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(report.generated, 5);
        assert_eq!(report.failed, 2);
        let noted: Vec<_> = report.notes.iter().map(|n| n.node.as_str()).collect();
        assert_eq!(noted, ["section-1.1", "subsection-1.2.2"]);

        cleanup(&store);
    }

    #[tokio::test]
    async fn changed_excerpt_marks_existing_artifact_stale() {
        let store = test_store();
        store
            .put(
                "subsection-1.1.1",
                &NodeArtifact {
                    node_id: "subsection-1.1.1".into(),
                    annotation: json!({}),
                    model: None,
                    excerpt_sha256: Some(excerpt_fingerprint("an older excerpt")),
                    generated_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let report = generate_annotations(
            &fast_config(1),
            &fixture_outline(),
            "",
            &ScriptedSummarizer::default(),
            &store,
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.notes.len(), 1);
        assert_eq!(report.notes[0].kind, NoteKind::StaleAnnotation);

        cleanup(&store);
    }

    #[tokio::test]
    async fn duplicate_keys_fail_before_any_call() {
        let outline = Outline {
            granularity: Default::default(),
            nodes: vec![
                OutlineNode::new("chapter-1", "A", Span::new(1, 1)),
                OutlineNode::new("chapter-1", "B", Span::new(2, 2)),
            ],
        };
        let summarizer = ScriptedSummarizer::default();
        let store = test_store();

        let err = generate_annotations(
            &fast_config(1),
            &outline,
            "",
            &summarizer,
            &store,
            &SilentProgress,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MlsError::DuplicateKey { .. }));
        assert!(summarizer.calls().is_empty());

        cleanup(&store);
    }

    #[tokio::test]
    async fn colliding_artifact_names_fail_before_any_call() {
        let outline = Outline {
            granularity: Default::default(),
            nodes: vec![
                OutlineNode::new("section-1.2", "A", Span::new(1, 1)),
                OutlineNode::new("section-1-2", "B", Span::new(2, 2)),
            ],
        };
        let summarizer = ScriptedSummarizer::default();
        let store = test_store();

        let err = generate_annotations(
            &fast_config(1),
            &outline,
            "",
            &summarizer,
            &store,
            &SilentProgress,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MlsError::DuplicateKey { .. }));
        assert!(summarizer.calls().is_empty());

        cleanup(&store);
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let a = excerpt_fingerprint("root verse 1");
        assert_eq!(a.len(), 64);
        assert_eq!(a, excerpt_fingerprint("root verse 1"));
        assert_ne!(a, excerpt_fingerprint("root verse 2"));
    }
}
