//! Excerpt resolution: attach root text to every node of the outline.

use tracing::{debug, info, instrument};

use mls_shared::{
    GapPolicy, MlsError, NoteKind, OutlineNode, ProcessingNote, Result, Span,
};

use crate::spans::{enforce, validate_spans};

/// Separator between the excerpts of consecutive leaves.
pub const EXCERPT_SEPARATOR: &str = "\n";

/// Root text addressed by 1-based unit (line or verse) number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceText {
    units: Vec<String>,
}

impl SourceText {
    /// One unit per physical line. A trailing newline does not add a unit,
    /// and `\r\n` line endings are accepted.
    pub fn from_text(text: &str) -> Self {
        Self {
            units: text.lines().map(str::to_string).collect(),
        }
    }

    pub fn from_units(units: Vec<String>) -> Self {
        Self { units }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units `start..=end` joined by a single newline, or `None` if the span
    /// is malformed or runs past the end of the text.
    pub fn slice(&self, span: &Span) -> Option<String> {
        if span.check().is_err() || span.end > self.units.len() {
            return None;
        }
        Some(self.units[span.start - 1..span.end].join(EXCERPT_SEPARATOR))
    }
}

/// Output of [`resolve_excerpts`]: a copy of the tree with an excerpt on
/// every node, plus any tolerated findings.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOutline {
    pub nodes: Vec<OutlineNode>,
    pub notes: Vec<ProcessingNote>,
}

/// Resolve excerpts with strict span checking.
pub fn resolve_excerpts(nodes: &[OutlineNode], source: &SourceText) -> Result<ResolvedOutline> {
    resolve_excerpts_with(nodes, source, GapPolicy::Strict)
}

/// Resolve excerpts for every node, depth-first and post-order.
///
/// A leaf keeps its stored excerpt, or takes `source[start..=end]` when it has
/// none. An internal node gets its descendant leaves' excerpts, in document
/// order, joined by [`EXCERPT_SEPARATOR`]. Any excerpt an internal node
/// carried in the input is replaced.
///
/// Fails with [`MlsError::SpanMismatch`] if the tree's spans are inconsistent
/// (gaps only under [`GapPolicy::Strict`]) or a leaf without a stored excerpt
/// points past the end of the source text.
#[instrument(skip_all, fields(roots = nodes.len(), units = source.len(), ?policy))]
pub fn resolve_excerpts_with(
    nodes: &[OutlineNode],
    source: &SourceText,
    policy: GapPolicy,
) -> Result<ResolvedOutline> {
    let issues = validate_spans(nodes);
    let notes = enforce(&issues, policy)?;

    let mut resolved = nodes.to_vec();
    let mut leaves = 0usize;
    for node in &mut resolved {
        resolve_node(node, source, &mut leaves)?;
    }

    info!(leaves, gaps = notes.len(), "excerpts resolved");
    Ok(ResolvedOutline {
        nodes: resolved,
        notes,
    })
}

fn resolve_node(node: &mut OutlineNode, source: &SourceText, leaves: &mut usize) -> Result<()> {
    if node.is_leaf() {
        *leaves += 1;
        if node.text_excerpt.is_none() {
            let excerpt = source.slice(&node.span).ok_or_else(|| {
                MlsError::span_mismatch(
                    node.key(),
                    format!(
                        "span {} exceeds source text of {} units and the node has no stored excerpt",
                        node.span,
                        source.len()
                    ),
                )
            })?;
            node.text_excerpt = Some(excerpt);
        }
        return Ok(());
    }

    for child in &mut node.children {
        resolve_node(child, source, leaves)?;
    }

    if node.text_excerpt.is_some() {
        debug!(node = %node.key(), "replacing stored excerpt on internal node");
    }
    let combined = node
        .children
        .iter()
        .filter_map(|c| c.text_excerpt.as_deref())
        .collect::<Vec<_>>()
        .join(EXCERPT_SEPARATOR);
    node.text_excerpt = Some(combined);
    Ok(())
}

/// Compare each leaf's stored excerpt against the source slice for its span.
///
/// Mismatches are findings, not errors: they are returned as
/// [`NoteKind::ExcerptMismatch`] notes. Trailing whitespace is ignored.
pub fn check_round_trip(nodes: &[OutlineNode], source: &SourceText) -> Vec<ProcessingNote> {
    let mut notes = Vec::new();
    crate::keys::walk(nodes, &mut |node, _path| {
        let Some(stored) = node.text_excerpt.as_deref().filter(|_| node.is_leaf()) else {
            return;
        };
        match source.slice(&node.span) {
            Some(expected) if expected.trim_end() == stored.trim_end() => {}
            Some(_) => notes.push(ProcessingNote::new(
                node.key(),
                NoteKind::ExcerptMismatch,
                format!("stored excerpt differs from source units {}", node.span),
            )),
            None => notes.push(ProcessingNote::new(
                node.key(),
                NoteKind::ExcerptMismatch,
                format!(
                    "span {} exceeds source text of {} units",
                    node.span,
                    source.len()
                ),
            )),
        }
    });
    notes
}
