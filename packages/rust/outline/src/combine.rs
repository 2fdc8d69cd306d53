//! Multi-chapter combination.
//!
//! Chapter outlines are numbered from unit 1 each. Combining them shifts
//! every span by the units of the chapters before it, so the combined
//! outline addresses one continuous root text. Each shifted node also
//! records its position as `global_<span field>`.

use std::path::Path;

use tracing::{info, instrument};

use mls_shared::{GapPolicy, Granularity, MlsError, Outline, OutlineNode, ProcessingNote, Result};

use crate::spans::{SpanIssue, SpanIssueKind, enforce, validate_spans};

/// Output of [`combine_outlines`].
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedOutline {
    pub outline: Outline,
    /// Unit offset applied to each input chapter, in input order.
    pub offsets: Vec<usize>,
    /// Tolerated continuity gaps (`span_gap`).
    pub notes: Vec<ProcessingNote>,
}

/// Field holding a node's span in the combined numbering.
pub fn global_span_field(granularity: Granularity) -> String {
    format!("global_{}", granularity.span_field())
}

/// Sort key of a chapter directory or file: the first run of digits in its
/// name (`chapter_12` is 12). Names without digits sort last.
pub fn chapter_number(path: &Path) -> u64 {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let digits: String = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(u64::MAX)
}

/// Number of units a chapter covers: the highest end among its top-level
/// spans.
pub fn chapter_extent(nodes: &[OutlineNode]) -> usize {
    nodes.iter().map(|n| n.span.end).max().unwrap_or(0)
}

/// Shift every span in `nodes` by `offset` and record the shifted span under
/// `global_field`.
pub fn offset_spans(nodes: &mut [OutlineNode], offset: usize, global_field: &str) {
    for node in nodes {
        node.span.start += offset;
        node.span.end += offset;
        node.extra
            .insert(global_field.to_string(), node.span.to_json());
        offset_spans(&mut node.children, offset, global_field);
    }
}

/// Concatenate chapter outlines, given in reading order, into one outline.
///
/// All chapters must share a granularity. The combined tree is checked with
/// [`validate_spans`], and the first chapter must start at unit 1; gaps are
/// handled under `policy`, overlaps are always fatal.
#[instrument(skip_all, fields(chapters = chapters.len(), ?policy))]
pub fn combine_outlines(chapters: Vec<Outline>, policy: GapPolicy) -> Result<CombinedOutline> {
    let granularity = match chapters.first() {
        Some(first) => first.granularity,
        None => return Err(MlsError::validation("no chapter outlines to combine")),
    };
    if let Some(other) = chapters.iter().find(|c| c.granularity != granularity) {
        return Err(MlsError::validation(format!(
            "cannot combine {} and {} outlines",
            granularity.as_str(),
            other.granularity.as_str()
        )));
    }

    let global_field = global_span_field(granularity);
    let mut nodes = Vec::new();
    let mut offsets = Vec::with_capacity(chapters.len());
    let mut offset = 0usize;

    for mut chapter in chapters {
        let extent = chapter_extent(&chapter.nodes);
        offset_spans(&mut chapter.nodes, offset, &global_field);
        offsets.push(offset);
        nodes.extend(chapter.nodes);
        offset += extent;
    }

    let mut issues = leading_gap(&nodes).into_iter().collect::<Vec<_>>();
    issues.extend(validate_spans(&nodes));
    let notes = enforce(&issues, policy)?;

    info!(nodes = nodes.len(), units = offset, gaps = notes.len(), "chapters combined");
    Ok(CombinedOutline {
        outline: Outline { granularity, nodes },
        offsets,
        notes,
    })
}

/// Units before the first top-level node.
fn leading_gap(nodes: &[OutlineNode]) -> Option<SpanIssue> {
    let first = nodes.first()?;
    (first.span.start > 1).then(|| SpanIssue {
        node: first.key(),
        path: "[0]".into(),
        kind: SpanIssueKind::Gap,
        detail: format!(
            "units 1-{} before '{}' are not covered",
            first.span.start - 1,
            first.key()
        ),
    })
}
