//! Structural span checks.
//!
//! Children must lie inside their parent, siblings must be ascending and
//! non-overlapping, and together the children must tile the parent with no
//! gap. Top-level nodes are checked against each other the same way.

use tracing::{error, warn};

use mls_shared::{GapPolicy, MlsError, NoteKind, OutlineNode, ProcessingNote, Span};

/// What is wrong with a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanIssueKind {
    /// `start == 0` or `start > end`.
    Malformed,
    /// Child span leaves its parent's span.
    OutsideParent,
    /// Sibling spans overlap or are out of order.
    Overlap,
    /// Units between siblings (or between the parent's bounds and its first
    /// or last child) belong to no node.
    Gap,
}

/// A structural problem found by [`validate_spans`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanIssue {
    /// Key of the node the issue is reported against.
    pub node: String,
    /// Tree path of that node.
    pub path: String,
    pub kind: SpanIssueKind,
    pub detail: String,
}

impl SpanIssue {
    /// Gaps are tolerated under [`GapPolicy::Warn`]; everything else is fatal.
    pub fn is_fatal(&self, policy: GapPolicy) -> bool {
        !(self.kind == SpanIssueKind::Gap && policy == GapPolicy::Warn)
    }

    pub fn to_error(&self) -> MlsError {
        MlsError::span_mismatch(format!("{} ({})", self.node, self.path), &self.detail)
    }

    pub fn to_note(&self) -> ProcessingNote {
        ProcessingNote::new(&self.node, NoteKind::SpanGap, &self.detail)
    }
}

/// Check every subtree and return every issue found.
///
/// A malformed span is reported once; relational checks involving it are
/// skipped so one bad node does not drown the report.
pub fn validate_spans(nodes: &[OutlineNode]) -> Vec<SpanIssue> {
    let mut issues = Vec::new();
    check_level(nodes, None, "", &mut issues);
    issues
}

/// Split issues into a fatal error and tolerated notes under `policy`.
///
/// Every fatal issue is logged; the first one is returned as the error.
pub fn enforce(issues: &[SpanIssue], policy: GapPolicy) -> Result<Vec<ProcessingNote>, MlsError> {
    let mut notes = Vec::new();
    let mut first_fatal = None;

    for issue in issues {
        if issue.is_fatal(policy) {
            error!(node = %issue.node, path = %issue.path, detail = %issue.detail, "span mismatch");
            first_fatal.get_or_insert(issue);
        } else {
            warn!(node = %issue.node, path = %issue.path, detail = %issue.detail, "span gap tolerated");
            notes.push(issue.to_note());
        }
    }

    match first_fatal {
        Some(issue) => Err(issue.to_error()),
        None => Ok(notes),
    }
}

fn check_level(
    siblings: &[OutlineNode],
    parent: Option<(&OutlineNode, &str)>,
    prefix: &str,
    issues: &mut Vec<SpanIssue>,
) {
    let paths: Vec<String> = (0..siblings.len())
        .map(|i| {
            if prefix.is_empty() {
                format!("[{i}]")
            } else {
                format!("{prefix}/[{i}]")
            }
        })
        .collect();

    let mut well_formed = Vec::with_capacity(siblings.len());
    for (node, path) in siblings.iter().zip(&paths) {
        match node.span.check() {
            Ok(()) => well_formed.push(true),
            Err(detail) => {
                issues.push(issue(node, path, SpanIssueKind::Malformed, detail));
                well_formed.push(false);
            }
        }
    }

    if let Some((parent, _)) = parent.filter(|(p, _)| p.span.check().is_ok()) {
        for ((node, path), ok) in siblings.iter().zip(&paths).zip(&well_formed) {
            if *ok && !parent.span.contains(&node.span) {
                issues.push(issue(
                    node,
                    path,
                    SpanIssueKind::OutsideParent,
                    format!(
                        "span {} falls outside parent '{}' span {}",
                        node.span,
                        parent.key(),
                        parent.span
                    ),
                ));
            }
        }
    }

    let mut prev: Option<(&OutlineNode, &Span)> = None;
    for ((node, path), ok) in siblings.iter().zip(&paths).zip(&well_formed) {
        if !*ok {
            prev = None;
            continue;
        }
        if let Some((prev_node, prev_span)) = prev {
            if node.span.start <= prev_span.end {
                issues.push(issue(
                    node,
                    path,
                    SpanIssueKind::Overlap,
                    format!(
                        "span {} overlaps or precedes sibling '{}' span {}",
                        node.span,
                        prev_node.key(),
                        prev_span
                    ),
                ));
            } else if node.span.start > prev_span.end + 1 {
                issues.push(issue(
                    node,
                    path,
                    SpanIssueKind::Gap,
                    format!(
                        "units {}-{} between '{}' and '{}' are not covered",
                        prev_span.end + 1,
                        node.span.start - 1,
                        prev_node.key(),
                        node.key()
                    ),
                ));
            }
        }
        prev = Some((node, &node.span));
    }

    if let Some((parent, parent_path)) = parent.filter(|(p, _)| p.span.check().is_ok()) {
        check_bounds(parent, parent_path, siblings, &well_formed, issues);
    }

    for (node, path) in siblings.iter().zip(&paths) {
        if !node.children.is_empty() {
            check_level(&node.children, Some((node, path)), path, issues);
        }
    }
}

/// Report uncovered units at the start or end of a parent's span.
fn check_bounds(
    parent: &OutlineNode,
    parent_path: &str,
    children: &[OutlineNode],
    well_formed: &[bool],
    issues: &mut Vec<SpanIssue>,
) {
    let usable = |i: usize| well_formed[i] && parent.span.contains(&children[i].span);

    if let Some(first) = children.first().filter(|_| usable(0)) {
        if first.span.start > parent.span.start {
            issues.push(issue(
                parent,
                parent_path,
                SpanIssueKind::Gap,
                format!(
                    "units {}-{} before first child '{}' are not covered",
                    parent.span.start,
                    first.span.start - 1,
                    first.key()
                ),
            ));
        }
    }

    let last_idx = children.len().saturating_sub(1);
    if let Some(last) = children.last().filter(|_| usable(last_idx)) {
        if last.span.end < parent.span.end {
            issues.push(issue(
                parent,
                parent_path,
                SpanIssueKind::Gap,
                format!(
                    "units {}-{} after last child '{}' are not covered",
                    last.span.end + 1,
                    parent.span.end,
                    last.key()
                ),
            ));
        }
    }
}

fn issue(node: &OutlineNode, path: &str, kind: SpanIssueKind, detail: String) -> SpanIssue {
    SpanIssue {
        node: node.key(),
        path: path.to_string(),
        kind,
        detail,
    }
}
