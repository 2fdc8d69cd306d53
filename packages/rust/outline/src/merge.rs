//! Attach per-node annotations to the outline and strip literal excerpts.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{info, instrument, warn};

use mls_shared::{NoteKind, OutlineNode, ProcessingNote, Result};

use crate::keys::index_keys;

/// Output of [`merge_annotation`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergedOutline {
    pub nodes: Vec<OutlineNode>,
    /// One `missing_coverage` note per node left without an annotation, in
    /// document order.
    pub processing_notes: Vec<ProcessingNote>,
}

/// Attach `annotations` to the nodes whose key they are stored under.
///
/// Every literal excerpt is removed from the result. A node without an
/// entry keeps any annotation it already carries, so merging an already
/// merged tree is a no-op; a node with neither gets a `missing_coverage`
/// note. Entries whose key matches no node are ignored.
///
/// Fails with `DuplicateKey` if two nodes share a key.
#[instrument(skip_all, fields(annotations = annotations.len()))]
pub fn merge_annotation(
    nodes: &[OutlineNode],
    annotations: &HashMap<String, Value>,
) -> Result<MergedOutline> {
    let keys = index_keys(nodes)?;

    let mut merged = nodes.to_vec();
    let mut notes = Vec::new();
    for node in &mut merged {
        attach(node, annotations, &mut notes);
    }

    let unused = annotations
        .keys()
        .filter(|k| !keys.iter().any(|e| &e.key == *k))
        .count();
    if unused > 0 {
        warn!(unused, "annotations without a matching node were ignored");
    }
    info!(
        nodes = keys.len(),
        missing = notes.len(),
        "annotations merged"
    );

    Ok(MergedOutline {
        nodes: merged,
        processing_notes: notes,
    })
}

fn attach(
    node: &mut OutlineNode,
    annotations: &HashMap<String, Value>,
    notes: &mut Vec<ProcessingNote>,
) {
    let key = node.key();
    node.text_excerpt = None;
    match annotations.get(&key) {
        Some(annotation) => node.annotation = Some(annotation.clone()),
        None if node.annotation.is_some() => {}
        None => notes.push(ProcessingNote::new(
            &key,
            NoteKind::MissingCoverage,
            format!("no annotation for '{}'", node.title),
        )),
    }
    for child in &mut node.children {
        attach(child, annotations, notes);
    }
}

/// Remove the literal excerpt from every node, in place.
pub fn strip_excerpts(nodes: &mut [OutlineNode]) {
    for node in nodes {
        node.text_excerpt = None;
        strip_excerpts(&mut node.children);
    }
}
