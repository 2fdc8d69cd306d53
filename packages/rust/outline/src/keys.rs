//! Node keys: the join identifiers used for annotations and artifact names.

use std::collections::HashMap;

use mls_shared::{MlsError, OutlineNode, Result};

/// A node's key and its position in the tree (`[0]/[2]/[1]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub key: String,
    pub path: String,
}

/// Filesystem-safe form of a node key, used as the artifact file stem.
///
/// `.` becomes `-` (so `section-1.2` maps to `section-1-2`). ASCII
/// characters outside `[A-Za-z0-9_-]`, whitespace and control characters
/// become `_`; every other non-ASCII character is kept, so Tibetan keys stay
/// distinct.
pub fn file_stem(key: &str) -> String {
    let stem: String = key
        .chars()
        .map(|c| match c {
            '.' => '-',
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => c,
            c if !c.is_ascii() && !c.is_whitespace() && !c.is_control() => c,
            _ => '_',
        })
        .collect();

    if stem.is_empty() { "_".into() } else { stem }
}

/// Visit every node in document (pre-)order together with its tree path.
pub fn walk<'a>(nodes: &'a [OutlineNode], visit: &mut impl FnMut(&'a OutlineNode, &str)) {
    fn go<'a>(
        nodes: &'a [OutlineNode],
        prefix: &str,
        visit: &mut impl FnMut(&'a OutlineNode, &str),
    ) {
        for (i, node) in nodes.iter().enumerate() {
            let path = if prefix.is_empty() {
                format!("[{i}]")
            } else {
                format!("{prefix}/[{i}]")
            };
            visit(node, &path);
            go(&node.children, &path, visit);
        }
    }
    go(nodes, "", visit);
}

/// Collect every node key in document order.
///
/// Fails with `DuplicateKey` when two nodes share a key.
pub fn index_keys(nodes: &[OutlineNode]) -> Result<Vec<KeyEntry>> {
    let mut entries: Vec<KeyEntry> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut collision: Option<MlsError> = None;

    walk(nodes, &mut |node, path| {
        if collision.is_some() {
            return;
        }
        let key = node.key();

        if let Some(&first) = by_key.get(&key) {
            collision = Some(MlsError::DuplicateKey {
                key,
                first: entries[first].path.clone(),
                second: path.to_string(),
            });
            return;
        }

        by_key.insert(key.clone(), entries.len());
        entries.push(KeyEntry {
            key,
            path: path.to_string(),
        });
    });

    match collision {
        Some(err) => Err(err),
        None => Ok(entries),
    }
}

/// Reject distinct keys whose [`file_stem`]s coincide.
///
/// Only matters where artifacts are named after the stem: two such nodes
/// would share one artifact file.
pub fn check_file_stems(entries: &[KeyEntry]) -> Result<()> {
    let mut by_stem: HashMap<String, &KeyEntry> = HashMap::new();
    for entry in entries {
        let stem = file_stem(&entry.key);
        if let Some(first) = by_stem.get(&stem) {
            return Err(MlsError::DuplicateKey {
                key: format!("{} (artifact name '{stem}' also used by '{}')", entry.key, first.key),
                first: first.path.clone(),
                second: entry.path.clone(),
            });
        }
        by_stem.insert(stem, entry);
    }
    Ok(())
}
