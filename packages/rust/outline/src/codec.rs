//! Outline document codec.
//!
//! Converts between outline JSON documents and the typed [`Outline`] tree.
//! Field names for spans and excerpts depend on the document's
//! [`Granularity`]; fields the tree does not model are carried in
//! [`OutlineNode::extra`] so that rendering reproduces the input's shape.

use serde_json::{Map, Value};
use tracing::{debug, instrument};

use mls_shared::{
    Granularity, MlsError, NodeShape, Outline, OutlineNode, ProcessingNote, Result, Span,
};

/// Root key of the wrapped document form.
pub const OUTLINE_KEY: &str = "outline";

/// Root key of the coverage report in the wrapped document form.
pub const NOTES_KEY: &str = "processing_notes";

/// Options for [`parse_outline`].
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Force a granularity instead of detecting it from the span field names.
    pub granularity: Option<Granularity>,
    /// Used when nothing in the tree reveals the granularity.
    pub fallback_granularity: Granularity,
    /// Field an existing annotation is read from.
    pub annotation_field: String,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            granularity: None,
            fallback_granularity: Granularity::default(),
            annotation_field: "annotation".into(),
        }
    }
}

/// Options for [`render_outline`].
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Field the annotation is written under.
    pub annotation_field: String,
    /// Whether literal excerpts are written out.
    pub include_excerpts: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            annotation_field: "annotation".into(),
            include_excerpts: true,
        }
    }
}

/// Parse an outline document.
///
/// Accepts either a bare JSON array of nodes or the wrapped form
/// `{"outline": [...], "processing_notes": [...]}` written by the merge step;
/// prior notes are dropped since every run recomputes them.
///
/// When no granularity is forced, the first recognised span field found in
/// the tree decides it; an outline without any uses the fallback.
#[instrument(skip_all, fields(len = text.len()))]
pub fn parse_outline(text: &str, opts: &ParseOptions) -> Result<Outline> {
    let doc: Value =
        serde_json::from_str(text).map_err(|e| MlsError::parse(format!("invalid outline JSON: {e}")))?;

    let items = match &doc {
        Value::Array(items) => items,
        Value::Object(map) => match map.get(OUTLINE_KEY) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(MlsError::parse(format!(
                    "outline object must contain an '{OUTLINE_KEY}' array"
                )));
            }
        },
        _ => return Err(MlsError::parse("outline must be a JSON array or object")),
    };

    let granularity = match opts.granularity {
        Some(g) => g,
        None => detect_granularity(items).unwrap_or(opts.fallback_granularity),
    };
    debug!(granularity = granularity.as_str(), "parsing outline");

    let nodes = items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_node(item, &format!("[{i}]"), granularity, opts))
        .collect::<Result<Vec<_>>>()?;

    Ok(Outline { granularity, nodes })
}

/// Render an outline back to JSON.
///
/// Without `notes` the result is a bare array, matching the input form.
/// With `notes` it is the wrapped form carrying `processing_notes`.
pub fn render_outline(
    outline: &Outline,
    notes: Option<&[ProcessingNote]>,
    opts: &RenderOptions,
) -> Value {
    let nodes = Value::Array(
        outline
            .nodes
            .iter()
            .map(|n| render_node(n, outline.granularity, opts))
            .collect(),
    );

    match notes {
        None => nodes,
        Some(notes) => {
            let mut root = Map::new();
            root.insert(OUTLINE_KEY.into(), nodes);
            root.insert(
                NOTES_KEY.into(),
                serde_json::to_value(notes).unwrap_or_else(|_| Value::Array(Vec::new())),
            );
            Value::Object(root)
        }
    }
}

/// Indented one-line-per-node listing of the outline, down to `max_depth`
/// levels (all levels when `None`).
///
/// Each line reads `- <level> [<number>]: <title> (<span>)`.
pub fn render_listing(outline: &Outline, max_depth: Option<usize>) -> String {
    fn go(nodes: &[OutlineNode], depth: usize, max_depth: Option<usize>, out: &mut String) {
        if max_depth.is_some_and(|max| depth >= max) {
            return;
        }
        for node in nodes {
            let indent = "    ".repeat(depth);
            let number = node
                .number
                .as_deref()
                .map(|n| format!(" {n}"))
                .unwrap_or_default();
            out.push_str(&format!(
                "{indent}- {}{number}: {} ({})\n",
                node.level, node.title, node.span
            ));
            go(&node.children, depth + 1, max_depth, out);
        }
    }

    let mut out = String::new();
    go(&outline.nodes, 0, max_depth, &mut out);
    out
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Find the first span field name used anywhere in the tree (pre-order).
fn detect_granularity(items: &[Value]) -> Option<Granularity> {
    for item in items {
        let Value::Object(map) = item else { continue };
        if let Some(g) = Granularity::ALL
            .into_iter()
            .find(|g| map.contains_key(g.span_field()))
        {
            return Some(g);
        }
        if let Some(Value::Array(children)) = map.get("children") {
            if let Some(g) = detect_granularity(children) {
                return Some(g);
            }
        }
    }
    None
}

fn parse_node(
    value: &Value,
    path: &str,
    granularity: Granularity,
    opts: &ParseOptions,
) -> Result<OutlineNode> {
    let Value::Object(map) = value else {
        return Err(MlsError::parse(format!("node at {path} is not an object")));
    };
    let mut extra = map.clone();

    let level = take_string(&mut extra, "level")
        .ok_or_else(|| MlsError::parse(format!("node at {path} is missing 'level'")))?;
    let mut shape = NodeShape::default();
    let number = match extra.remove("number") {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => {
            shape.numeric_number = true;
            Some(n.to_string())
        }
        Some(Value::Null) | None => None,
        Some(other) => {
            return Err(MlsError::parse(format!(
                "node at {path} has a non-string 'number': {other}"
            )));
        }
    };
    let title = take_string(&mut extra, "title")
        .ok_or_else(|| MlsError::parse(format!("node at {path} is missing 'title'")))?;

    let span_field = granularity.span_field();
    let span = extra
        .remove(span_field)
        .ok_or_else(|| MlsError::parse(format!("node at {path} is missing '{span_field}'")))
        .and_then(|raw| {
            Span::from_json(&raw).map_err(|e| MlsError::parse(format!("node at {path}: {e}")))
        })?;

    let text_excerpt = match extra.remove(granularity.excerpt_field()) {
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => {
            return Err(MlsError::parse(format!(
                "node at {path} has a non-string excerpt: {other}"
            )));
        }
    };

    let annotation = extra
        .remove(&opts.annotation_field)
        .filter(|v| !v.is_null());

    let children = match extra.remove("children") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, child)| parse_node(child, &format!("{path}/[{i}]"), granularity, opts))
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Null) => Vec::new(),
        None => {
            shape.children_omitted = true;
            Vec::new()
        }
        Some(other) => {
            return Err(MlsError::parse(format!(
                "node at {path} has non-array 'children': {other}"
            )));
        }
    };

    Ok(OutlineNode {
        level,
        number,
        title,
        span,
        children,
        text_excerpt,
        annotation,
        extra,
        shape,
    })
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            map.insert(key.to_string(), other);
            None
        }
        None => None,
    }
}

fn render_node(node: &OutlineNode, granularity: Granularity, opts: &RenderOptions) -> Value {
    let mut map = Map::new();
    map.insert("level".into(), Value::String(node.level.clone()));
    if let Some(number) = &node.number {
        let value = match number.parse::<serde_json::Number>() {
            Ok(n) if node.shape.numeric_number => Value::Number(n),
            _ => Value::String(number.clone()),
        };
        map.insert("number".into(), value);
    }
    map.insert("title".into(), Value::String(node.title.clone()));
    map.insert(granularity.span_field().into(), node.span.to_json());
    if opts.include_excerpts {
        if let Some(excerpt) = &node.text_excerpt {
            map.insert(
                granularity.excerpt_field().into(),
                Value::String(excerpt.clone()),
            );
        }
    }
    for (key, value) in &node.extra {
        map.insert(key.clone(), value.clone());
    }
    if let Some(annotation) = &node.annotation {
        map.insert(opts.annotation_field.clone(), annotation.clone());
    }
    if !(node.shape.children_omitted && node.children.is_empty()) {
        map.insert(
            "children".into(),
            Value::Array(
                node.children
                    .iter()
                    .map(|c| render_node(c, granularity, opts))
                    .collect(),
            ),
        );
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_shared::NoteKind;
    use serde_json::json;

    fn fixture() -> String {
        std::fs::read_to_string("../../../fixtures/json/outline.fixture.json")
            .expect("read outline fixture")
    }

    #[test]
    fn outline_fixture_parses() {
        let outline = parse_outline(&fixture(), &ParseOptions::default()).unwrap();
        assert_eq!(outline.granularity, Granularity::Verses);
        assert_eq!(outline.nodes.len(), 1);
        assert_eq!(outline.node_count(), 7);

        let chapter = &outline.nodes[0];
        assert_eq!(chapter.key(), "chapter-1");
        assert_eq!(chapter.span, Span::new(1, 10));
        assert!(chapter.text_excerpt.is_none());
        assert_eq!(chapter.children[1].extra["commentary_ref"], "p. 12");

        let leaf = &chapter.children[0].children[0];
        assert_eq!(leaf.key(), "subsection-1.1.1");
        assert!(leaf.is_leaf());
        assert_eq!(leaf.text_excerpt.as_deref(), Some("root verse 1\nroot verse 2\nroot verse 3"));
    }

    #[test]
    fn render_reproduces_input_shape() {
        let text = fixture();
        let original: Value = serde_json::from_str(&text).unwrap();
        let outline = parse_outline(&text, &ParseOptions::default()).unwrap();
        let rendered = render_outline(&outline, None, &RenderOptions::default());
        assert_eq!(rendered, original);
    }

    #[test]
    fn render_keeps_numeric_number_and_absent_children() {
        let input = json!([
            {"level": "chapter", "number": 3, "title": "Three", "verses_span": [1, 2],
             "children": [
                {"level": "section", "number": "3.1", "title": "Leaf", "verses_span": "1-2"}
             ]}
        ]);
        let outline = parse_outline(&input.to_string(), &ParseOptions::default()).unwrap();
        assert_eq!(outline.nodes[0].key(), "chapter-3");

        let rendered = render_outline(&outline, None, &RenderOptions::default());
        assert_eq!(rendered, input);
    }

    #[test]
    fn built_nodes_render_empty_children() {
        let outline = Outline {
            granularity: Granularity::Verses,
            nodes: vec![OutlineNode::new("chapter-1", "Built", Span::new(1, 1))],
        };
        let rendered = render_outline(&outline, None, &RenderOptions::default());
        assert_eq!(rendered[0]["children"], json!([]));
    }

    #[test]
    fn listing_indents_by_depth() {
        let outline = parse_outline(&fixture(), &ParseOptions::default()).unwrap();

        let full = render_listing(&outline, None);
        let lines: Vec<&str> = full.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "- chapter 1: Test Chapter (1-10)");
        assert_eq!(lines[1], "    - section 1.1: Test Section 1 (1-5)");
        assert_eq!(lines[2], "        - subsection 1.1.1: Test Subsection 1 (1-3)");

        assert_eq!(render_listing(&outline, Some(1)), "- chapter 1: Test Chapter (1-10)\n");
    }

    #[test]
    fn detects_line_granularity_in_nested_nodes() {
        let doc = json!([
            {"level": "chapter-1", "title": "C", "lines_span": "1-2", "children": [
                {"level": "section-1.1", "title": "S", "lines_span": [1, 2], "line_text_excerpt": "a\nb"}
            ]}
        ]);
        let outline = parse_outline(&doc.to_string(), &ParseOptions::default()).unwrap();
        assert_eq!(outline.granularity, Granularity::Lines);
        assert_eq!(outline.nodes[0].children[0].text_excerpt.as_deref(), Some("a\nb"));
    }

    #[test]
    fn empty_outline_uses_fallback_granularity() {
        let opts = ParseOptions {
            fallback_granularity: Granularity::Segments,
            ..ParseOptions::default()
        };
        let outline = parse_outline("[]", &opts).unwrap();
        assert_eq!(outline.granularity, Granularity::Segments);
        assert!(outline.nodes.is_empty());
    }

    #[test]
    fn missing_span_names_the_node_path() {
        let doc = json!([
            {"level": "chapter-1", "title": "C", "verses_span": "1-2", "children": [
                {"level": "section-1.1", "title": "S"}
            ]}
        ]);
        let err = parse_outline(&doc.to_string(), &ParseOptions::default()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("[0]/[0]"), "{msg}");
        assert!(msg.contains("verses_span"), "{msg}");
    }

    #[test]
    fn rejects_non_outline_documents() {
        assert!(parse_outline("42", &ParseOptions::default()).is_err());
        assert!(parse_outline(r#"{"nodes": []}"#, &ParseOptions::default()).is_err());
        assert!(parse_outline("not json", &ParseOptions::default()).is_err());
    }

    #[test]
    fn wrapped_form_reads_back_annotations() {
        let doc = json!({
            "outline": [
                {"level": "chapter-1", "title": "C", "verses_span": "1", "summary": {"k": "v"}, "children": []}
            ],
            "processing_notes": [{"node": "x", "kind": "missing_coverage", "message": "m"}]
        });
        let opts = ParseOptions {
            granularity: Some(Granularity::Verses),
            annotation_field: "summary".into(),
            ..ParseOptions::default()
        };
        let outline = parse_outline(&doc.to_string(), &opts).unwrap();
        assert_eq!(outline.nodes[0].annotation, Some(json!({"k": "v"})));
        assert!(outline.nodes[0].extra.is_empty());
    }

    #[test]
    fn render_with_notes_wraps_document() {
        let outline = Outline {
            granularity: Granularity::Verses,
            nodes: vec![OutlineNode::new("chapter-1", "C", Span::new(1, 2)).with_excerpt("a\nb")],
        };
        let notes = vec![ProcessingNote::new("chapter-1", NoteKind::MissingCoverage, "none")];
        let opts = RenderOptions {
            annotation_field: "summary".into(),
            include_excerpts: false,
        };
        let value = render_outline(&outline, Some(&notes), &opts);
        assert_eq!(value[NOTES_KEY][0]["node"], "chapter-1");
        assert!(value[OUTLINE_KEY][0].get("verse_text_excerpt").is_none());
        assert_eq!(value[OUTLINE_KEY][0]["verses_span"], "1-2");
    }
}
