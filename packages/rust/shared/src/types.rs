//! Core domain types for MLS outlines.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MlsError, Result};

static SPAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*(?:[-–]\s*(\d+))?\s*$").expect("span regex is valid")
});

// ---------------------------------------------------------------------------
// Span
// ---------------------------------------------------------------------------

/// How a span was written in the source document, so it can be written back
/// the same way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpanForm {
    /// `"1-36"`
    #[default]
    Range,
    /// `"37"`
    Single,
    /// `[1, 36]`
    Pair,
}

/// Inclusive, 1-based `(start, end)` locator pair into the root text.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub form: SpanForm,
}

impl Span {
    /// Build a range span. Does not validate ordering; see [`Span::check`].
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            form: SpanForm::Range,
        }
    }

    /// Number of units covered. Zero for malformed spans.
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `other` lies entirely inside this span.
    pub fn contains(&self, other: &Span) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Reject `start == 0` and `start > end`.
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.start == 0 {
            return Err(format!("span {self} starts at 0 (spans are 1-based)"));
        }
        if self.start > self.end {
            return Err(format!("span {self} has start after end"));
        }
        Ok(())
    }

    /// Decode a span from its JSON encoding (`"1-36"`, `"37"`, or `[1, 36]`).
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => s.parse(),
            Value::Array(items) if items.len() == 2 => {
                let start = items[0].as_u64();
                let end = items[1].as_u64();
                match (start, end) {
                    (Some(start), Some(end)) => Ok(Self {
                        start: start as usize,
                        end: end as usize,
                        form: SpanForm::Pair,
                    }),
                    _ => Err(MlsError::parse(format!(
                        "span array must hold two non-negative integers, got {value}"
                    ))),
                }
            }
            Value::Number(n) => n
                .as_u64()
                .map(|n| Self {
                    start: n as usize,
                    end: n as usize,
                    form: SpanForm::Single,
                })
                .ok_or_else(|| MlsError::parse(format!("invalid span number {n}"))),
            other => Err(MlsError::parse(format!("unsupported span encoding: {other}"))),
        }
    }

    /// Encode the span the way it was read.
    pub fn to_json(&self) -> Value {
        match self.form {
            SpanForm::Pair => Value::Array(vec![self.start.into(), self.end.into()]),
            SpanForm::Single if self.start == self.end => Value::String(self.start.to_string()),
            _ => Value::String(format!("{}-{}", self.start, self.end)),
        }
    }
}

impl PartialEq for Span {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.end == other.end
    }
}

impl Eq for Span {}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for Span {
    type Err = MlsError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = SPAN_RE
            .captures(s)
            .ok_or_else(|| MlsError::parse(format!("invalid span '{s}'")))?;

        let parse = |m: regex::Match<'_>| {
            m.as_str()
                .parse::<usize>()
                .map_err(|e| MlsError::parse(format!("invalid span '{s}': {e}")))
        };

        let start = caps
            .get(1)
            .ok_or_else(|| MlsError::parse(format!("invalid span '{s}'")))
            .and_then(parse)?;
        match caps.get(2) {
            Some(end) => Ok(Self {
                start,
                end: parse(end)?,
                form: SpanForm::Range,
            }),
            None => Ok(Self {
                start,
                end: start,
                form: SpanForm::Single,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Granularity
// ---------------------------------------------------------------------------

/// Addressing unit of the root text; selects the JSON field names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Lines,
    #[default]
    Verses,
    Segments,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Self::Lines, Self::Verses, Self::Segments];

    /// Name of the span field in outline documents.
    pub fn span_field(&self) -> &'static str {
        match self {
            Self::Lines => "lines_span",
            Self::Verses => "verses_span",
            Self::Segments => "segments_span",
        }
    }

    /// Name of the literal excerpt field in outline documents.
    pub fn excerpt_field(&self) -> &'static str {
        match self {
            Self::Lines => "line_text_excerpt",
            Self::Verses => "verse_text_excerpt",
            Self::Segments => "segment_text",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lines => "lines",
            Self::Verses => "verses",
            Self::Segments => "segments",
        }
    }
}

impl FromStr for Granularity {
    type Err = MlsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lines" | "line" => Ok(Self::Lines),
            "verses" | "verse" => Ok(Self::Verses),
            "segments" | "segment" => Ok(Self::Segments),
            other => Err(MlsError::config(format!(
                "unknown granularity '{other}': expected lines, verses, or segments"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// OutlineNode
// ---------------------------------------------------------------------------

/// One entry in the hierarchical outline (chapter, section, subsection, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct OutlineNode {
    /// Kind/position tag, e.g. `section-1.2`, or `section` when `number` is set.
    pub level: String,
    /// Position number in the split `level` + `number` dialect.
    pub number: Option<String>,
    /// Display title.
    pub title: String,
    /// Inclusive locator range into the root text.
    pub span: Span,
    /// Ordered children; empty for leaves.
    pub children: Vec<OutlineNode>,
    /// Literal excerpt (leaves in input; every node once resolved).
    pub text_excerpt: Option<String>,
    /// Externally generated analysis attached by key.
    pub annotation: Option<Value>,
    /// Unrecognised fields, carried through untouched.
    pub extra: Map<String, Value>,
    /// How the node was written in its source document.
    pub shape: NodeShape,
}

/// Encoding details of a parsed node, kept so re-rendering matches the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeShape {
    /// `number` was a JSON number rather than a string.
    pub numeric_number: bool,
    /// The node had no `children` key at all.
    pub children_omitted: bool,
}

impl OutlineNode {
    pub fn new(level: impl Into<String>, title: impl Into<String>, span: Span) -> Self {
        Self {
            level: level.into(),
            number: None,
            title: title.into(),
            span,
            children: Vec::new(),
            text_excerpt: None,
            annotation: None,
            extra: Map::new(),
            shape: NodeShape::default(),
        }
    }

    pub fn with_children(mut self, children: Vec<OutlineNode>) -> Self {
        self.children = children;
        self
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.text_excerpt = Some(excerpt.into());
        self
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.number = Some(number.into());
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Join key used for annotations and artifact names.
    pub fn key(&self) -> String {
        match self.number.as_deref() {
            Some(number) if !number.is_empty() => format!("{}-{number}", self.level),
            _ => self.level.clone(),
        }
    }

    /// Total number of nodes in this subtree, including `self`.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(OutlineNode::count).sum::<usize>()
    }
}

/// A parsed outline document.
#[derive(Debug, Clone, PartialEq)]
pub struct Outline {
    pub granularity: Granularity,
    pub nodes: Vec<OutlineNode>,
}

impl Outline {
    pub fn node_count(&self) -> usize {
        self.nodes.iter().map(OutlineNode::count).sum()
    }
}

// ---------------------------------------------------------------------------
// Processing notes
// ---------------------------------------------------------------------------

/// Category of a non-fatal finding reported in `processing_notes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    MissingCoverage,
    ExternalCallFailure,
    SpanGap,
    ExcerptMismatch,
    StaleAnnotation,
}

/// One entry of the root-level `processing_notes` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingNote {
    pub node: String,
    pub kind: NoteKind,
    pub message: String,
}

impl ProcessingNote {
    pub fn new(node: impl Into<String>, kind: NoteKind, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            kind,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeArtifact
// ---------------------------------------------------------------------------

/// The persisted result of one summarizer call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeArtifact {
    /// Key of the node this artifact belongs to.
    pub node_id: String,
    /// Opaque annotation object.
    pub annotation: Value,
    /// Model that produced the annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// SHA-256 of the resolved excerpt the annotation was generated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt_sha256: Option<String>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn span_parses_range_and_single() {
        let span: Span = "1-36".parse().unwrap();
        assert_eq!((span.start, span.end), (1, 36));
        assert_eq!(span.form, SpanForm::Range);

        let span: Span = " 37 ".parse().unwrap();
        assert_eq!((span.start, span.end), (37, 37));
        assert_eq!(span.form, SpanForm::Single);

        assert!("a-b".parse::<Span>().is_err());
        assert!("".parse::<Span>().is_err());
    }

    #[test]
    fn span_json_keeps_its_encoding() {
        for raw in [json!("4-4"), json!("12"), json!([3, 9])] {
            let span = Span::from_json(&raw).unwrap();
            assert_eq!(span.to_json(), raw);
        }
    }

    #[test]
    fn span_equality_ignores_encoding() {
        let a = Span::from_json(&json!("5-8")).unwrap();
        let b = Span::from_json(&json!([5, 8])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn span_check_rejects_malformed() {
        assert!(Span::new(0, 3).check().is_err());
        assert!(Span::new(5, 4).check().is_err());
        assert!(Span::new(4, 4).check().is_ok());
        assert!(Span::new(1, 4).contains(&Span::new(2, 3)));
        assert!(!Span::new(1, 4).contains(&Span::new(5, 8)));
    }

    #[test]
    fn node_key_supports_both_dialects() {
        let node = OutlineNode::new("section-1.2", "T", Span::new(1, 2));
        assert_eq!(node.key(), "section-1.2");

        let node = OutlineNode::new("section", "T", Span::new(1, 2)).with_number("1.2");
        assert_eq!(node.key(), "section-1.2");
    }

    #[test]
    fn granularity_field_names() {
        assert_eq!(Granularity::Verses.span_field(), "verses_span");
        assert_eq!(Granularity::Lines.excerpt_field(), "line_text_excerpt");
        assert_eq!("segments".parse::<Granularity>().unwrap(), Granularity::Segments);
        assert!("pages".parse::<Granularity>().is_err());
    }

    #[test]
    fn note_kind_serializes_snake_case() {
        let note = ProcessingNote::new("chapter-1", NoteKind::MissingCoverage, "no annotation");
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["kind"], "missing_coverage");
    }

    #[test]
    fn artifact_roundtrip() {
        let artifact = NodeArtifact {
            node_id: "section-1.1".into(),
            annotation: json!({"content_summary": "..."}),
            model: Some("gemini-2.0-flash".into()),
            excerpt_sha256: None,
            generated_at: Utc::now(),
        };
        let text = serde_json::to_string(&artifact).unwrap();
        assert!(!text.contains("excerpt_sha256"));
        let parsed: NodeArtifact = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, artifact);
    }
}
