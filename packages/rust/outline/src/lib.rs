//! Outline tree processing for MLS.
//!
//! Parses outline documents, checks span structure, rolls leaf excerpts up
//! to their ancestors, merges per-node annotations back into the tree and
//! combines chapter outlines into one continuously numbered outline.

pub mod codec;
pub mod combine;
pub mod keys;
pub mod merge;
pub mod resolve;
pub mod spans;

pub use codec::{
    NOTES_KEY, OUTLINE_KEY, ParseOptions, RenderOptions, parse_outline, render_listing,
    render_outline,
};
pub use combine::{
    CombinedOutline, chapter_extent, chapter_number, combine_outlines, global_span_field,
    offset_spans,
};
pub use keys::{KeyEntry, check_file_stems, file_stem, index_keys, walk};
pub use merge::{MergedOutline, merge_annotation, strip_excerpts};
pub use resolve::{
    EXCERPT_SEPARATOR, ResolvedOutline, SourceText, check_round_trip, resolve_excerpts,
    resolve_excerpts_with,
};
pub use spans::{SpanIssue, SpanIssueKind, enforce, validate_spans};
