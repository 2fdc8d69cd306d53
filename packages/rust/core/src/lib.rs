//! Pipeline orchestration for MLS.
//!
//! Ties the outline processor, the artifact store and the summarizer
//! together into the end-to-end workflows, from combining chapter outlines
//! through per-node annotation to the final merged document.

pub mod assembler;
pub mod pipeline;

pub use assembler::{
    CombineConfig, CombineReport, IntegrateConfig, IntegrateReport, PreparedOutline,
    chapter_files, combine, integrate, load_commentary, load_outline, load_source_text,
    prepare_outline, write_json_atomic,
};
pub use pipeline::{
    GenerateConfig, GenerateProgress, GenerateReport, NodeOutcome, SilentProgress,
    excerpt_fingerprint, generate_annotations,
};
