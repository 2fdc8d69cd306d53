//! Shared types, error model, and configuration for MLS.
//!
//! This crate is the foundation depended on by all other MLS crates.
//! It provides:
//! - [`MlsError`] — the unified error type
//! - Domain types ([`OutlineNode`], [`Span`], [`ProcessingNote`], [`NodeArtifact`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, GapPolicy, GeminiConfig, GenerationConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, resolve_api_key,
    validate_config,
};
pub use error::{MlsError, Result};
pub use types::{
    Granularity, NodeArtifact, NodeShape, NoteKind, Outline, OutlineNode, ProcessingNote, Span,
    SpanForm,
};
