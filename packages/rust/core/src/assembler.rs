//! Input loading and final-document assembly.
//!
//! [`integrate`] is the end-to-end merge step: outline in, stored
//! artifacts attached, excerpts stripped, coverage report at the root, one
//! atomic write out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use mls_outline::{
    ParseOptions, RenderOptions, SourceText, chapter_extent, chapter_number, check_round_trip,
    combine_outlines, index_keys, merge_annotation, parse_outline, render_outline, resolve_excerpts_with, walk,
};
use mls_shared::{GapPolicy, MlsError, NoteKind, Outline, ProcessingNote, Result};
use mls_storage::AnnotationStore;

use crate::pipeline::excerpt_fingerprint;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read and parse an outline document.
pub fn load_outline(path: &Path, opts: &ParseOptions) -> Result<Outline> {
    let text = std::fs::read_to_string(path).map_err(|e| MlsError::io(path, e))?;
    let outline = parse_outline(&text, opts).map_err(|e| match e {
        MlsError::Parse { message } => MlsError::parse(format!("{}: {message}", path.display())),
        other => other,
    })?;
    debug!(path = %path.display(), nodes = outline.node_count(), "outline loaded");
    Ok(outline)
}

/// Read the root text, one unit per line.
pub fn load_source_text(path: &Path) -> Result<SourceText> {
    let text = std::fs::read_to_string(path).map_err(|e| MlsError::io(path, e))?;
    let source = SourceText::from_text(&text);
    debug!(path = %path.display(), units = source.len(), "source text loaded");
    Ok(source)
}

/// Read the commentary passed to the summarizer.
pub fn load_commentary(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| MlsError::io(path, e))
}

/// An outline ready for processing, with any tolerated findings.
#[derive(Debug, Clone)]
pub struct PreparedOutline {
    pub outline: Outline,
    pub notes: Vec<ProcessingNote>,
}

/// Load an outline and resolve every node's excerpt.
///
/// Leaves keep their stored excerpt; only leaves without one are sliced from
/// `source`. Without a source, such a leaf fails with `SpanMismatch`. Stored
/// excerpts that disagree with a given source are reported as
/// `excerpt_mismatch` notes; tolerated gaps as `span_gap` notes.
pub fn prepare_outline(
    outline_path: &Path,
    source_path: Option<&Path>,
    opts: &ParseOptions,
    gap_policy: GapPolicy,
) -> Result<PreparedOutline> {
    let mut outline = load_outline(outline_path, opts)?;
    let mut mismatches = Vec::new();

    let source = match source_path {
        Some(path) => {
            let source = load_source_text(path)?;
            mismatches = check_round_trip(&outline.nodes, &source);
            for note in &mismatches {
                warn!(node = %note.node, "{}", note.message);
            }
            source
        }
        None => SourceText::default(),
    };

    let resolved = resolve_excerpts_with(&outline.nodes, &source, gap_policy)?;
    outline.nodes = resolved.nodes;

    let mut notes = resolved.notes;
    notes.extend(mismatches);
    Ok(PreparedOutline { outline, notes })
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Write pretty-printed JSON to `path` atomically (temp file, then rename).
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(data)
        .map_err(|e| MlsError::validation(format!("JSON serialization failed: {e}")))?;
    json.push('\n');

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| MlsError::io(&dir, e))?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| MlsError::validation(format!("not a file path: {}", path.display())))?;
    let temp = dir.join(format!(".{filename}.{}.tmp", Uuid::now_v7()));

    std::fs::write(&temp, json).map_err(|e| MlsError::io(&temp, e))?;
    if let Err(e) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(MlsError::io(path, e));
    }

    debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}

// ---------------------------------------------------------------------------
// Integrate
// ---------------------------------------------------------------------------

/// Configuration for [`integrate`].
#[derive(Debug, Clone)]
pub struct IntegrateConfig {
    pub outline_path: PathBuf,
    /// Root text; when set, excerpts are resolved so stale artifacts can be
    /// detected.
    pub source_path: Option<PathBuf>,
    pub output_path: PathBuf,
    /// Granularity and annotation field; the annotation is written back
    /// under the same field it is read from.
    pub parse: ParseOptions,
    pub gap_policy: GapPolicy,
}

/// Result of [`integrate`].
#[derive(Debug, Clone)]
pub struct IntegrateReport {
    pub node_count: usize,
    /// Nodes that received an artifact from the store in this run.
    pub annotated: usize,
    pub notes: Vec<ProcessingNote>,
    pub output_path: PathBuf,
}

/// Build the final merged document from an outline and the artifact store.
#[instrument(skip_all, fields(outline = %config.outline_path.display(), output = %config.output_path.display()))]
pub async fn integrate(
    config: &IntegrateConfig,
    store: &dyn AnnotationStore,
) -> Result<IntegrateReport> {
    let PreparedOutline { outline, mut notes } = prepare_outline(
        &config.outline_path,
        config.source_path.as_deref(),
        &config.parse,
        config.gap_policy,
    )?;

    let keys = index_keys(&outline.nodes)?;
    store.check_keys(&keys)?;

    let mut excerpts: HashMap<String, String> = HashMap::new();
    walk(&outline.nodes, &mut |node, _| {
        if let Some(excerpt) = &node.text_excerpt {
            excerpts.insert(node.key(), excerpt.clone());
        }
    });

    let mut annotations: HashMap<String, Value> = HashMap::new();
    for entry in &keys {
        let Some(artifact) = store.get(&entry.key).await? else {
            continue;
        };
        if let (Some(stored), Some(excerpt)) =
            (artifact.excerpt_sha256.as_deref(), excerpts.get(&entry.key))
        {
            if stored != excerpt_fingerprint(excerpt) {
                warn!(node = %entry.key, "annotation was generated from a different excerpt");
                notes.push(ProcessingNote::new(
                    &entry.key,
                    NoteKind::StaleAnnotation,
                    "annotation was generated from a different excerpt",
                ));
            }
        }
        annotations.insert(entry.key.clone(), artifact.annotation);
    }

    let merged = merge_annotation(&outline.nodes, &annotations)?;
    notes.extend(merged.processing_notes);

    let document = render_outline(
        &Outline {
            granularity: outline.granularity,
            nodes: merged.nodes,
        },
        Some(&notes),
        &RenderOptions {
            annotation_field: config.parse.annotation_field.clone(),
            include_excerpts: false,
        },
    );
    write_json_atomic(&config.output_path, &document)?;

    info!(
        nodes = keys.len(),
        annotated = annotations.len(),
        notes = notes.len(),
        "integration complete"
    );

    Ok(IntegrateReport {
        node_count: keys.len(),
        annotated: annotations.len(),
        notes,
        output_path: config.output_path.clone(),
    })
}

// ---------------------------------------------------------------------------
// Combine
// ---------------------------------------------------------------------------

/// Chapter outline files under `root`: `<root>/<chapter dir>/<file_name>`,
/// ordered by the first number in each directory name. Directories without
/// the file are skipped with a warning.
pub fn chapter_files(root: &Path, file_name: &str) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(root).map_err(|e| MlsError::io(root, e))?;

    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| MlsError::io(root, e))?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort_by(|a, b| chapter_number(a).cmp(&chapter_number(b)).then_with(|| a.cmp(b)));

    let mut files = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let file = dir.join(file_name);
        if file.is_file() {
            files.push(file);
        } else {
            warn!(dir = %dir.display(), file_name, "chapter directory has no outline, skipping");
        }
    }
    Ok(files)
}

/// Configuration for [`combine`].
#[derive(Debug, Clone)]
pub struct CombineConfig {
    /// Chapter outlines in reading order.
    pub inputs: Vec<PathBuf>,
    pub output_path: PathBuf,
    pub parse: ParseOptions,
    pub gap_policy: GapPolicy,
}

/// Result of [`combine`].
#[derive(Debug, Clone)]
pub struct CombineReport {
    pub chapters: usize,
    /// Top-level nodes in the combined outline.
    pub top_level: usize,
    /// Units covered by the combined outline.
    pub units: usize,
    pub notes: Vec<ProcessingNote>,
    pub output_path: PathBuf,
}

/// Combine chapter outline files into one outline and write it atomically.
#[instrument(skip_all, fields(chapters = config.inputs.len(), output = %config.output_path.display()))]
pub fn combine(config: &CombineConfig) -> Result<CombineReport> {
    let chapters = config
        .inputs
        .iter()
        .map(|path| load_outline(path, &config.parse))
        .collect::<Result<Vec<_>>>()?;

    let combined = combine_outlines(chapters, config.gap_policy)?;
    let units = chapter_extent(&combined.outline.nodes);

    let document = render_outline(
        &combined.outline,
        None,
        &RenderOptions {
            annotation_field: config.parse.annotation_field.clone(),
            include_excerpts: true,
        },
    );
    write_json_atomic(&config.output_path, &document)?;

    info!(
        chapters = config.inputs.len(),
        units,
        notes = combined.notes.len(),
        "combined outline written"
    );

    Ok(CombineReport {
        chapters: config.inputs.len(),
        top_level: combined.outline.nodes.len(),
        units,
        notes: combined.notes,
        output_path: config.output_path.clone(),
    })
}
