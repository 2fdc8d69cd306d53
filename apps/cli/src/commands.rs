//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use mls_core::{
    CombineConfig, GenerateConfig, GenerateProgress, GenerateReport, IntegrateConfig, NodeOutcome,
    chapter_files, combine, generate_annotations, integrate, load_commentary, load_outline,
    load_source_text, prepare_outline, write_json_atomic,
};
use mls_outline::{
    ParseOptions, RenderOptions, SpanIssue, check_round_trip, render_listing, render_outline,
    resolve_excerpts_with, strip_excerpts, validate_spans,
};
use mls_shared::{
    AppConfig, GapPolicy, Granularity, ProcessingNote, init_config, load_config,
    load_config_from, resolve_api_key,
};
use mls_storage::{AnnotationStore, FsAnnotationStore, LibsqlAnnotationStore};
use mls_summarizer::GeminiSummarizer;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// MLS: attach root text to an outline, annotate every node, merge the results.
#[derive(Parser)]
#[command(
    name = "mls",
    version,
    about = "Resolve, annotate and merge hierarchical outlines of a root text.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.mls/mls.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Addressing unit: lines, verses, or segments (detected when omitted).
    #[arg(long, global = true)]
    pub granularity: Option<Granularity>,

    /// Gap handling between sibling spans: strict or warn.
    #[arg(long, global = true)]
    pub gap_policy: Option<GapPolicy>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Where per-node artifacts live.
#[derive(clap::Args, Debug, Clone)]
pub(crate) struct StoreArgs {
    /// Directory of per-node JSON artifacts (defaults to `defaults.store_dir`).
    #[arg(long, conflicts_with = "db")]
    pub store: Option<PathBuf>,

    /// libSQL database file instead of a directory.
    #[arg(long)]
    pub db: Option<PathBuf>,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Attach root text to every node and write the resolved outline.
    Resolve {
        #[arg(long)]
        outline: PathBuf,
        /// Root text, one unit per line.
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },

    /// Check span structure (and stored excerpts, given the root text).
    Verify {
        #[arg(long)]
        outline: PathBuf,
        #[arg(long)]
        source: Option<PathBuf>,
    },

    /// Generate one annotation per node, skipping nodes already stored.
    Generate {
        #[arg(long)]
        outline: PathBuf,
        #[arg(long)]
        commentary: PathBuf,
        #[arg(long)]
        source: Option<PathBuf>,
        #[command(flatten)]
        store: StoreArgs,
        /// Maximum summarizer calls in flight.
        #[arg(long)]
        concurrency: Option<usize>,
        /// Delay after each generated annotation, in milliseconds.
        #[arg(long)]
        pacing_ms: Option<u64>,
    },

    /// Merge stored annotations into the outline and strip excerpts.
    Merge {
        #[arg(long)]
        outline: PathBuf,
        #[arg(long)]
        source: Option<PathBuf>,
        #[command(flatten)]
        store: StoreArgs,
        #[arg(long)]
        out: PathBuf,
        /// Field the annotation is written under (defaults to config).
        #[arg(long)]
        annotation_field: Option<String>,
    },

    /// Combine chapter outlines into one continuously numbered outline.
    Combine {
        /// Chapter outline files, in reading order.
        #[arg(required_unless_present = "dir", conflicts_with = "dir")]
        inputs: Vec<PathBuf>,
        /// Directory of chapter subdirectories, ordered by chapter number.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Outline file name inside each chapter directory.
        #[arg(long, default_value = "MLS_en.json")]
        file_name: String,
        #[arg(long)]
        out: PathBuf,
    },

    /// Print the outline as an indented tree.
    Show {
        #[arg(long)]
        outline: PathBuf,
        /// Only the first N levels (1 lists top-level entries).
        #[arg(long)]
        depth: Option<usize>,
    },

    /// Remove literal excerpts from every node.
    Strip {
        #[arg(long)]
        outline: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "mls=info",
        1 => "mls=debug",
        _ => "mls=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Settings shared by every command: config file plus global overrides.
struct Context {
    config: AppConfig,
    granularity: Option<Granularity>,
    gap_policy: GapPolicy,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        let gap_policy = cli.gap_policy.unwrap_or(config.defaults.gap_policy);
        Ok(Self {
            granularity: cli.granularity,
            gap_policy,
            config,
        })
    }

    fn parse_options(&self, annotation_field: Option<&str>) -> ParseOptions {
        ParseOptions {
            granularity: self.granularity,
            fallback_granularity: self.config.defaults.granularity,
            annotation_field: annotation_field
                .unwrap_or(&self.config.defaults.annotation_field)
                .to_string(),
        }
    }

    async fn open_store(&self, args: &StoreArgs) -> Result<Box<dyn AnnotationStore>> {
        if let Some(db) = &args.db {
            info!(db = %db.display(), "using libSQL artifact store");
            return Ok(Box::new(LibsqlAnnotationStore::open(db).await?));
        }
        let dir = args
            .store
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.config.defaults.store_dir));
        info!(dir = %dir.display(), "using directory artifact store");
        Ok(Box::new(FsAnnotationStore::open(dir)?))
    }
}

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()).await,
        };
    }

    let ctx = Context::load(&cli)?;
    match cli.command {
        Command::Resolve {
            outline,
            source,
            out,
        } => cmd_resolve(&ctx, &outline, source.as_deref(), &out).await,
        Command::Verify { outline, source } => cmd_verify(&ctx, &outline, source.as_deref()).await,
        Command::Generate {
            outline,
            commentary,
            source,
            store,
            concurrency,
            pacing_ms,
        } => {
            cmd_generate(
                &ctx,
                &outline,
                &commentary,
                source.as_deref(),
                &store,
                concurrency,
                pacing_ms,
            )
            .await
        }
        Command::Merge {
            outline,
            source,
            store,
            out,
            annotation_field,
        } => {
            cmd_merge(
                &ctx,
                &outline,
                source.as_deref(),
                &store,
                &out,
                annotation_field.as_deref(),
            )
            .await
        }
        Command::Combine {
            inputs,
            dir,
            file_name,
            out,
        } => cmd_combine(&ctx, inputs, dir.as_deref(), &file_name, &out).await,
        Command::Show { outline, depth } => cmd_show(&ctx, &outline, depth).await,
        Command::Strip { outline, out } => cmd_strip(&ctx, &outline, &out).await,
        Command::Config { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_resolve(ctx: &Context, outline: &Path, source: Option<&Path>, out: &Path) -> Result<()> {
    let opts = ctx.parse_options(None);
    let mut parsed = load_outline(outline, &opts)?;
    let source = match source {
        Some(path) => load_source_text(path)?,
        None => Default::default(),
    };

    let resolved = resolve_excerpts_with(&parsed.nodes, &source, ctx.gap_policy)?;
    parsed.nodes = resolved.nodes;
    print_notes(&resolved.notes);

    let document = render_outline(
        &parsed,
        None,
        &RenderOptions {
            annotation_field: opts.annotation_field.clone(),
            include_excerpts: true,
        },
    );
    write_json_atomic(out, &document)?;

    println!(
        "  Resolved {} nodes -> {}",
        parsed.node_count(),
        out.display()
    );
    Ok(())
}

async fn cmd_verify(ctx: &Context, outline: &Path, source: Option<&Path>) -> Result<()> {
    let parsed = load_outline(outline, &ctx.parse_options(None))?;
    let issues = validate_spans(&parsed.nodes);
    let fatal: Vec<&SpanIssue> = issues.iter().filter(|i| i.is_fatal(ctx.gap_policy)).collect();

    for issue in &issues {
        let marker = if issue.is_fatal(ctx.gap_policy) { "error" } else { "warn " };
        println!("  {marker} {} {}: {}", issue.path, issue.node, issue.detail);
    }

    if let Some(path) = source {
        let source = load_source_text(path)?;
        print_notes(&check_round_trip(&parsed.nodes, &source));
    }

    println!(
        "  {} nodes checked, {} issues ({} fatal)",
        parsed.node_count(),
        issues.len(),
        fatal.len()
    );

    if fatal.is_empty() {
        Ok(())
    } else {
        Err(eyre!("{} fatal span issue(s) in {}", fatal.len(), outline.display()))
    }
}

async fn cmd_generate(
    ctx: &Context,
    outline: &Path,
    commentary: &Path,
    source: Option<&Path>,
    store_args: &StoreArgs,
    concurrency: Option<usize>,
    pacing_ms: Option<u64>,
) -> Result<()> {
    // Fail on a missing key before touching any input.
    let api_key = resolve_api_key(&ctx.config)?;

    let prepared = prepare_outline(outline, source, &ctx.parse_options(None), ctx.gap_policy)?;
    print_notes(&prepared.notes);
    let commentary = load_commentary(commentary)?;

    let mut generation = ctx.config.generation.clone();
    if let Some(n) = concurrency {
        generation.concurrency = n.max(1);
    }
    if let Some(ms) = pacing_ms {
        generation.pacing_ms = ms;
    }

    let summarizer = GeminiSummarizer::new(&ctx.config.gemini, api_key)?;
    let store = ctx.open_store(store_args).await?;
    let reporter = CliProgress::new(prepared.outline.node_count());

    info!(
        outline = %outline.display(),
        model = %ctx.config.gemini.model,
        "generating annotations"
    );

    let report = generate_annotations(
        &GenerateConfig::from(&generation),
        &prepared.outline,
        &commentary,
        &summarizer,
        store.as_ref(),
        &reporter,
    )
    .await?;

    println!();
    println!("  Generated: {}", report.generated);
    println!("  Skipped:   {}", report.skipped);
    println!("  Failed:    {}", report.failed);
    println!("  Time:      {:.1}s", report.elapsed.as_secs_f64());
    print_notes(&report.notes);
    println!();

    if report.failed > 0 {
        warn!(failed = report.failed, "some nodes have no annotation; rerun to retry them");
    }
    Ok(())
}

async fn cmd_merge(
    ctx: &Context,
    outline: &Path,
    source: Option<&Path>,
    store_args: &StoreArgs,
    out: &Path,
    annotation_field: Option<&str>,
) -> Result<()> {
    let store = ctx.open_store(store_args).await?;
    let config = IntegrateConfig {
        outline_path: outline.to_path_buf(),
        source_path: source.map(Path::to_path_buf),
        output_path: out.to_path_buf(),
        parse: ctx.parse_options(annotation_field),
        gap_policy: ctx.gap_policy,
    };

    let report = integrate(&config, store.as_ref()).await?;

    println!();
    println!("  Nodes:     {}", report.node_count);
    println!("  Annotated: {}", report.annotated);
    println!("  Notes:     {}", report.notes.len());
    println!("  Output:    {}", report.output_path.display());
    println!();
    Ok(())
}

async fn cmd_combine(
    ctx: &Context,
    inputs: Vec<PathBuf>,
    dir: Option<&Path>,
    file_name: &str,
    out: &Path,
) -> Result<()> {
    let inputs = match dir {
        Some(dir) => chapter_files(dir, file_name)?,
        None => inputs,
    };
    for input in &inputs {
        info!(chapter = %input.display(), "adding chapter");
    }

    let report = combine(&CombineConfig {
        inputs,
        output_path: out.to_path_buf(),
        parse: ctx.parse_options(None),
        gap_policy: ctx.gap_policy,
    })?;
    print_notes(&report.notes);

    println!();
    println!("  Chapters:  {}", report.chapters);
    println!("  Entries:   {}", report.top_level);
    println!("  Units:     {}", report.units);
    println!("  Output:    {}", report.output_path.display());
    println!();
    Ok(())
}

async fn cmd_show(ctx: &Context, outline: &Path, depth: Option<usize>) -> Result<()> {
    let parsed = load_outline(outline, &ctx.parse_options(None))?;
    print!("{}", render_listing(&parsed, depth));
    println!();
    println!(
        "  {} top-level entries, {} nodes",
        parsed.nodes.len(),
        parsed.node_count()
    );
    Ok(())
}

async fn cmd_strip(ctx: &Context, outline: &Path, out: &Path) -> Result<()> {
    let opts = ctx.parse_options(None);
    let mut parsed = load_outline(outline, &opts)?;
    strip_excerpts(&mut parsed.nodes);

    let document = render_outline(
        &parsed,
        None,
        &RenderOptions {
            annotation_field: opts.annotation_field.clone(),
            include_excerpts: false,
        },
    );
    write_json_atomic(out, &document)?;
    println!("  Stripped excerpts -> {}", out.display());
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config: AppConfig = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn print_notes(notes: &[ProcessingNote]) {
    for note in notes {
        println!("  note  {} [{:?}]: {}", note.node, note.kind, note.message);
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl GenerateProgress for CliProgress {
    fn node_done(&self, node_id: &str, outcome: NodeOutcome, completed: usize, _total: usize) {
        let verb = match outcome {
            NodeOutcome::Generated => "generated",
            NodeOutcome::Skipped => "skipped",
            NodeOutcome::Failed => "failed",
        };
        self.bar.set_position(completed as u64);
        self.bar.set_message(format!("{verb} {node_id}"));
    }

    fn done(&self, _report: &GenerateReport) {
        self.bar.finish_and_clear();
    }
}
