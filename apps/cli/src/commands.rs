//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use linetag_artifacts::ArtifactLayout;
use linetag_classifier::HttpClassifier;
use linetag_core::merger::{self, MergedTable};
use linetag_core::{
    FileSource, HttpPublisher, HttpSource, NoopNotifier, Notifier, PipelineDeps, PipelineOptions,
    ProgressReporter, Publisher, RecordSource, RetryPolicy, RunContext, RunSummary,
    WebhookNotifier, run_pipeline,
};
use linetag_shared::{
    AppConfig, BatchConfig, PassKind, ReferenceTaxonomy, RunId, expand_home, init_config,
    load_config, load_config_from, validate_api_key, webhook_url,
};
use linetag_storage::Storage;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Linetag: two-pass LLM classification of weekly keyword records.
#[derive(Parser)]
#[command(
    name = "linetag",
    version,
    about = "Classify weekly keyword records into product Lines and Items.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.linetag/linetag.toml).
    #[arg(long, global = true, env = "LINETAG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the full pipeline: line pass, item pass, merge, publish.
    Run {
        /// Local JSON file with the week's records.
        #[arg(long, conflicts_with = "source_url")]
        input: Option<PathBuf>,

        /// URL returning the week's records (overrides [source].url).
        #[arg(long)]
        source_url: Option<String>,

        /// Run date, YYYY-MM-DD (defaults to today).
        #[arg(long)]
        run_date: Option<String>,

        /// Reference taxonomy file (overrides [defaults].taxonomy_file).
        #[arg(long)]
        taxonomy: Option<PathBuf>,

        /// Records per chunk (overrides [batch].chunk_size).
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Chunks in flight (overrides [batch].concurrency).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Publish endpoint (overrides [publish].endpoint).
        #[arg(long)]
        endpoint: Option<String>,

        /// Skip publishing even if an endpoint is configured.
        #[arg(long)]
        no_publish: bool,

        /// Stop after a pass with failed chunks.
        #[arg(long)]
        halt_on_partial_failure: bool,
    },

    /// Re-merge the item pass chunk files of a run.
    Merge {
        /// Run date, YYYY-MM-DD.
        #[arg(long)]
        run_date: String,
    },

    /// Publish the merged table of a run.
    Publish {
        /// Run date, YYYY-MM-DD.
        #[arg(long)]
        run_date: String,

        /// Publish endpoint (overrides [publish].endpoint).
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Print the batch log of the latest run for a date.
    Log {
        /// Run date, YYYY-MM-DD.
        #[arg(long)]
        run_date: String,

        /// Only show one pass: line or item.
        #[arg(long)]
        pass: Option<PassKind>,
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
        0 => "linetag=info",
        1 => "linetag=debug",
        _ => "linetag=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Run {
            input,
            source_url,
            run_date,
            taxonomy,
            chunk_size,
            concurrency,
            endpoint,
            no_publish,
            halt_on_partial_failure,
        } => {
            let config = resolve_config(config_path.as_deref())?;
            let args = RunArgs {
                input,
                source_url,
                run_date,
                taxonomy,
                chunk_size,
                concurrency,
                endpoint,
                no_publish,
                halt_on_partial_failure,
            };
            cmd_run(&config, args).await
        }
        Command::Merge { run_date } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_merge(&config, &run_date)
        }
        Command::Publish { run_date, endpoint } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_publish(&config, &run_date, endpoint.as_deref()).await
        }
        Command::Log { run_date, pass } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_log(&config, &run_date, pass).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

fn parse_run_date(value: Option<&str>) -> Result<NaiveDate> {
    match value {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| eyre!("invalid run date '{s}': expected YYYY-MM-DD ({e})")),
        None => Ok(chrono::Local::now().date_naive()),
    }
}

fn layout_for(config: &AppConfig, run_date: Option<&str>) -> Result<ArtifactLayout> {
    let data_dir = expand_home(&config.defaults.data_dir);
    Ok(ArtifactLayout::new(data_dir, parse_run_date(run_date)?))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunArgs {
    input: Option<PathBuf>,
    source_url: Option<String>,
    run_date: Option<String>,
    taxonomy: Option<PathBuf>,
    chunk_size: Option<usize>,
    concurrency: Option<usize>,
    endpoint: Option<String>,
    no_publish: bool,
    halt_on_partial_failure: bool,
}

async fn cmd_run(config: &AppConfig, args: RunArgs) -> Result<()> {
    // Validate API key before doing anything
    let api_key = validate_api_key(config)?;

    let layout = layout_for(config, args.run_date.as_deref())?;
    let mut batch = BatchConfig::from(config);
    if let Some(size) = args.chunk_size {
        batch.chunk_size = size;
    }
    if let Some(concurrency) = args.concurrency {
        batch.concurrency = concurrency;
    }
    let ctx = RunContext::new(layout, batch)?;

    let taxonomy_path = args
        .taxonomy
        .unwrap_or_else(|| expand_home(&config.defaults.taxonomy_file));
    let taxonomy = ReferenceTaxonomy::load(&taxonomy_path)?;
    info!(
        path = %taxonomy_path.display(),
        lines = taxonomy.line_count(),
        items = taxonomy.item_count(),
        "taxonomy loaded"
    );

    let source_url = args.source_url.or_else(|| config.source.url.clone());
    let source: Box<dyn RecordSource> = match (args.input, source_url) {
        (Some(path), _) => Box::new(FileSource::new(path)),
        (None, Some(url)) => Box::new(HttpSource::new(&url)?),
        (None, None) => {
            return Err(eyre!(
                "no record source: pass --input or --source-url, or set [source].url"
            ));
        }
    };
    let records = source.fetch().await?;
    if records.is_empty() {
        return Err(eyre!("{} returned no records", source.describe()));
    }

    let notifier: Arc<dyn Notifier> = match webhook_url(config) {
        Some(url) => Arc::new(WebhookNotifier::new(&url)?),
        None => Arc::new(NoopNotifier),
    };
    let publisher = if args.no_publish {
        None
    } else {
        build_publisher(config, args.endpoint.as_deref(), RetryPolicy::from(&ctx.batch))?
    };

    let deps = PipelineDeps {
        classifier: Arc::new(HttpClassifier::from_config(&config.classifier, api_key)?),
        taxonomy: Arc::new(taxonomy),
        storage: Arc::new(Storage::open(&ctx.layout.db_path()).await?),
        notifier,
        publisher,
    };
    let options = PipelineOptions {
        passes: config.passes.clone(),
        halt_on_partial_failure: args.halt_on_partial_failure
            || config.defaults.halt_on_partial_failure,
    };

    info!(
        run_id = %ctx.run_id,
        run_date = %ctx.run_date_str(),
        records = records.len(),
        source = %source.describe(),
        "starting run"
    );

    let reporter = CliProgress::new();
    let result = run_pipeline(&ctx, &deps, &options, records, &reporter).await;
    reporter.finish();
    let summary = result?;

    print_summary(&summary, &ctx);
    Ok(())
}

fn build_publisher(
    config: &AppConfig,
    endpoint: Option<&str>,
    retry: RetryPolicy,
) -> Result<Option<Arc<dyn Publisher>>> {
    let Some(endpoint) = endpoint.or(config.publish.endpoint.as_deref()) else {
        return Ok(None);
    };
    let publisher: Arc<dyn Publisher> =
        Arc::new(HttpPublisher::new(endpoint, config.publish.batch_size, retry)?);
    Ok(Some(publisher))
}

fn print_summary(summary: &RunSummary, ctx: &RunContext) {
    println!();
    println!("  Run {}  ({})", summary.run_date, summary.status.as_str());
    println!("  ID:          {}", summary.run_id);
    println!("  Records:     {}", summary.records);
    println!("  {}", summary.line.summary());
    if let Some(item) = &summary.item {
        println!("  {}", item.summary());
    }
    if let (Some(rows), Some(resolved), Some(unresolved)) =
        (summary.merged_rows, summary.resolved, summary.unresolved)
    {
        println!("  Merged:      {rows} rows, {resolved} resolved, {unresolved} unresolved");
        println!("  Output:      {}", ctx.layout.merged_path().display());
    }
    if let Some(published) = summary.published {
        println!("  Published:   {published} rows");
    }
    println!("  Time:        {:.1}s", summary.elapsed_ms as f64 / 1000.0);
    println!();
}

// ---------------------------------------------------------------------------
// merge / publish / log
// ---------------------------------------------------------------------------

fn cmd_merge(config: &AppConfig, run_date: &str) -> Result<()> {
    let layout = layout_for(config, Some(run_date))?;

    // Every pass carries the full record set, so pass 1 fixes the expected count.
    let expected = merger::records_in_pass_dir(&layout, PassKind::Line)?;
    let table = merger::merge_pass_dir(&layout, PassKind::Item, expected)?;
    let meta = merger::write_merged_table(&layout, &table)?;

    println!(
        "Merged {} rows ({} resolved, {} unresolved) into {}",
        table.len(),
        table.resolved(),
        table.unresolved(),
        layout.merged_path().display()
    );
    println!("sha256 {}", meta.sha256);
    Ok(())
}

async fn cmd_publish(config: &AppConfig, run_date: &str, endpoint: Option<&str>) -> Result<()> {
    let layout = layout_for(config, Some(run_date))?;
    let table: MergedTable = layout.read_merged()?;

    let retry = RetryPolicy::from(&BatchConfig::from(config));
    let Some(publisher) = build_publisher(config, endpoint, retry)? else {
        return Err(eyre!("no publish endpoint: pass --endpoint or set [publish].endpoint"));
    };

    let acknowledged = publisher.publish(&table).await?;
    println!("Published {acknowledged} rows for {run_date}");
    Ok(())
}

async fn cmd_log(config: &AppConfig, run_date: &str, pass: Option<PassKind>) -> Result<()> {
    let layout = layout_for(config, Some(run_date))?;
    let storage = Storage::open_readonly(&layout.db_path()).await?;

    let Some(run) = storage.latest_run_for_date(&layout.run_date_str()).await? else {
        return Err(eyre!("no run recorded for {run_date}"));
    };
    let run_id: RunId = run.id.parse()?;
    let entries = storage.list_batch_log(&run_id, pass).await?;

    println!("run {}  status {}  started {}", run.id, run.status, run.started_at);
    println!(
        "{:<6} {:>5} {:>7} {:<8} {:>7} {:>8}  error",
        "pass", "chunk", "attempt", "outcome", "records", "ms"
    );
    for e in &entries {
        println!(
            "{:<6} {:>5} {:>7} {:<8} {:>7} {:>8}  {}",
            e.pass.as_str(),
            e.chunk_index,
            e.attempt,
            e.outcome.as_str(),
            e.records,
            e.duration_ms,
            e.error.as_deref().unwrap_or("")
        );
    }
    println!("{} attempts", entries.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner that turns into a chunk
/// counter while a pass is dispatching.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn chunk_finished(&self, pass: PassKind, done: usize, total: usize) {
        self.bar
            .set_message(format!("{pass} pass: chunk {done}/{total}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from([
            "linetag",
            "run",
            "--input",
            "records.json",
            "--run-date",
            "2026-10-12",
            "--chunk-size",
            "10",
        ]);
        let Command::Run {
            input, chunk_size, ..
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert_eq!(input, Some(PathBuf::from("records.json")));
        assert_eq!(chunk_size, Some(10));
    }

    #[test]
    fn input_and_source_url_conflict() {
        let result = Cli::try_parse_from([
            "linetag",
            "run",
            "--input",
            "records.json",
            "--source-url",
            "https://example.com/keywords",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn log_pass_accepts_aliases() {
        let cli = Cli::parse_from(["linetag", "log", "--run-date", "2026-10-12", "--pass", "pass2"]);
        let Command::Log { pass, .. } = cli.command else {
            panic!("expected log command");
        };
        assert_eq!(pass, Some(PassKind::Item));
    }

    #[test]
    fn run_date_parsing() {
        assert_eq!(
            parse_run_date(Some("2026-10-12")).unwrap(),
            NaiveDate::from_ymd_opt(2026, 10, 12).unwrap()
        );
        assert!(parse_run_date(Some("12/10/2026")).is_err());
    }
}
