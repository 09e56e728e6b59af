use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use quarry_core::bootstrap::resolve_config_path;
use quarry_core::config::LoggingConfig;
use quarry_core::{App, Config};
use quarry_index::{
    ChangeOutcome, IndexReport, ProgressEvent, SearchFilters, SearchQuery, SearchResponse,
};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "quarry", version, about = "Semantic code search for a local workspace")]
struct Cli {
    /// Configuration file (default: `QUARRY_CONFIG` or ./quarry.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Workspace root, overriding `workspace.root`.
    #[arg(long, short = 'w', global = true)]
    workspace: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index the workspace; unchanged files are skipped.
    Index {
        /// Print the session report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Search indexed code.
    Search(SearchArgs),
    /// Index, then keep the index current as files change.
    Watch,
    /// Show the last indexing session.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Show collection details and vector database health.
    Info,
    /// Drop every indexed point and all file metadata.
    Clear,
}

#[derive(Args)]
struct SearchArgs {
    #[arg(required = true)]
    query: Vec<String>,
    #[arg(long, default_value_t = 1)]
    page: usize,
    #[arg(long)]
    page_size: Option<usize>,
    /// Restrict to a language id (repeatable).
    #[arg(long = "lang")]
    languages: Vec<String>,
    /// Restrict to a file extension (repeatable).
    #[arg(long = "ext")]
    file_types: Vec<String>,
    #[arg(long)]
    min_similarity: Option<f32>,
    /// RFC 3339 timestamp or YYYY-MM-DD.
    #[arg(long, value_parser = parse_date)]
    modified_after: Option<DateTime<Utc>>,
    #[arg(long, value_parser = parse_date)]
    modified_before: Option<DateTime<Utc>>,
    /// Expand the query with LLM-suggested terms.
    #[arg(long, conflicts_with = "no_expand")]
    expand: bool,
    #[arg(long)]
    no_expand: bool,
    /// Re-rank the top results with the LLM.
    #[arg(long, conflicts_with = "no_rerank")]
    rerank: bool,
    #[arg(long)]
    no_rerank: bool,
    #[arg(long)]
    json: bool,
}

impl SearchArgs {
    fn to_query(&self) -> SearchQuery {
        let toggle = |on: bool, off: bool| match (on, off) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        SearchQuery {
            text: self.query.join(" "),
            filters: SearchFilters {
                languages: self.languages.clone(),
                file_types: self.file_types.clone(),
                modified_after: self.modified_after,
                modified_before: self.modified_before,
                min_similarity: self.min_similarity,
            },
            page: self.page,
            page_size: self.page_size,
            expand: toggle(self.expand, self.no_expand),
            rerank: toggle(self.rerank, self.no_rerank),
        }
    }
}

fn parse_date(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
        .ok_or_else(|| format!("invalid date {s:?}, expected RFC 3339 or YYYY-MM-DD"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let mut config = Config::load(&config_path)?;
    if let Some(root) = cli.workspace {
        config.workspace.root = root;
    }
    init_subscriber(&config.logging)?;

    let app = App::build(config).await?;
    match cli.command {
        Command::Index { json } => {
            let report = run_index(&app).await?;
            print_report(&report, json)?;
            if app.config().watch.enabled {
                watch(&app).await?;
            }
        }
        Command::Search(args) => {
            let response = app.query_engine().search(&args.to_query()).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_results(&response);
            }
        }
        Command::Watch => {
            let report = run_index(&app).await?;
            print_report(&report, false)?;
            watch(&app).await?;
        }
        Command::Status { json } => status(&app, json).await?,
        Command::Info => info(&app).await?,
        Command::Clear => {
            app.orchestrator().clear_index().await?;
            println!("index cleared");
        }
    }
    Ok(())
}

/// Logs go to stderr so stdout carries only results.
fn init_subscriber(logging: &LoggingConfig) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file_layer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// Run one session, logging progress; Ctrl-C cancels it.
async fn run_index(app: &App) -> anyhow::Result<IndexReport> {
    let orchestrator = Arc::clone(app.orchestrator());

    let mut events = orchestrator.subscribe();
    let progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => tracing::debug!("skipped {n} progress events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let interrupt = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received shutdown signal, cancelling");
                if let Err(e) = orchestrator.cancel() {
                    tracing::debug!("cancel ignored: {e}");
                }
            }
        })
    };

    let result = orchestrator.start_indexing().await;
    interrupt.abort();
    progress.abort();
    result.context("indexing failed")
}

fn log_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::PhaseChanged {
            phase,
            processed,
            total,
            ..
        } => tracing::info!(%phase, progress = format_args!("{processed}/{total}"), "phase"),
        ProgressEvent::FileCompleted {
            file,
            chunks,
            unchanged,
            processed,
            total,
            ..
        } => tracing::debug!(
            file = %file,
            chunks,
            unchanged,
            progress = format_args!("{processed}/{total}"),
            "file done"
        ),
        ProgressEvent::FileFailed { error, .. } => tracing::warn!("{error}"),
        ProgressEvent::StatusChanged { status } => tracing::debug!(%status, "status"),
        ProgressEvent::FileUpdated { file, chunks } => {
            tracing::info!(file = %file, chunks, "file updated");
        }
        ProgressEvent::FileRemoved { file } => tracing::info!(file = %file, "file removed"),
    }
}

fn print_report(report: &IndexReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let stats = &report.stats;
    println!(
        "indexed {}/{} files: {} chunks, {} unchanged, {} removed, {} errors ({} ms)",
        report.processed_files,
        report.total_files,
        stats.total_chunks,
        stats.files_unchanged,
        stats.files_removed,
        report.errors.len(),
        report.duration_ms
    );
    for (language, files) in &stats.files_by_language {
        println!("  {language:<12} {files} files");
    }
    for error in &report.errors {
        println!("  error: {error}");
    }
    Ok(())
}

fn print_results(response: &SearchResponse) {
    if response.results.is_empty() {
        println!("no results");
        return;
    }
    if let Some(expanded) = &response.expanded_query {
        println!("expanded query: {expanded}");
    }
    let offset = (response.page - 1) * response.page_size;
    for (i, result) in response.results.iter().enumerate() {
        let chunk = &result.chunk;
        println!(
            "{:>3}. {}:{}-{}  score {:.3} (similarity {:.3})",
            offset + i + 1,
            chunk.file_path,
            chunk.start_line,
            chunk.end_line,
            result.final_score,
            result.similarity
        );
        if let Some(signature) = chunk.signature.as_deref().or(chunk.name.as_deref()) {
            println!("     {signature}");
        }
        if let Some(why) = &result.explanation {
            println!("     why: {why}");
        }
        for line in chunk.content.lines().take(3) {
            println!("     | {line}");
        }
    }
    println!(
        "page {} ({} of {} files{}) in {} ms",
        response.page,
        response.results.len(),
        response.total_results,
        if response.has_more { ", more available" } else { "" },
        response.processing_time_ms
    );
}

async fn watch(app: &App) -> anyhow::Result<()> {
    let mut monitor = app.change_monitor()?;
    monitor.on_change(|outcome: &ChangeOutcome| {
        let path = outcome.event.path.display();
        match &outcome.error {
            None => tracing::info!(file = %path, kind = ?outcome.event.kind, "index updated"),
            Some(e) => tracing::warn!(file = %path, kind = ?outcome.event.kind, "index update failed: {e}"),
        }
    });
    monitor.start().context("failed to start file watcher")?;
    tracing::info!(workspace = %app.root().display(), "watching for changes, Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("received shutdown signal");
    monitor.stop();
    Ok(())
}

async fn status(app: &App, json: bool) -> anyhow::Result<()> {
    let last = app.metadata().last_session().await?;
    let files = app.metadata().indexed_paths().await?.len();
    let points = app
        .orchestrator()
        .collection_info()
        .await?
        .map_or(0, |c| c.points_count);

    if json {
        let value = serde_json::json!({
            "indexed_files": files,
            "points": points,
            "last_session": last,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("indexed files: {files}");
    println!("points:        {points}");
    match last {
        Some(session) => {
            let when = DateTime::from_timestamp(session.started_at, 0)
                .map_or_else(|| session.started_at.to_string(), |d| d.to_rfc3339());
            println!(
                "last session:  {} at {when}, {} ({}/{} files, {} chunks, {} errors)",
                session.id,
                session.outcome,
                session.processed_files,
                session.total_files,
                session.total_chunks,
                session.error_count
            );
        }
        None => println!("last session:  none"),
    }
    Ok(())
}

async fn info(app: &App) -> anyhow::Result<()> {
    let health = app.store().health_report().await;
    println!(
        "vector store:  {} ({} ms){}",
        if health.healthy { "healthy" } else { "unhealthy" },
        health.response_time_ms,
        health
            .error
            .as_deref()
            .map(|e| format!(", {e}"))
            .unwrap_or_default()
    );
    if let Some(count) = health.collections_count {
        println!("collections:   {count}");
    }
    match app.orchestrator().collection_info().await {
        Ok(Some(info)) => {
            println!("collection:    {}", info.name);
            println!("points:        {}", info.points_count);
            if let Some(size) = info.vector_size {
                println!("vector size:   {size}");
            }
            if let Some(distance) = info.distance {
                println!("distance:      {distance:?}");
            }
        }
        Ok(None) => println!("collection:    {} (not created)", app.store().collection()),
        Err(e) => println!("collection:    unavailable ({e})"),
    }
    Ok(())
}
