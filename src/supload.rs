use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use walkdir::WalkDir;

use signed_upload::upload::{
    CommittedUpload, ItemId, LocalFile, PreviewRegistry, RunSummary, UploadQueue, UploadStatus,
    Uploader, detect_content_type, format_size,
};
use signed_upload::Config;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser, Debug)]
#[command(
    name = "supload",
    version = env!("CARGO_PKG_VERSION"),
    author = "Tyr Chen <tyr.chen@gmail.com>",
    about = "Upload files straight to object storage through short-lived signed grants",
    long_about = "Asks your grant endpoint for a signed upload URL per file, then sends each file \
                  directly to the object store with live progress. Failed files are reported and \
                  never retried automatically. Configure via .env file.",
    after_help = "Examples:\n  \
                  supload ./photo.png                     # Upload single file\n  \
                  supload ./assets -e png,jpg             # Upload images from a directory\n  \
                  supload ./assets -c 6 --json            # More workers, print committed list as JSON\n  \
                  supload ./assets --dry-run              # Show what would be uploaded\n\n\
                  Configuration (.env):\n  \
                  UPLOAD_GRANT_URL=https://app.example.com/api/uploads/sign\n  \
                  UPLOAD_IDENTITY_TOKEN=Bearer eyJ...\n  \
                  UPLOAD_IDENTITY_HEADER=authorization\n  \
                  UPLOAD_CONCURRENCY=3\n\n\
                  For more information: https://github.com/tyrchen/signed-upload"
)]
struct Cli {
    /// Files or directories to upload
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Only upload these file extensions (comma-separated, e.g., "png,jpg"); all files when empty
    #[arg(long, short = 'e', value_delimiter = ',')]
    extensions: Vec<String>,

    /// Maximum number of concurrent uploads (overrides UPLOAD_CONCURRENCY)
    #[arg(long, short = 'c')]
    concurrency: Option<usize>,

    /// Perform a dry run (show what would be uploaded without uploading)
    #[arg(long)]
    dry_run: bool,

    /// Print the committed uploads as JSON when done
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file early to get LOG_LEVEL
    dotenv::dotenv().ok();

    let log_level = log_level(
        std::env::var("LOG_LEVEL").ok(),
        std::env::var("RUST_LOG").ok(),
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_LEVEL)),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    info!("Signed Upload v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env()?;
    if let Some(concurrency) = cli.concurrency {
        Config::validate_concurrency(concurrency)?;
        config.concurrency = concurrency;
    }
    info!("Concurrent workers: {}", config.concurrency);

    let files = collect_files(&cli.paths, &cli.extensions)?;

    if files.is_empty() {
        println!("{}", style("No files found to upload").yellow());
        return Ok(());
    }

    if cli.dry_run {
        println!(
            "{}",
            style("🔍 DRY RUN MODE - No files will be uploaded")
                .yellow()
                .bold()
        );
        println!();

        for file in &files {
            let metadata = tokio::fs::metadata(file).await?;
            println!(
                "  {} {} ({}, {})",
                style("WOULD UPLOAD").green().bold(),
                file.display(),
                detect_content_type(file),
                format_size(metadata.len())
            );
        }
        return Ok(());
    }

    let mut local_files = Vec::with_capacity(files.len());
    for path in &files {
        let file = LocalFile::from_path(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        local_files.push(file);
    }

    let committed = Arc::new(Mutex::new(Vec::<CommittedUpload>::new()));
    let previews = PreviewRegistry::new();
    let queue = {
        let committed = Arc::clone(&committed);
        Arc::new(
            UploadQueue::new()
                .with_previews(previews.clone())
                .on_committed(move |uploads| {
                    debug!("Committed list now holds {} upload(s)", uploads.len());
                    *committed.lock() = uploads.to_vec();
                }),
        )
    };

    let uploader = Uploader::from_config(&config, Arc::clone(&queue))?;

    println!(
        "{}",
        style(format!("📦 Grant endpoint: {}", config.grant_url))
            .cyan()
            .bold()
    );
    println!(
        "{}",
        style(format!(
            "⚡ Uploading {} file(s) with {} workers...",
            local_files.len(),
            uploader.concurrency()
        ))
        .cyan()
    );

    let start = Instant::now();
    let ids = queue.enqueue(local_files);

    let (stop_tx, stop_rx) = oneshot::channel();
    let renderer = spawn_renderer(Arc::clone(&queue), MultiProgress::new(), stop_rx);

    let summary = uploader.upload(ids).await;

    let _ = stop_tx.send(());
    if let Err(e) = renderer.await {
        eprintln!("{} Progress renderer panic: {}", style("✗").red(), e);
    }

    println!();
    print_results(&queue, &summary);
    println!();
    print_summary(&summary, start);

    if cli.json {
        let committed = committed.lock().clone();
        println!(
            "{}",
            serde_json::to_string_pretty(&committed).context("Failed to encode results")?
        );
    }

    let cleared = queue.clear_finished();
    debug!(
        "Cleared {} finished item(s), {} preview(s) still outstanding",
        cleared,
        previews.outstanding()
    );

    if summary.failed > 0 {
        anyhow::bail!("{} upload(s) failed", summary.failed);
    }

    Ok(())
}

/// Collect all files to process from the given paths, filtered by extensions
fn collect_files(paths: &[PathBuf], allowed_extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    // Normalize extensions to lowercase for case-insensitive matching
    let extensions: Vec<String> = allowed_extensions
        .iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect();

    let matches = |path: &Path| {
        extensions.is_empty()
            || path
                .extension()
                .map(|ext| extensions.contains(&ext.to_string_lossy().to_lowercase()))
                .unwrap_or(false)
    };

    for path in paths {
        if path.is_file() {
            if matches(path) {
                files.push(path.to_path_buf());
            }
        } else if path.is_dir() {
            for entry in WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if matches(entry.path()) {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else {
            anyhow::bail!("Path does not exist: {}", path.display());
        }
    }

    Ok(files)
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Redraw one bar per queue item whenever the queue changes
fn spawn_renderer(
    queue: Arc<UploadQueue>,
    multi: MultiProgress,
    mut stop: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    let mut changes = queue.subscribe();
    tokio::spawn(async move {
        let mut bars: HashMap<ItemId, ProgressBar> = HashMap::new();
        loop {
            sync_bars(&queue, &multi, &mut bars);
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = &mut stop => break,
            }
        }
        sync_bars(&queue, &multi, &mut bars);
        for bar in bars.values() {
            bar.finish_and_clear();
        }
    })
}

fn sync_bars(queue: &UploadQueue, multi: &MultiProgress, bars: &mut HashMap<ItemId, ProgressBar>) {
    for item in queue.items() {
        let bar = bars.entry(item.id).or_insert_with(|| {
            let pb = multi.add(ProgressBar::new(100));
            pb.set_style(bar_style());
            pb
        });
        bar.set_position(item.progress as u64);
        bar.set_message(format!("{} [{}]", item.file.name(), item.status));
    }
}

fn log_level(log_level: Option<String>, rust_log: Option<String>) -> String {
    log_level
        .or(rust_log)
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
}

fn print_results(queue: &UploadQueue, summary: &RunSummary) {
    for item in queue.items() {
        match item.status {
            UploadStatus::Success => {
                println!(
                    "{} {} ({})",
                    style("✓").green(),
                    style(item.file.name()).green(),
                    style(format_size(item.file.size())).dim()
                );
                if let Some(url) = &item.public_url {
                    println!("  {} {}", style("🔗").blue(), style(url).dim());
                }
            }
            UploadStatus::Error => {
                println!(
                    "{} {} - {}",
                    style("✗").red(),
                    style(item.file.name()).red(),
                    style(item.error.as_deref().unwrap_or("Upload failed")).red()
                );
                if let Some(hint) = summary.hint(item.id) {
                    for line in hint.lines().skip(1) {
                        println!("  {}", style(line).dim());
                    }
                }
            }
            status => {
                println!(
                    "{} {} ({})",
                    style("…").yellow(),
                    style(item.file.name()).dim(),
                    status
                );
            }
        }
    }
}

fn print_summary(summary: &RunSummary, start: Instant) {
    let duration = start.elapsed();

    println!("{}", style("═".repeat(70)).dim());
    println!(
        "{}",
        style(format!(
            "Summary: {} uploaded, {} failed, {} skipped",
            summary.succeeded, summary.failed, summary.skipped
        ))
        .bold()
    );

    if summary.bytes > 0 {
        println!(
            "{}",
            style(format!(
                "Total uploaded: {} ({} bytes)",
                format_size(summary.bytes),
                summary.bytes
            ))
            .dim()
        );
    }

    if duration.as_secs() > 0 {
        let speed = summary.bytes as f64 / duration.as_secs_f64() / 1024.0 / 1024.0;
        println!(
            "{}",
            style(format!(
                "Time: {:.2}s, Average speed: {:.2} MB/s",
                duration.as_secs_f64(),
                speed
            ))
            .dim()
        );
    }
}
