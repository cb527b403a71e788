use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use url::Url;
use uuid::Uuid;

use marginalia_core::{
    copy_id_for, AnchorBody, HighlightColor, MatchKind, PageRegion, ReadingPosition,
};
use marginalia_http::HttpAnnotationService;
use marginalia_sync::{
    AnchorDraft, AnnotationService, AnnotationStore, MemoryAnnotationService, ProgressTracker,
    SearchController, DEFAULT_QUIET_WINDOW, RESULT_PAGE_SIZE,
};

#[derive(Debug, Parser)]
#[command(
    name = "marginalia",
    version,
    about = "annotation client for paginated documents"
)]
struct Args {
    /// Base URL of the annotation service; omit to run against an ephemeral
    /// in-memory store
    #[arg(long = "base-url")]
    base_url: Option<Url>,

    /// Reader name used to derive the document-copy id
    #[arg(long)]
    reader: Option<String>,

    /// Document name used to derive the document-copy id
    #[arg(long)]
    document: Option<String>,

    /// Explicit document-copy id (overrides --reader/--document derivation)
    #[arg(long = "copy")]
    copy: Option<Uuid>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// List anchors for the document copy
    List {
        /// Restrict to a single page
        #[arg(long)]
        page: Option<u32>,
    },
    /// Create a comment anchored at a point
    Comment {
        #[arg(long)]
        page: u32,
        #[arg(long)]
        x: f32,
        #[arg(long)]
        y: f32,
        /// The selected text the comment is anchored to
        #[arg(long)]
        text: String,
        /// Comment body
        #[arg(long)]
        body: String,
    },
    /// Create a highlight over a rectangle
    Highlight {
        #[arg(long)]
        page: u32,
        #[arg(long)]
        x: f32,
        #[arg(long)]
        y: f32,
        #[arg(long)]
        width: f32,
        #[arg(long)]
        height: f32,
        /// The selected text the highlight covers
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "yellow")]
        color: String,
    },
    /// Delete an anchor by id
    Delete { id: Uuid },
    /// Search annotations through the semantic index
    Search {
        query: String,
        /// Result page to display
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    /// Record the reading position
    Progress {
        #[arg(long)]
        page: u32,
        #[arg(long)]
        total: u32,
        #[arg(long, default_value_t = 1.0)]
        zoom: f32,
    },
}

/// Optional `config.toml` under the platform config directory. Flags
/// override file values.
#[derive(Debug, Default, Deserialize)]
struct Config {
    base_url: Option<Url>,
    reader: Option<String>,
    quiet_window_ms: Option<u64>,
    page_size: Option<usize>,
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {:?}", path))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config at {:?}", path))
}

fn parse_color(value: &str) -> Result<HighlightColor> {
    match value.to_lowercase().as_str() {
        "yellow" => Ok(HighlightColor::Yellow),
        "green" => Ok(HighlightColor::Green),
        "blue" => Ok(HighlightColor::Blue),
        "pink" => Ok(HighlightColor::Pink),
        other => Err(anyhow!("unknown highlight color: {other}")),
    }
}

fn kind_label(kind: MatchKind) -> &'static str {
    match kind {
        MatchKind::Comment => "comment",
        MatchKind::Highlight => "highlight",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "marginalia", "marginalia")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config_path = project_dirs.config_dir().join("config.toml");
    let config = load_config(&config_path).unwrap_or_else(|err| {
        warn!(error = %err, "ignoring unreadable config file");
        Config::default()
    });

    let base_url = args.base_url.clone().or_else(|| config.base_url.clone());
    let service: Arc<dyn AnnotationService> = match &base_url {
        Some(url) => Arc::new(HttpAnnotationService::new(url.clone())),
        None => {
            warn!("no base URL configured; using an ephemeral in-memory store");
            Arc::new(MemoryAnnotationService::new())
        }
    };

    let reader = args
        .reader
        .clone()
        .or_else(|| config.reader.clone())
        .unwrap_or_else(|| "reader".to_string());
    let copy_id = match args.copy {
        Some(id) => id,
        None => {
            let document = args
                .document
                .clone()
                .ok_or_else(|| anyhow!("either --copy or --document is required"))?;
            copy_id_for(&reader, &document)
        }
    };

    run(args.command, service, copy_id, &config).await
}

async fn run(
    command: CliCommand,
    service: Arc<dyn AnnotationService>,
    copy_id: Uuid,
    config: &Config,
) -> Result<()> {
    match command {
        CliCommand::List { page } => {
            let mut store = AnnotationStore::new(service, copy_id);
            store
                .load()
                .await
                .context("failed to load annotations")?;
            let anchors: Vec<_> = match page {
                Some(page) => store.on_page(page).collect(),
                None => store.anchors().iter().collect(),
            };
            if anchors.is_empty() {
                println!("no annotations");
                return Ok(());
            }
            for anchor in anchors {
                match &anchor.body {
                    AnchorBody::Comment { body } => {
                        println!(
                            "{}  p{:<4} comment    {:?} -- {}",
                            anchor.id, anchor.page, anchor.text, body
                        );
                    }
                    AnchorBody::Highlight { color } => {
                        println!(
                            "{}  p{:<4} highlight  {:?} [{}]",
                            anchor.id,
                            anchor.page,
                            anchor.text,
                            color.as_str()
                        );
                    }
                }
            }
        }
        CliCommand::Comment {
            page,
            x,
            y,
            text,
            body,
        } => {
            let mut store = AnnotationStore::new(service, copy_id);
            let id = store
                .create(AnchorDraft {
                    copy_id,
                    page,
                    region: PageRegion::Point { x, y },
                    text,
                    body: AnchorBody::Comment { body },
                })
                .await
                .context("create failed; the request was not retried")?;
            println!("created {id}");
        }
        CliCommand::Highlight {
            page,
            x,
            y,
            width,
            height,
            text,
            color,
        } => {
            let color = parse_color(&color)?;
            let mut store = AnnotationStore::new(service, copy_id);
            let id = store
                .create(AnchorDraft {
                    copy_id,
                    page,
                    region: PageRegion::Rect {
                        x,
                        y,
                        width,
                        height,
                    },
                    text,
                    body: AnchorBody::Highlight { color },
                })
                .await
                .context("create failed; the request was not retried")?;
            println!("created {id}");
        }
        CliCommand::Delete { id } => {
            let mut store = AnnotationStore::new(service, copy_id);
            store
                .remove(id)
                .await
                .context("failed to delete annotation")?;
            println!("deleted {id}");
        }
        CliCommand::Search { query, page } => {
            let page_size = config.page_size.unwrap_or(RESULT_PAGE_SIZE);
            let mut controller = SearchController::with_page_size(Some(copy_id), page_size);
            controller
                .run(service.as_ref(), &query)
                .await
                .context("search failed")?;
            controller.go_to_page(page);
            let view = controller.page();
            if view.items.is_empty() {
                println!("no matches");
                return Ok(());
            }
            println!("page {}/{}", view.index, view.total_pages);
            for hit in view.items {
                println!(
                    "{:>5.2}  p{:<4} {:<9}  {}",
                    hit.score,
                    hit.page,
                    kind_label(hit.kind),
                    hit.excerpt
                );
            }
        }
        CliCommand::Progress { page, total, zoom } => {
            let quiet = config
                .quiet_window_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_QUIET_WINDOW);
            let tracker = ProgressTracker::with_quiet_window(
                service,
                ReadingPosition::new(copy_id, page, total, zoom),
                quiet,
            );
            tracker.record(page, total, zoom);
            // One-shot invocation: persist immediately instead of waiting out
            // the quiet window.
            tracker.flush().await;
            let position = tracker.position();
            println!(
                "saved page {}/{} ({:.0}% read)",
                position.page,
                position.total_pages,
                position.percent_complete()
            );
        }
    }
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "marginalia.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // Keep stdout clean for subcommand output.
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.toml")).unwrap();
        assert!(config.base_url.is_none());
        assert!(config.reader.is_none());
    }

    #[test]
    fn config_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "base_url = \"https://api.example.com/v1\"\nreader = \"ada\"\nquiet_window_ms = 500\npage_size = 5\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(
            config.base_url.unwrap().as_str(),
            "https://api.example.com/v1"
        );
        assert_eq!(config.reader.as_deref(), Some("ada"));
        assert_eq!(config.quiet_window_ms, Some(500));
        assert_eq!(config.page_size, Some(5));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "base_url = 12").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn highlight_colors_parse_case_insensitively() {
        assert_eq!(parse_color("Green").unwrap(), HighlightColor::Green);
        assert!(parse_color("mauve").is_err());
    }
}
