//! cadtrans command line: translate annotation lists, inspect the cache and
//! history, and run health checks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::{info, warn};

use cadtrans::config::Config;
use cadtrans::diagnostics::{run_diagnostics, Severity};
use cadtrans::error::WorkflowError;
use cadtrans::progress::{ProgressSink, ProgressUpdate};
use cadtrans::workflow::{EntityUpdate, EntityUpdater, SourceText, TextSource, UpdateSummary};
use cadtrans::{init_tracing, AppContext};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a text file, one annotation per line
    Translate {
        /// Input file; lines are `text` or `layer<TAB>text`
        #[arg(short, long)]
        input: PathBuf,

        /// Target language code
        #[arg(short, long, default_value = "en")]
        lang: String,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only translate these layers (repeatable)
        #[arg(long = "layer")]
        layers: Vec<String>,

        /// Override the configured batch size
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show cache statistics
    Stats,

    /// Remove cached translations
    ClearCache {
        /// Only this target language
        #[arg(long)]
        lang: Option<String>,
    },

    /// Show recent history records
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Check API key, connectivity and cache health
    Doctor,
}

/// Annotations read from a line-oriented file.
struct LineFileSource {
    items: Vec<SourceText>,
}

impl LineFileSource {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let items = content
            .lines()
            .enumerate()
            .map(|(no, line)| {
                let (layer, text) = match line.split_once('\t') {
                    Some((layer, text)) => (layer.to_string(), text.to_string()),
                    None => ("0".to_string(), line.to_string()),
                };
                SourceText {
                    handle: format!("L{}", no + 1),
                    text,
                    layer,
                    kind: "TEXT".into(),
                }
            })
            .collect();
        Ok(Self { items })
    }
}

#[async_trait]
impl TextSource for LineFileSource {
    async fn collect(&self, layers: &[String]) -> Result<Vec<SourceText>, WorkflowError> {
        Ok(self
            .items
            .iter()
            .filter(|s| !s.text.trim().is_empty())
            .filter(|s| layers.is_empty() || layers.contains(&s.layer))
            .cloned()
            .collect())
    }
}

/// Collects translated text per handle for writing out afterwards.
#[derive(Default)]
struct MapUpdater {
    applied: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl EntityUpdater for MapUpdater {
    async fn apply(&self, updates: Vec<EntityUpdate>) -> UpdateSummary {
        let mut applied = self.applied.lock();
        let n = updates.len();
        for update in updates {
            applied.insert(update.handle, update.new_text);
        }
        UpdateSummary { applied: n, failed: 0 }
    }
}

/// Prints progress to stderr.
struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn report(&self, update: ProgressUpdate) {
        eprintln!(
            "progress {}/{} ({:5.1}%)",
            update.completed, update.total, update.percent
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = Config::load_or_default(args.config.as_deref())?;
    if let Commands::Translate {
        batch_size: Some(n),
        ..
    } = &args.command
    {
        config.engine.batch_size = *n;
    }

    let ctx = AppContext::open(config)?;
    let result = run(&ctx, args.command).await;
    ctx.shutdown().await;
    result
}

async fn run(ctx: &AppContext, command: Commands) -> Result<()> {
    match command {
        Commands::Translate {
            input,
            lang,
            output,
            layers,
            ..
        } => {
            let source = LineFileSource::load(&input)?;
            let updater = MapUpdater::default();
            let translator = ctx.layer_translator();

            let coordinator = std::sync::Arc::clone(&ctx.coordinator);
            let ctrl_c = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after the current batch");
                    coordinator.cancel_current();
                }
            });

            let report = translator
                .translate_layers(&source, &updater, &layers, &lang, &ConsoleProgress)
                .await?;
            ctrl_c.abort();

            let applied = updater.applied.lock();
            let lines: Vec<&str> = source
                .items
                .iter()
                .map(|item| {
                    applied
                        .get(&item.handle)
                        .map(String::as_str)
                        .unwrap_or(item.text.as_str())
                })
                .collect();
            let mut text = lines.join("\n");
            text.push('\n');
            match output {
                Some(path) => std::fs::write(&path, text)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => print!("{text}"),
            }

            info!(run_id = %report.run_id, "translate finished");
            let summary = serde_json::json!({
                "report": report,
                "timings": ctx.metrics.snapshot(),
            });
            eprintln!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Stats => {
            let stats = ctx.cache.statistics().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            if stats.exceeds(ctx.config.cache.warn_threshold) {
                warn!(
                    entries = stats.total_count,
                    threshold = ctx.config.cache.warn_threshold,
                    "cache is larger than the warning threshold"
                );
            }
        }
        Commands::ClearCache { lang } => {
            let removed = ctx.cache.clear(lang).await?;
            println!("removed {removed} cached translations");
        }
        Commands::History { limit } => {
            for record in ctx.history.query_recent(limit)? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::Doctor => {
            let report = run_diagnostics(
                &ctx.cache,
                ctx.client.as_ref(),
                ctx.config.cache.warn_threshold,
            )
            .await;
            for check in &report.checks {
                println!("[{}] {}: {}", check.severity, check.name, check.message);
            }
            if report.overall() == Severity::Fail {
                anyhow::bail!("health check failed");
            }
        }
    }
    Ok(())
}
