mod browser;
mod config;
mod export;
mod extract;
mod inference;
mod paginate;
mod pipeline;
mod sanitize;
mod schema;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::browser::chrome::ChromeSession;
use crate::browser::snapshot::SnapshotBrowser;
use crate::browser::{Browser, WaitUntil};
use crate::config::Settings;
use crate::inference::{OpenAiService, SchemaInference};
use crate::paginate::{PaginationController, Termination};
use crate::pipeline::{Pipeline, RunReport};

#[derive(Parser)]
#[command(name = "review_scraper", about = "Product review scraper with inferred selectors")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Infer selectors for a product page and export every review to CSV
    Run {
        url: String,
        /// Output file (default: derived from the URL host)
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Show the browser window
        #[arg(long)]
        headed: bool,
    },
    /// Print the sanitized form of a saved HTML page
    Sanitize { file: PathBuf },
    /// Walk saved pages with a saved service reply, without a browser or network
    Replay {
        /// File holding the service's reply
        #[arg(short, long)]
        schema: PathBuf,
        /// Saved pages, in pagination order
        #[arg(required = true)]
        pages: Vec<PathBuf>,
        #[arg(short, long, default_value = "reviews.csv")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { url, out, headed } => {
            let mut settings = Settings::load().context("loading settings")?;
            if headed {
                settings.browser.headless = false;
            }
            run(&settings, &url, out).await
        }
        Commands::Sanitize { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let sanitized = sanitize::sanitize(&raw);
            if let Some(vendor) = sanitized.vendor {
                eprintln!("Review widget: {}", vendor);
            }
            if sanitized.degraded {
                eprintln!("Widget markup is unbalanced; showing the whole page");
            }
            println!("{}", sanitized.html);
            Ok(())
        }
        Commands::Replay { schema, pages, out } => {
            let settings = Settings::load().context("loading settings")?;
            replay(&settings, &schema, &pages, &out).await
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run(settings: &Settings, url: &str, out: Option<PathBuf>) -> anyhow::Result<()> {
    url::Url::parse(url).with_context(|| format!("invalid URL: {}", url))?;
    let Some(api_key) = settings.api_key() else {
        bail!("No API key: set OPENAI_API_KEY or REVIEWS_SERVICE__API_KEY");
    };
    let service = OpenAiService::new(&settings.service, api_key)?;

    let pb = spinner()?;
    let pipeline = Pipeline::new(SchemaInference::new(service), settings).with_progress(pb.clone());

    let poll = settings.timing.poll_interval();
    let mut snapshot = ChromeSession::launch(&settings.browser, poll)
        .await
        .context("launching browser")?;
    let mut extraction = match ChromeSession::launch(&settings.browser, poll).await {
        Ok(session) => session,
        Err(e) => {
            if let Err(close_err) = snapshot.close().await {
                warn!("{}", close_err);
            }
            return Err(e).context("launching second browser");
        }
    };

    let report = pipeline.run_with_sessions(&mut snapshot, &mut extraction, url).await;

    for session in [snapshot, extraction] {
        if let Err(e) = session.close().await {
            warn!("{}", e);
        }
    }
    pb.finish_and_clear();
    if let Some(schema) = &report.schema {
        info!("Selectors used:\n{}", schema);
    }

    let out = out.unwrap_or_else(|| PathBuf::from(export::default_filename(url)));
    finish(&report.records, report.pages, &out)?;
    report_failure(&report)
}

async fn replay(
    settings: &Settings,
    schema_file: &Path,
    pages: &[PathBuf],
    out: &Path,
) -> anyhow::Result<()> {
    let reply = std::fs::read_to_string(schema_file)
        .with_context(|| format!("reading {}", schema_file.display()))?;
    let schema = inference::recover_schema(&reply).context("parsing saved reply")?;
    info!("Selectors used:\n{}", schema);

    let mut browser = SnapshotBrowser::from_files(pages).context("reading saved pages")?;
    let first = pages.first().map(|p| p.display().to_string()).unwrap_or_default();
    browser.navigate(&first, WaitUntil::Load).await?;

    let mut config = settings.pagination_config();
    config.settle_delay = Duration::ZERO;
    let pb = spinner()?;
    let outcome = PaginationController::new(&schema, config)
        .with_progress(pb.clone())
        .run(&mut browser)
        .await;
    pb.finish_and_clear();
    debug!("Replay trace: {:?}", outcome.trace);

    finish(&outcome.records, outcome.pages, out)?;
    if let Termination::Failed(e) = outcome.termination {
        bail!("replay stopped early: {}", e);
    }
    Ok(())
}

fn spinner() -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

fn finish(records: &[extract::Record], pages: usize, out: &Path) -> anyhow::Result<()> {
    export::write_csv(out, records).with_context(|| format!("writing {}", out.display()))?;
    println!(
        "Saved {} reviews from {} page(s) to {}",
        records.len(),
        pages,
        out.display()
    );
    Ok(())
}

fn report_failure(report: &RunReport) -> anyhow::Result<()> {
    match &report.failure {
        None => Ok(()),
        Some(failure) if !report.records.is_empty() => {
            warn!("{} finished with partial results: {}", report.url, failure);
            Ok(())
        }
        Some(failure) => bail!("{}: {}", report.url, failure),
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
