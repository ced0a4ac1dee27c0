//! report-harvest CLI - analyst report harvester.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use report_harvest::{
    analyst_jobs, browser_setup, load_roster, ChromeLauncher, DateRange, HarvestConfig, Harvester,
    PortalLauncher, SearchQuery, SearchSession,
};

/// Report Harvest - download analyst reports from the research portal
#[derive(Parser)]
#[command(name = "report-harvest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write plain log lines to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Search and download reports for every analyst in a roster
    Run(RunArgs),

    /// Search a single analyst and print the references found
    Search(SearchArgs),

    /// Show the Chrome executable that would be used
    Chrome,
}

/// Options shared by subcommands that drive the portal.
#[derive(Args)]
struct PortalArgs {
    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Proxy URL (e.g., http://127.0.0.1:8080 or socks5://127.0.0.1:1080)
    #[arg(short, long)]
    proxy: Option<String>,

    /// Last publication year searched (range starts 1999-01-01)
    #[arg(long)]
    cutoff_year: Option<i32>,
}

#[derive(Parser)]
struct RunArgs {
    /// Roster file (JSON export of the analyst spreadsheet)
    roster: PathBuf,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum download requests per rate window
    #[arg(long)]
    rate_limit: Option<usize>,

    /// Analysts processed concurrently
    #[arg(short, long)]
    workers: Option<usize>,

    #[command(flatten)]
    portal: PortalArgs,
}

#[derive(Parser)]
struct SearchArgs {
    /// Analyst first name
    #[arg(long)]
    first: String,

    /// Analyst last name
    #[arg(long)]
    last: String,

    /// Contributor (broker) name as listed by the portal
    #[arg(long)]
    contributor: String,

    /// Output format
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    #[command(flatten)]
    portal: PortalArgs,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let config = match &cli.config {
        Some(path) => HarvestConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => HarvestConfig::default(),
    };

    match cli.command {
        Commands::Run(args) => run_harvest(config, args).await,
        Commands::Search(args) => run_search(config, args).await,
        Commands::Chrome => show_chrome(&config),
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,report_harvest={}", level)));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn apply_portal_args(mut config: HarvestConfig, args: &PortalArgs) -> Result<HarvestConfig> {
    if args.headed {
        config = config.with_headed(true);
    }
    if let Some(proxy) = &args.proxy {
        config = config.with_proxy(proxy.as_str());
    }
    if let Some(year) = args.cutoff_year {
        config.dates = DateRange::through_year_end(year)?;
    }
    config.validate()?;
    Ok(config)
}

fn launcher(config: &HarvestConfig) -> Arc<dyn PortalLauncher> {
    Arc::new(ChromeLauncher::new(
        config.browser.clone(),
        config.portal.clone(),
    ))
}

async fn run_harvest(config: HarvestConfig, args: RunArgs) -> Result<()> {
    let mut config = config;
    if let Some(output) = &args.output {
        config = config.with_output_dir(output);
    }
    if let Some(max_requests) = args.rate_limit {
        config = config.with_rate_limit(max_requests);
    }
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    let config = apply_portal_args(config, &args.portal)?;

    let records = load_roster(&args.roster)
        .await
        .with_context(|| format!("loading roster {}", args.roster.display()))?;
    let jobs = analyst_jobs(&records, config.dates);
    if jobs.is_empty() {
        warn!("Roster contains no analysts with a broker name");
        return Ok(());
    }

    let harvester = Harvester::from_config(&config, launcher(&config))?;
    let summary = harvester.process_all(&jobs).await;

    println!(
        "\nHarvest finished: {} analysts, {} reports found, {} downloaded, {} failed\n",
        summary.analysts.len(),
        summary.found(),
        summary.downloaded(),
        summary.failed()
    );
    for analyst in &summary.analysts {
        println!(
            "  {:<30} {:?}: {} found, {} downloaded, {} failed",
            analyst.analyst, analyst.status, analyst.found, analyst.downloaded, analyst.failed
        );
    }

    Ok(())
}

async fn run_search(config: HarvestConfig, args: SearchArgs) -> Result<()> {
    let config = apply_portal_args(config, &args.portal)?;
    let session = SearchSession::new(launcher(&config), config.session.clone());

    let query = SearchQuery::new(&args.first, &args.last, &args.contributor).with_dates(config.dates);
    let run = session.search(&query).await;

    match args.format {
        OutputFormat::Text => {
            println!(
                "\nSearch for {} at {}: {:?} after {} attempt(s), {} reports\n",
                query.analyst_name(),
                query.contributor,
                run.status,
                run.attempts,
                run.references.len()
            );
            for (i, report) in run.references.iter().enumerate() {
                println!("{}. {} ({})", i + 1, report.document_id, report.year);
                println!(
                    "   URL: {}",
                    report_harvest::document_url(&config.portal.document_base_url, &report.document_id)
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&run.references)?);
        }
    }

    Ok(())
}

fn show_chrome(config: &HarvestConfig) -> Result<()> {
    let path = browser_setup::resolve_chrome(config.browser.chrome_path.as_deref())?;
    println!("{}", path.display());
    Ok(())
}
