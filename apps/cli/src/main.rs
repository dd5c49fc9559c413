use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use telespool_core::{
    Acquisition, Category, ClientConfig, FilePreferences, HttpTransport, MatchEvent, Payload,
    PayloadValue, Resource, Source, TelemetryClient,
};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::format::{format_duration, format_flush, format_record};

mod format;

/// CLI wrapper for Category (needed for clap ValueEnum)
#[derive(Clone, Copy, ValueEnum)]
enum CliCategory {
    Progression,
    Resource,
    Metric,
    Positional,
}

impl From<CliCategory> for Category {
    fn from(cli: CliCategory) -> Self {
        match cli {
            CliCategory::Progression => Category::Progression,
            CliCategory::Resource => Category::Resource,
            CliCategory::Metric => Category::Metric,
            CliCategory::Positional => Category::Positional,
        }
    }
}

#[derive(Parser)]
#[command(name = "telespool")]
#[command(version, about = "Record, inspect and deliver spooled game telemetry")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML client configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the spool directory
    #[arg(long, global = true)]
    spool_dir: Option<PathBuf>,

    /// Override the collector endpoint
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Key namespace segments, e.g. `-n arena -n multiplayer`
    #[arg(short, long = "namespace", global = true)]
    namespace: Vec<String>,

    /// Preference file holding the opt-in flag
    #[arg(long, global = true)]
    prefs: Option<PathBuf>,

    /// Write this session's key,value log to a CSV file in DIR
    #[arg(long, global = true, value_name = "DIR")]
    export: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Record an event with arbitrary payload fields
    Record {
        #[arg(value_enum)]
        category: CliCategory,
        key: String,
        /// Payload field as name=value; numbers are stored as numbers
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, PayloadValue)>,
    },

    /// Record a numeric metric
    Metric { key: String, value: f64 },

    /// Record a 2D position as correlated x/y events
    Positional {
        key: String,
        #[arg(allow_hyphen_values = true)]
        x: f64,
        #[arg(allow_hyphen_values = true)]
        y: f64,
    },

    /// Record a match lifecycle event (match_start, match_win, match_loss)
    Match {
        event: MatchEvent,
        #[arg(short, long, default_value_t = 0.0)]
        score: f64,
    },

    /// Record a resource gain (positive) or loss (negative)
    Resource {
        resource: Resource,
        #[arg(allow_hyphen_values = true)]
        amount: f64,
        #[arg(long)]
        how: Acquisition,
        #[arg(long)]
        from: Source,
    },

    /// Deliver everything pending now
    Flush,

    /// List records not yet acknowledged by the collector
    Pending {
        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Drop acknowledged records from the spool journal
    Compact,

    /// Opt in to telemetry collection
    OptIn,

    /// Opt out of telemetry collection
    OptOut,

    /// Show client state
    Status,
}

fn parse_field(s: &str) -> Result<(String, PayloadValue), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {s:?}"))?;
    let value = match value.parse::<f64>() {
        Ok(n) if n.is_finite() => PayloadValue::Number(n),
        _ => PayloadValue::Text(value.to_string()),
    };
    Ok((name.to_string(), value))
}

fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow::anyhow!("invalid log filter: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(dir) = &cli.spool_dir {
        config.spool_dir = dir.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    config.validate()?;
    debug!(
        endpoint = %config.endpoint,
        spool_dir = %config.spool_dir.display(),
        "Configuration loaded"
    );
    Ok(config)
}

fn report_id(what: &str, id: Option<u64>) {
    match id {
        Some(id) => println!(
            "{} Recorded {} {}",
            style("✓").green().bold(),
            what,
            style(format!("#{id}")).dim()
        ),
        None => println!(
            "{} Not recorded {}",
            style("-").dim(),
            style("(opted out)").dim()
        ),
    }
}

async fn finish(client: &TelemetryClient, cli: &Cli) -> Result<()> {
    let start = Instant::now();
    let spinner = create_spinner("Delivering...");
    let report = client.shutdown().await;
    if report.batches > 0 {
        spinner.finish_with_message(format_flush(&report, start.elapsed()));
    } else {
        spinner.finish_and_clear();
    }

    if let Some(dir) = &cli.export
        && let Some(path) = client.export_csv(dir)?
    {
        println!(
            "{} {}",
            style("Exported:").dim(),
            style(path.display()).cyan()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let config = load_config(&cli)?;
    let prefs_path = cli
        .prefs
        .clone()
        .unwrap_or_else(FilePreferences::default_path);
    let prefs = FilePreferences::open(&prefs_path)
        .with_context(|| format!("opening preferences {}", prefs_path.display()))?;
    let transport = HttpTransport::new(config.endpoint.clone(), config.request_timeout)?;
    let endpoint = config.endpoint.clone();
    let spool_dir = config.spool_dir.clone();

    let client = TelemetryClient::new(Arc::new(prefs), Arc::new(transport));
    client.init(config)?;
    client.set_namespace(cli.namespace.iter().cloned())?;

    match &cli.command {
        Command::Record {
            category,
            key,
            fields,
        } => {
            let payload: Payload = fields.iter().cloned().collect();
            let id = client.record((*category).into(), key, payload)?;
            report_id(key, id);
            finish(&client, &cli).await?;
        }
        Command::Metric { key, value } => {
            let id = client.record_metric(key, *value)?;
            report_id(key, id);
            finish(&client, &cli).await?;
        }
        Command::Positional { key, x, y } => {
            match client.record_positional(key, *x, *y)? {
                Some(correlation) => println!(
                    "{} Recorded {} x/y {}",
                    style("✓").green().bold(),
                    key,
                    style(correlation).dim()
                ),
                None => report_id(key, None),
            }
            finish(&client, &cli).await?;
        }
        Command::Match { event, score } => {
            let id = client.record_match(*event, *score)?;
            report_id(event.as_str(), id);
            finish(&client, &cli).await?;
        }
        Command::Resource {
            resource,
            amount,
            how,
            from,
        } => {
            let id = client.record_resource(*resource, *amount, *how, *from)?;
            report_id(resource.as_str(), id);
            finish(&client, &cli).await?;
        }
        Command::Flush => {
            let start = Instant::now();
            let spinner = create_spinner(&format!("Flushing to {}...", endpoint));
            let report = client.flush().await;
            spinner.finish_with_message(format_flush(&report, start.elapsed()));
            finish(&client, &cli).await?;
        }
        Command::Pending { json } => {
            let pending = client.pending();
            if *json {
                for record in &pending {
                    println!("{}", serde_json::to_string(record)?);
                }
            } else {
                for record in &pending {
                    println!("{}", format_record(record));
                }
                println!(
                    "\n{} {}",
                    style("Pending:").dim(),
                    style(pending.len()).cyan().bold()
                );
            }
        }
        Command::Compact => {
            let start = Instant::now();
            if let Some(stats) = client.compact()? {
                println!(
                    "{} Compacted: {} removed, {} retained, watermark {} {}",
                    style("✓").green().bold(),
                    stats.removed,
                    stats.retained,
                    stats.watermark,
                    style(format!("[{}]", format_duration(start.elapsed()))).dim()
                );
            }
        }
        Command::OptIn | Command::OptOut => {
            let value = matches!(cli.command, Command::OptIn);
            client.set_opt_in(value)?;
            println!(
                "{} Telemetry {}",
                style("✓").green().bold(),
                if value {
                    style("enabled").green()
                } else {
                    style("disabled").yellow()
                }
            );
        }
        Command::Status => {
            let stats = client.stats();
            println!(
                "\n{}  {}\n",
                style("telespool").cyan().bold(),
                style("status").dim()
            );
            println!("{}", style("─".repeat(60)).dim());
            if let Some(session) = client.session_id() {
                println!("{:<12} {}", style("session").dim(), session);
            }
            println!("{:<12} {}", style("endpoint").dim(), endpoint);
            println!(
                "{:<12} {} {}",
                style("spool").dim(),
                spool_dir.display(),
                if client.is_durable() {
                    style("(durable)").green()
                } else {
                    style("(memory only)").yellow()
                }
            );
            println!("{:<12} {}", style("prefs").dim(), prefs_path.display());
            println!("{:<12} {}", style("opted in").dim(), client.opted_in());
            println!("{:<12} {}", style("pending").dim(), client.pending_count());
            println!(
                "{:<12} {}",
                style("delivered").dim(),
                stats.records_acknowledged
            );
        }
    }

    Ok(())
}
