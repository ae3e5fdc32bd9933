use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cdp_adapter::CdpAdapter;
use clap::{Args, Parser, Subcommand};
use flowprobe::config::{load_config, AppConfig};
use flowprobe::flow::{FlowReport, FlowRunner};
use flowprobe::{match_timeline, metrics, ExpectedEvent, Scenario};
use network_timeline::ObservedEvent;
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

/// flowprobe - verify an OpenID Connect login flow in a real browser
#[derive(Parser)]
#[command(author, version = VERSION, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Enable debug mode
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log line format
    #[arg(long, value_enum, default_value = "human", global = true)]
    log_format: LogFormat,

    /// Report format
    #[arg(short, long, value_enum, default_value = "human", global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the login flow against a remote browser
    Run(RunArgs),
    /// Print a scenario as YAML
    Scenario(ScenarioArgs),
    /// Compare a recorded timeline against a scenario without a browser
    Match(MatchArgs),
}

#[derive(Args)]
struct RunArgs {
    /// DevTools endpoint (ws:// or http:// host:port, or a full browser websocket URL)
    #[arg(long, value_name = "URL")]
    ws_url: Option<String>,

    /// Gateway origin
    #[arg(long, value_name = "URL")]
    origin: Option<String>,

    /// Identity provider origin
    #[arg(long, value_name = "URL")]
    provider: Option<String>,

    /// Scenario file; defaults to the built-in gateway chain
    #[arg(long, value_name = "FILE")]
    scenario: Option<PathBuf>,

    /// Navigation deadline, e.g. `30s`
    #[arg(long)]
    navigation_timeout: Option<humantime::Duration>,

    /// Write the JSON report to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Print the report as JSON (same as `--output json`)
    #[arg(long)]
    json: bool,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    metrics: bool,
}

#[derive(Args)]
struct ScenarioArgs {
    #[arg(long, value_name = "URL")]
    origin: Option<String>,

    #[arg(long, value_name = "URL")]
    provider: Option<String>,
}

#[derive(Args)]
struct MatchArgs {
    /// Scenario YAML, or a YAML list of expected events
    #[arg(long, value_name = "FILE")]
    expected: PathBuf,

    /// JSON timeline, or a JSON report with a `timeline` field
    #[arg(long, value_name = "FILE")]
    observed: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.debug, cli.log_format)?;
    info!("Starting flowprobe v{}", VERSION);

    let config = load_config(cli.config.as_deref()).await?;

    let result = match cli.command {
        Commands::Run(args) => cmd_run(args, config, cli.output).await,
        Commands::Scenario(args) => cmd_scenario(args, &config),
        Commands::Match(args) => cmd_match(args, cli.output).await,
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Command failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(level: &str, debug: bool, format: LogFormat) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        level.parse().context("Invalid log level")?
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Human => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }

    Ok(())
}

async fn resolve_scenario(
    path: Option<&Path>,
    origin: &str,
    provider: &str,
) -> Result<Scenario> {
    match path {
        Some(path) => Ok(Scenario::load(path).await?),
        None => Ok(Scenario::couper(origin, provider)),
    }
}

async fn cmd_run(args: RunArgs, mut config: AppConfig, output: OutputFormat) -> Result<()> {
    if let Some(url) = args.ws_url {
        config.cdp.websocket_url = Some(url);
    }
    if let Some(origin) = args.origin {
        config.origin = origin;
    }
    if let Some(provider) = args.provider {
        config.provider = provider;
    }
    if let Some(timeout) = args.navigation_timeout {
        config.flow.navigation_timeout_ms = timeout.as_millis() as u64;
    }
    if config.cdp.websocket_url.is_none() {
        bail!("no devtools endpoint configured; pass --ws-url or set FLOWPROBE_WS_URL");
    }

    let scenario_path = args.scenario.or_else(|| config.scenario.clone());
    let scenario =
        resolve_scenario(scenario_path.as_deref(), &config.origin, &config.provider).await?;
    metrics::register_metrics();

    let adapter = Arc::new(CdpAdapter::new(config.cdp.clone()));
    Arc::clone(&adapter)
        .start()
        .await
        .context("connecting to the browser")?;
    adapter.open_page().await.context("opening a page")?;

    let token = adapter.cancel_token().child_token();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            ctrl_c.cancel();
        }
    });

    let runner = FlowRunner::new(adapter.clone(), scenario, config.flow.clone())
        .with_timeline_config(config.timeline.clone())
        .with_cancel_token(token);
    let report = runner.run().await;
    adapter.shutdown().await;

    if let Some(path) = &args.report {
        let body = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(path, body)
            .await
            .with_context(|| format!("writing report to {}", path.display()))?;
    }
    let output = if args.json { OutputFormat::Json } else { output };
    print_report(&report, output)?;
    if args.metrics {
        print!("{}", metrics::render());
    }

    match report.failure() {
        None => Ok(()),
        Some((stage, kind, error)) => bail!("{kind} failure at {stage:?}: {error}"),
    }
}

fn print_report(report: &FlowReport, output: OutputFormat) -> Result<()> {
    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for (idx, event) in report.timeline.iter().enumerate() {
        println!(
            "{:02} {} {}",
            idx + 1,
            event.status_code,
            event.url
        );
    }
    let stats = &report.continuations;
    println!(
        "continued {} request(s), {} failed, {} duplicate pause(s)",
        stats.issued, stats.failed, stats.duplicates
    );
    match report.failure() {
        None => println!(
            "PASS {}: {} step(s) matched in {} ms",
            report.scenario,
            report.matched.len(),
            report.elapsed_ms
        ),
        Some((stage, kind, error)) => {
            println!("FAIL {} at {:?} ({kind})", report.scenario, stage);
            println!("{error}");
            if !report.browser_log.is_empty() {
                println!("--- browser events ---");
                for line in &report.browser_log {
                    println!("{line}");
                }
            }
        }
    }
    Ok(())
}

fn cmd_scenario(args: ScenarioArgs, config: &AppConfig) -> Result<()> {
    let origin = args.origin.as_deref().unwrap_or(&config.origin);
    let provider = args.provider.as_deref().unwrap_or(&config.provider);
    print!("{}", Scenario::couper(origin, provider).to_yaml()?);
    Ok(())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpectedInput {
    Scenario(Box<Scenario>),
    Events(Vec<ExpectedEvent>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ObservedInput {
    Report { timeline: Vec<ObservedEvent> },
    Events(Vec<ObservedEvent>),
}

async fn cmd_match(args: MatchArgs, output: OutputFormat) -> Result<()> {
    let raw = tokio::fs::read_to_string(&args.expected)
        .await
        .with_context(|| format!("reading {}", args.expected.display()))?;
    let expected = match serde_yaml::from_str::<ExpectedInput>(&raw)
        .with_context(|| format!("parsing {}", args.expected.display()))?
    {
        ExpectedInput::Scenario(scenario) => scenario.expected,
        ExpectedInput::Events(events) => events,
    };

    let raw = tokio::fs::read_to_string(&args.observed)
        .await
        .with_context(|| format!("reading {}", args.observed.display()))?;
    let observed = match serde_json::from_str::<ObservedInput>(&raw)
        .with_context(|| format!("parsing {}", args.observed.display()))?
    {
        ObservedInput::Report { timeline } => timeline,
        ObservedInput::Events(events) => events,
    };

    let report = match_timeline(&expected, &observed)?;
    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for step in &report.steps {
            println!("url: {:?}, status: {}", step.url, step.status_code);
        }
        println!("PASS: {} step(s) matched", report.steps.len());
    }
    Ok(())
}
