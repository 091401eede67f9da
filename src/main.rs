mod api;
mod config;
mod error;
mod latency;
mod provider;
mod runner;
mod throughput;
mod traits;
mod types;
mod utils;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Settings;
use provider::HttpProvider;
use runner::RunOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use traits::SpeedTestProvider;
use tracing_subscriber::EnvFilter;
use types::{Measurement, SpeedTestReport};

#[derive(Parser)]
#[command(name = "netspeed")]
#[command(about = "Measure latency, download and upload speed against LibreSpeed servers", long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Flags layered over the config file
#[derive(Args)]
struct Overrides {
    /// Config file (default: ~/.config/netspeed/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Trials per download/upload measurement
    #[arg(long, short = 'n', global = true)]
    iterations: Option<usize>,

    /// Seconds each download trial may run
    #[arg(long, global = true)]
    duration: Option<f64>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<f64>,

    /// Server list URL
    #[arg(long, global = true)]
    server_list: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full test (default)
    Run(RunArgs),
    /// List the available servers
    Servers,
    /// Rank servers by latency (e.g., netspeed ping --top 5)
    Ping {
        /// Only show the N fastest servers
        #[arg(long)]
        top: Option<usize>,
    },
    /// Serve the HTTP API (GET /speedtest, /servers, /health)
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,

        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    #[arg(long)]
    skip_isp: bool,

    #[arg(long)]
    skip_download: bool,

    #[arg(long)]
    skip_upload: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let settings = load_settings(&cli.overrides)?;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => handle_run(settings, args).await?,
        Commands::Servers => handle_servers(settings).await?,
        Commands::Ping { top } => handle_ping(settings, top).await?,
        Commands::Serve { port, bind } => handle_serve(settings, &bind, port).await?,
        Commands::Config => print!("{}", settings.to_toml()?),
    }

    Ok(())
}

/// Diagnostics go to stderr; RUST_LOG overrides the default `warn` level.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(overrides: &Overrides) -> Result<Settings> {
    let mut settings = Settings::load(overrides.config.as_deref()).context("failed to load configuration")?;

    if let Some(n) = overrides.iterations {
        settings.iterations = n;
    }
    if let Some(secs) = overrides.duration {
        settings.trial_duration = seconds(secs, "--duration")?;
    }
    if let Some(secs) = overrides.timeout {
        settings.request_timeout = seconds(secs, "--timeout")?;
    }
    if let Some(ref url) = overrides.server_list {
        settings.server_list_url = url.clone();
    }

    settings.validate()?;
    Ok(settings)
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("{} must be a non-negative number of seconds", flag))
}

// --- Handlers ---

async fn handle_run(settings: Settings, args: RunArgs) -> Result<()> {
    let provider = HttpProvider::new(settings)?;
    let opts = RunOptions {
        skip_isp: args.skip_isp,
        skip_download: args.skip_download,
        skip_upload: args.skip_upload,
        quiet: args.json,
    };

    let report = runner::run_speedtest(&provider, opts).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SpeedTestReport) {
    println!();
    println!("{}", "-".repeat(60));
    println!("{:<14} {} ({})", "Server", report.server.name, report.server.server);
    if !report.server.sponsor_name.is_empty() {
        println!("{:<14} {}", "Sponsor", report.server.sponsor_name);
    }
    if let Some(ref isp) = report.isp {
        println!("{:<14} {}", "ISP Provider", isp.organization);
        println!("{:<14} {}", "IP", isp.ip_address);
        let location: Vec<&str> = [isp.city.as_str(), isp.region.as_str(), isp.country.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        if !location.is_empty() {
            println!("{:<14} {}", "Location", location.join(", "));
        }
    }
    if let Some(ref m) = report.download {
        print_measurement("Download", m);
    }
    if let Some(ref m) = report.upload {
        print_measurement("Upload", m);
    }
    println!("{}", "-".repeat(60));
}

fn print_measurement(label: &str, m: &Measurement) {
    let speeds: Vec<String> = m.samples().map(|s| format!("{:.2}", s.mbps)).collect();
    println!("{:<14} [{}] Mbps", label, speeds.join(", "));
    if let Some(mean) = m.mean_mbps() {
        let failed = if m.failed > 0 {
            format!(" ({} failed)", m.failed)
        } else {
            String::new()
        };
        println!("{:<14} {:.2} Mbps average{}", "", mean, failed);
    }
}

async fn handle_servers(settings: Settings) -> Result<()> {
    let provider = HttpProvider::new(settings)?;
    let servers = provider.server_list().await?;

    println!("{:<6} {:<45} Host", "ID", "Name");
    println!("{}", "-".repeat(90));
    for server in &servers {
        println!(
            "{:<6} {:<45} {}",
            server.id,
            truncate(&server.name, 44),
            utils::normalized_url(&server.server)
        );
    }
    println!("{}", "-".repeat(90));
    println!("{} servers", servers.len());
    Ok(())
}

async fn handle_ping(settings: Settings, top: Option<usize>) -> Result<()> {
    let provider = HttpProvider::new(settings)?;
    let servers = provider.server_list().await?;
    if servers.is_empty() {
        bail!("No servers available. Please check your network connection.");
    }

    let pb = utils::probe_progress(servers.len(), false);
    let results = latency::rank_servers(&servers, provider.settings(), &pb).await;
    pb.finish_with_message("Probing completed.");

    println!();
    println!("{:<4} {:<10} {:<45} Host", "RANK", "LATENCY", "NAME");
    println!("{}", "-".repeat(90));

    let limit = top.unwrap_or(results.len());
    for (i, res) in results.iter().take(limit).enumerate() {
        let latency_str = match &res.outcome {
            types::ProbeOutcome::Reachable(latency) => format!("{}ms", latency.as_millis()),
            types::ProbeOutcome::Unreachable(reason) => {
                tracing::debug!(server = %res.server.name, %reason, "unreachable");
                "Timeout".to_string()
            }
        };
        println!(
            "{:<4} {:<10} {:<45} {}",
            i + 1,
            latency_str,
            truncate(&res.server.name, 44),
            utils::normalized_url(&res.server.server)
        );
    }

    if results.iter().all(|r| !r.outcome.is_reachable()) {
        bail!("All servers are unreachable. Please check your network connection.");
    }
    Ok(())
}

async fn handle_serve(settings: Settings, bind: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", bind, port))?;
    let provider: Arc<dyn SpeedTestProvider> = Arc::new(HttpProvider::new(settings)?);
    api::serve(provider, addr).await;
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let short: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", short)
}
