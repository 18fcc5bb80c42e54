use anyhow::{Context, Result};
use clap::Parser;
use logrelay_core::{Config, Severity};
use logrelay_logger::CompositeLogger;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// logrelay - route log lines to files, stdout and a correlated alert channel
#[derive(Parser, Debug)]
#[command(name = "logrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Write alert metrics in Prometheus text format to this file on exit
    #[arg(long, value_name = "PATH")]
    metrics_out: Option<PathBuf>,
}

/// Diagnostics level: verbose wins, then the configured level, WARN otherwise
fn tracing_level(verbose: bool, configured: &str) -> Level {
    if verbose {
        return Level::DEBUG;
    }
    match configured.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    }
}

/// Split an optional leading level off a stdin line; INFO when absent
fn parse_line(line: &str) -> (Severity, &str) {
    let line = line.trim_end();
    let (first, rest) = match line.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim_start()),
        None => (line, ""),
    };

    match first.parse::<Severity>() {
        Ok(severity) => (severity, rest),
        Err(_) => (Severity::Info, line),
    }
}

async fn relay_line(logger: &CompositeLogger, severity: Severity, message: &str) {
    match severity {
        Severity::Debug => logger.debug(message).await,
        Severity::Info => logger.info(message).await,
        Severity::Warning => logger.warning(message).await,
        Severity::Error => logger.error(message).await,
        Severity::Fatal => logger.fatal(message).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        let config = Config::default();
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    // Load configuration, then let the environment override it
    let mut config = if let Some(ref config_path) = args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    config.apply_env()?;

    // Diagnostics go to stderr so they never mix with relayed stdout lines
    FmtSubscriber::builder()
        .with_max_level(tracing_level(args.verbose, &config.general.log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    info!(app = %config.app.name, instance = %config.app.instance_id, "Starting logrelay");

    let logger = CompositeLogger::from_config(&config).await;
    if logger.sink_count() == 0 {
        eprintln!("Warning: No sinks enabled. Enable file, structured or alert in config.");
    }
    info!(sinks = ?logger.sink_names(), "Logger initialized with {} sink(s)", logger.sink_count());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut relayed: u64 = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let (severity, message) = parse_line(&line);
                    relay_line(&logger, severity, message).await;
                    relayed += 1;
                }
                Ok(None) => {
                    info!(lines = relayed, "Stdin EOF reached");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Error reading from stdin");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!(lines = relayed, "Interrupted");
                break;
            }
        }
    }

    logger.close().await;

    if let Some(path) = args.metrics_out {
        match logger.alert_metrics() {
            Some(metrics) => {
                let text = metrics.gather()?;
                std::fs::write(&path, text)
                    .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
                info!(path = %path.display(), "Alert metrics written");
            }
            None => warn!("No alert sink running, metrics file not written"),
        }
    }
    Ok(())
}
