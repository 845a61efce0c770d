//! TcpBounce - TCP Port Forwarding Relay
//!
//! Reads `sourcePort,targetIP,targetPort` rules, starts one forwarding
//! session per rule and relays until the operator presses Enter.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcpbounce::{
    config::{load_rules, CliOverrides, ConfigManager},
    metrics::{Metrics, MetricsServer},
    shutdown::ShutdownAwareTask,
    Config, SessionRegistry, ShutdownCoordinator,
};

/// Upper bound for stopping every session on exit
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// CLI arguments for TcpBounce
#[derive(Parser, Debug)]
#[command(name = "tcpbounce")]
#[command(about = "TcpBounce - TCP port forwarding relay")]
#[command(version)]
#[command(long_about = "
TcpBounce - TCP port forwarding relay

Forwards local ports to remote endpoints. Rules are read from a plain text
file, one per line:

  sourcePort,targetIP,targetPort

Configuration priority (highest to lowest):
1. Command-line arguments
2. Settings file (TOML)
3. Environment variables
4. Built-in defaults

Environment variables:
  TCPBOUNCE_RULES_FILE       - Rule file path (default: Settings.xml)
  TCPBOUNCE_LISTEN_IP        - Local address to listen on (default: 0.0.0.0)
  TCPBOUNCE_CONNECT_TIMEOUT  - Target connect timeout (e.g., 500ms, 2s)
  TCPBOUNCE_BUFFER_SIZE      - Per-direction buffer size in bytes
  TCPBOUNCE_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
  TCPBOUNCE_METRICS_ADDR     - Prometheus endpoint (e.g., 127.0.0.1:9100)
")]
pub struct CliArgs {
    /// Settings file path
    #[arg(
        short,
        long,
        default_value = "tcpbounce.toml",
        help = "Path to settings file"
    )]
    pub config: PathBuf,

    /// Rule file path (overrides settings)
    #[arg(short, long, help = "Path to the forwarding rule file")]
    pub rules: Option<PathBuf>,

    /// Local address to listen on (overrides settings)
    #[arg(long, help = "Local address to listen on (e.g., 127.0.0.1)")]
    pub listen_ip: Option<IpAddr>,

    /// Target connect timeout in milliseconds
    #[arg(long, help = "Target connect timeout in milliseconds")]
    pub connect_timeout: Option<u64>,

    /// Buffer size in bytes
    #[arg(long, help = "Per-direction buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Prometheus metrics endpoint
    #[arg(long, help = "Serve Prometheus metrics on this address")]
    pub metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Ignore stdin and stop only on SIGINT/SIGTERM
    #[arg(long, help = "Do not wait for a key press, stop on signals only")]
    pub no_keypress: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate settings and rules, then exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = ConfigManager::load_from_file(&args.config)?;
    config.merge_with_cli_args(&CliOverrides {
        rules_file: args.rules.clone(),
        listen_ip: args.listen_ip,
        connect_timeout_ms: args.connect_timeout,
        buffer_size: args.buffer_size,
        metrics_addr: args.metrics_addr,
    });
    if let Some(level) = &args.log_level {
        config.monitoring.log_level = level.clone();
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&args, &config)?;

    println!("{}", banner());
    info!("Starting TcpBounce v{}", env!("CARGO_PKG_VERSION"));

    let rules_file = &config.relay.rules_file;
    if !rules_file.exists() {
        bail!("Missing config file \"{}\"", rules_file.display());
    }
    let parsed = load_rules(rules_file)?;

    for rejected in &parsed.rejected {
        println!(
            "Invalid config @ Line: {} ({}): {}",
            rejected.line, rejected.content, rejected.error
        );
    }

    if args.validate_config {
        print_summary(&config, parsed.rules.len(), parsed.rejected.len());
        return Ok(());
    }

    if parsed.is_empty() {
        bail!("No valid forwarding rules in {}", rules_file.display());
    }

    let shutdown_coordinator = ShutdownCoordinator::new(SHUTDOWN_TIMEOUT);

    let metrics = match config.monitoring.metrics_addr {
        Some(addr) => {
            let metrics = Arc::new(Metrics::new().context("Failed to create metrics")?);
            let server = MetricsServer::new(metrics.clone(), addr);
            let task = ShutdownAwareTask::spawn(&shutdown_coordinator, "metrics_server", |_| async move {
                if let Err(e) = server.start().await {
                    error!("Metrics server error: {}", e);
                }
            });
            tokio::spawn(task.wait_for_completion_or_shutdown());
            Some(metrics)
        }
        None => {
            info!("Metrics endpoint disabled");
            None
        }
    };

    let mut registry = SessionRegistry::new(config.relay.clone(), metrics);
    let reports = registry.start_all(parsed.rules).await;

    for report in &reports {
        match &report.result {
            Ok(()) => println!(
                "Now forwarding Port: {} To Target: {} On Port: {}",
                report.rule.source_port, report.rule.target_host, report.rule.target_port
            ),
            Err(e) => println!("Failed to start forwarding {}: {}", report.rule, e),
        }
    }

    let started = reports.iter().filter(|r| r.is_ok()).count();
    info!("{} of {} forwarding rule(s) started", started, reports.len());

    if args.no_keypress {
        println!("Press Ctrl+C to stop forwarding...");
    } else {
        println!("Press Enter to stop forwarding...");
    }

    let reason = shutdown_coordinator
        .wait_for_shutdown(!args.no_keypress)
        .await?;
    info!("Shutting down ({:?})", reason);

    if let Err(e) = shutdown_coordinator.shutdown_registry(&registry).await {
        error!("Error during session cleanup: {}", e);
    }

    for info in registry.snapshot().await {
        if let Some(stats) = info.last_relay {
            info!(
                rule = %info.rule,
                bytes_up = stats.bytes_up,
                bytes_down = stats.bytes_down,
                "Session summary"
            );
        }
    }

    info!("TcpBounce shutdown complete");
    Ok(())
}

fn banner() -> String {
    let title = format!("TcpBounce {}", env!("CARGO_PKG_VERSION"));
    let rule = "=".repeat(title.len() + 4);
    format!("{}\n  {}\n{}", rule, title, rule)
}

fn print_summary(config: &Config, rules: usize, rejected: usize) {
    println!("Configuration is valid");
    println!("  Rule file: {}", config.relay.rules_file.display());
    println!("  Rules: {} valid, {} rejected", rules, rejected);
    println!("  Listen address: {}", config.relay.listen_ip);
    println!("  Connect timeout: {:?}", config.relay.connect_timeout);
    println!("  Buffer size: {} bytes", config.relay.buffer_size);
    println!(
        "  Metrics: {}",
        config
            .monitoring
            .metrics_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        config.monitoring.log_level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
