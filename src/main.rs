//! RTT Link MCP Server - Main Entry Point

use anyhow::Context;
use clap::Parser;
use rmcp::{transport::stdio, ServiceExt};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

use rtt_link::{
    config::{Args, LoggingConfig},
    Config, RttToolHandler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Handle special flags first
    if args.generate_config {
        println!("{}", Config::default().to_toml()?);
        return Ok(());
    }

    // Load configuration
    let mut config = Config::load(args.config.as_ref()).context("Failed to load configuration")?;
    // Merge command line arguments into configuration
    config.merge_args(&args);

    if args.validate_config {
        config.validate()?;
        println!("Configuration is valid");
        return Ok(());
    }

    if args.show_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    config.validate().context("Configuration validation failed")?;

    // Initialize logging
    init_logging(&config.logging)?;
    info!("Starting RTT Link MCP Server v{}", env!("CARGO_PKG_VERSION"));
    debug!("Configuration: {:?}", config);

    let handler = RttToolHandler::new(&config);
    let service = handler
        .clone()
        .serve(stdio())
        .await
        .inspect_err(|e| {
            error!("Serving error: {:?}", e);
        })?;

    info!("RTT Link MCP Server started ({:?} backend)", config.probe.backend);

    // Wait for the service to complete
    service.waiting().await?;

    info!("Cleaning up resources...");
    handler.shutdown().await;

    info!("RTT Link MCP Server stopped");
    Ok(())
}

/// Initialize logging system. Output goes to stderr (stdout carries the MCP stream) or a file.
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false);

    if let Some(log_file) = &logging.file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

        subscriber.with_writer(file).init();
        eprintln!("Logging to file: {}", log_file.display());
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    debug!("Logging initialized with level: {}", logging.level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from([
            "rtt-link",
            "--log-level", "debug",
            "--backend", "simulated",
            "--control-block-timeout-ms", "2000",
        ]);

        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.control_block_timeout_ms, Some(2000));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe.speed_khz, 4000);
        assert_eq!(config.rtt.control_block_timeout_ms, 5000);
    }
}
