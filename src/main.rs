use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use orchestrator::{Engine, Mode};
use orchestrator_core::{config::AppConfig, init_logging};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("orchestrator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Distributed job orchestration engine")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (TOML)"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("Topology to run")
                .value_parser(["coordinator", "worker", "standalone"])
                .default_value("standalone"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level, overrides the configuration")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("Log format, overrides the configuration")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("print-config")
                .long("print-config")
                .help("Print the effective configuration as TOML and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("failed to load configuration from {path}"),
        None => "failed to load configuration".to_string(),
    })?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.clone();
    }

    if matches.get_flag("print-config") {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_logging(&config.logging.level, &config.logging.format)?;

    let mode: Mode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("standalone")
        .parse()
        .context("invalid mode")?;

    if let Some(address) = &config.observability.metrics_address {
        let address: SocketAddr = address
            .parse()
            .with_context(|| format!("invalid metrics address: {address}"))?;
        PrometheusBuilder::new()
            .with_http_listener(address)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Prometheus metrics exported on {address}");
    }

    info!("Starting orchestrator: mode={mode}");
    Engine::new(config, mode)
        .run()
        .await
        .with_context(|| format!("failed to start {mode} engine"))?;

    info!("orchestrator exited");
    Ok(())
}
