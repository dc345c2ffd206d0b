use anyhow::{Context, bail};
use clap::Parser;
use forward_relay::config::Config;
use forward_relay::config_validation::ConfigValidator;
use forward_relay::logging::{self, CustomLogger};
use forward_relay::shutdown::{SIGINT, SIGTERM};
use forward_relay::{ForwardProxy, Shutdown};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::Path;

#[derive(Parser)]
#[clap(
    version,
    about = "Forwarding HTTP proxy with a fixed worker pool multiplexing client connections"
)]
struct Args {
    #[clap(value_name = "PORT", help = "Port to listen on (must be > 1024, default 8000)")]
    port: Option<u16>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8000); overrides PORT")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(short, long, value_name = "NUM", help = "Number of workers sharing the connection queue")]
    workers: Option<usize>,

    #[clap(long, value_name = "BYTES", help = "Maximum request head size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "SECONDS", help = "Upstream connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Write a sample configuration file and exit")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            // The logger may not be up yet.
            eprintln!("Error: {:#}", e);
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::default()
            .to_file(config_file)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("writing {}", config_file))?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(0);
    }

    let config = load_config(&args)?;
    init_logging(&args, &config)?;

    let validation = ConfigValidator::new(&config).validate();
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    for suggestion in &validation.suggestions {
        info!("{}", suggestion);
    }
    validation.into_result()?;

    info!(
        "Proxy server port: {} ({} worker(s), backlog {})",
        config.port(),
        config.worker_threads,
        config.listen_backlog
    );

    let shutdown = Shutdown::new();
    let mut server = tokio::spawn(ForwardProxy::new(config).run(shutdown.clone()));

    let signum = tokio::select! {
        signum = wait_for_signal() => signum,
        result = &mut server => {
            // The server only returns on its own when it could not start.
            result.context("server task failed")??;
            bail!("server stopped unexpectedly");
        }
    };

    info!("🛑 Received signal {}, shutting down gracefully...", signum);
    shutdown.trigger(signum);

    let report = server.await.context("server task failed")??;
    info!(
        "👋 Proxy stopped: {} queued connection(s) force-closed, {} socket(s) closed",
        report.records_drained, report.sockets_closed
    );
    log::logger().flush();

    Ok(signum)
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            bail!("Configuration file not found: {}", config_file);
        }
        Config::from_file(config_file)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("loading {}", config_file))?
    } else {
        Config::default()
    };

    if let Some(port) = args.port {
        config.listen_addr.set_port(port);
    }
    if let Some(listen) = &args.listen {
        config.listen_addr = listen
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen address: {}", listen))?;
    }
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    if let Some(max_header_size) = args.max_header_size {
        config.max_header_size = max_header_size;
    }
    if let Some(connect_timeout) = args.connect_timeout {
        config.connect_timeout_secs = connect_timeout;
    }

    Ok(config)
}

fn init_logging(args: &Args, config: &Config) -> anyhow::Result<()> {
    let level = args.log_level.as_deref().map(logging::parse_log_level).transpose()?;
    let format = args.log_format.as_deref().map(logging::parse_log_format).transpose()?;

    match &config.logging {
        Some(logging_config) => {
            let mut logging_config = logging_config.clone();
            if level.is_some() {
                logging_config.level = level;
            }
            if format.is_some() {
                logging_config.format = format;
            }
            CustomLogger::init(logging_config)?;
        }
        None => logging::init_fallback(level, format),
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = tokio::signal::ctrl_c() => SIGINT,
            _ = sigterm.recv() => SIGTERM,
        },
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            SIGINT
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> i32 {
    let _ = tokio::signal::ctrl_c().await;
    SIGINT
}
