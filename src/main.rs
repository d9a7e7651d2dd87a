//! meta-router: rule-based routing core
//!
//! Loads a configuration, builds the routing state (adapters, providers,
//! groups, rules, UDP NAT) and keeps health checks and rule provider
//! refreshers running until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run with custom configuration
//! ./meta-router -c /path/to/config.json
//!
//! # Validate a configuration, rules included
//! ./meta-router -c config.json --check
//!
//! # Run with environment overrides
//! META_ROUTER_LOG_LEVEL=debug META_ROUTER_MODE=global ./meta-router
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use meta_router::adapter::BuiltinFactory;
use meta_router::config::{create_default_config, load_config_with_env, Config};
use meta_router::dns::SystemResolver;
use meta_router::state::RouterState;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/meta-router/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("meta-router v{}", meta_router::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"meta-router v{}

Rule-based routing, proxy groups and UDP NAT sessions.

USAGE:
    meta-router [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/meta-router/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and rules, then exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    META_ROUTER_LOG_LEVEL         Override log level (trace, debug, info, warn, error)
    META_ROUTER_UDP_TIMEOUT_SECS  Override the UDP flow idle timeout
    META_ROUTER_MODE              Override the routing mode (rule, global, direct)
    RUST_LOG                      Extra tracing directives
",
        meta_router::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!("Failed to load configuration from {:?}: {}", args.config_path, e)
    })?;

    if args.check_config {
        let state = RouterState::init(&config, &BuiltinFactory::new(), Arc::new(SystemResolver::default()), None)
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
        state.shutdown().await;
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("meta-router v{}", meta_router::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let state = RouterState::init(&config, &BuiltinFactory::new(), Arc::new(SystemResolver::default()), None)
        .map_err(|e| anyhow::anyhow!("Failed to build router state: {e}"))?;

    info!(
        groups = ?state.group_names(),
        mode = %state.tunnel().mode(),
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    state.shutdown().await;

    let stats = state.tunnel().stats().snapshot();
    info!(
        tcp = stats.tcp,
        udp_flows = stats.udp_flows,
        failed = stats.failed,
        upload = stats.upload,
        download = stats.download,
        "Final tunnel stats"
    );
    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
