//! Hostgate - Entry Point

use hostgate::GatewayConfig;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Hostgate v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: hostgate");
        println!();
        println!("Environment variables:");
        println!("  HOSTGATE_DATA_DIR      Data directory (config, PID file, TLS pair)");
        println!("  HOSTGATE_CONFIG        Settings file (default: <data>/config.toml)");
        println!("  HOSTGATE_PID_FILE      PID file (default: <data>/hostgate.pid)");
        println!("  HOSTGATE_REPO_DIR      Yum repository directory");
        println!("  HOSTGATE_FILE_ROOT     Root for file preview/download/upload");
        println!("  HOSTGATE_PROGRAMS      Comma-separated programs that may be started");
        println!("  HOSTGATE_LOG_JSON      Log JSON to stderr when set to 1");
        println!("  RUST_LOG               Log level (trace, debug, info, warn, error)");
        return Ok(());
    }

    let config = GatewayConfig::from_env()?;

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(if config.debug { Level::DEBUG } else { Level::INFO });

    let json_logs = std::env::var("HOSTGATE_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Hostgate v{}", env!("CARGO_PKG_VERSION"));
    hostgate::serve(config).await
}
