//!
//! pkgindex server binary
//! ----------------------
//! Command-line entry point for the package-dependency index service.
//! Supports configuration via CLI flags and environment variables; flags
//! override the environment, the environment overrides defaults.

use anyhow::Result;
use std::env;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use pkgindex::server::{self, ServerConfig, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_WORKERS};

fn parse_value_arg(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("pkgindex server\n\nUSAGE:\n  pkgindex [--host ADDR] [--port N] [--workers N]\n\nOPTIONS:\n  --host ADDR     Listen address (env: PKGINDEX_HOST, default 0.0.0.0)\n  --port N        Listen port (env: PKGINDEX_PORT, default 8080)\n  --workers N     Connection worker pool size (env: PKGINDEX_WORKERS, default 100)\n");
        return Ok(());
    }

    // Environment variables
    let env_host = env::var("PKGINDEX_HOST").ok();
    let env_port = env::var("PKGINDEX_PORT").ok().and_then(|v| v.parse::<u16>().ok());
    let env_workers = env::var("PKGINDEX_WORKERS").ok().and_then(|v| v.parse::<usize>().ok());

    // CLI arguments override environment
    let arg_host = parse_value_arg(&args, "--host");
    let arg_port = parse_value_arg(&args, "--port").and_then(|v| v.parse::<u16>().ok());
    let arg_workers = parse_value_arg(&args, "--workers").and_then(|v| v.parse::<usize>().ok());

    let config = ServerConfig {
        host: arg_host.or(env_host).unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: arg_port.or(env_port).unwrap_or(DEFAULT_PORT),
        workers: arg_workers.or(env_workers).unwrap_or(DEFAULT_WORKERS).max(1),
    };

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "pkgindex",
        "pkgindex starting: RUST_LOG='{}', host={}, port={}, workers={}",
        rust_log, config.host, config.port, config.workers
    );
    info!(target: "pkgindex", "press Ctrl-C to stop the service");

    server::run(config).await
}
