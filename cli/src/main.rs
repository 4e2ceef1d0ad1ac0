//! sessionlog CLI — inspect a session database and run idle sweeps.
//!
//! Usage:
//! ```bash
//! sessionlog sessions ./sessions.db
//! sessionlog sweep    ./sessions.db 300000
//! sessionlog info
//! ```

mod logging;

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;

use sessionlog_core::{RegistryBuilder, RegistryConfig};
use sessionlog_storage::SqliteStorage;

#[tokio::main]
async fn main() {
    logging::init_tracing(&logging::LogConfig::from_env());

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => cmd_info(),
        "sessions" => cmd_sessions(&args[2..]).await,
        "sweep" => cmd_sweep(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("sessionlog {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("sessionlog {}", env!("CARGO_PKG_VERSION"));
    println!("Session lifecycle and telemetry ingestion\n");
    println!("USAGE:");
    println!("    sessionlog <COMMAND> [ARGS]\n");
    println!("COMMANDS:");
    println!("    info                      Show configuration defaults");
    println!("    sessions [DB]             List sessions as JSON lines");
    println!("    sweep [DB] [TIMEOUT_MS]   Close sessions idle longer than TIMEOUT_MS");
    println!("    version                   Print version");
    println!("    help                      Print this help");
    println!("\nDB defaults to $SESSIONLOG_DATABASE_URL.");
}

fn cmd_info() -> anyhow::Result<()> {
    let config = RegistryConfig::from_env()?;
    println!("sessionlog v{}", env!("CARGO_PKG_VERSION"));
    println!("  Database: {}", config.database_url);
    println!("  Idle timeout: {} ms", config.idle_timeout_ms);
    println!("  Reaper period: {} ms", config.reaper_period().as_millis());
    println!("  Reaper enabled: {}", config.reaper_enabled);
    println!("  Channels: click, mouse, spatial, score, tooltip");
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
    Ok(())
}

async fn open_store(args: &[String], config: &RegistryConfig) -> anyhow::Result<SqliteStorage> {
    let url = args.first().unwrap_or(&config.database_url);
    if url.contains(":memory:") {
        bail!("an in-memory database has nothing to inspect; pass a file path");
    }
    SqliteStorage::open(url)
        .await
        .with_context(|| format!("opening {url}"))
}

async fn cmd_sessions(args: &[String]) -> anyhow::Result<()> {
    let config = RegistryConfig::from_env()?;
    let store = Arc::new(open_store(args, &config).await?);
    let collector = RegistryBuilder::from_config(config)
        .reaper_enabled(false)
        .start(store.clone());

    for session in collector.registry().sessions().await? {
        println!("{}", serde_json::to_string(&session)?);
    }

    collector.shutdown().await?;
    store.close().await;
    Ok(())
}

async fn cmd_sweep(args: &[String]) -> anyhow::Result<()> {
    let mut config = RegistryConfig::from_env()?;
    if let Some(raw) = args.get(1) {
        config.idle_timeout_ms = raw
            .parse()
            .with_context(|| format!("TIMEOUT_MS must be a number, got {raw}"))?;
    }
    let timeout_ms = i64::try_from(config.idle_timeout_ms).context("TIMEOUT_MS too large")?;

    let store = Arc::new(open_store(args, &config).await?);
    let collector = RegistryBuilder::from_config(config)
        .reaper_enabled(false)
        .start(store.clone());

    let closed = collector.registry().sweep_idle(timeout_ms).await?;
    info!(closed, timeout_ms, "sweep finished");
    println!("closed {closed} idle session(s)");

    collector.shutdown().await?;
    store.close().await;
    Ok(())
}
