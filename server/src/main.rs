//! Mindex binary — thin CLI shell over the [`mindex_server`] library crate.
//!
//! Stdout is reserved for sentinel-framed events (the host parses them);
//! logs and human output go to stderr.

use clap::{CommandFactory, Parser, Subcommand};
use mindex_core::config::EngineConfig;
use mindex_server::api::build_router;
use mindex_server::engine::Engine;
use mindex_server::events::{names, EventBus};
use mindex_server::types::AppContext;
use std::path::PathBuf;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Local knowledge-base engine — screens, tags, vectorizes, and retrieves
/// over the user's own files without uploading them.
#[derive(Parser)]
#[command(name = "mindex", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Data root directory (default: ~/.local/share/mindex)
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Fixed HTTP port (default: auto-scan)
    #[arg(long)]
    port: Option<u16>,

    /// Bind to 0.0.0.0 instead of 127.0.0.1 (loopback)
    #[arg(long)]
    bind_all: bool,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log_filter: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the data directory and diagnose issues
    Doctor {
        /// Data root (default: ~/.local/share/mindex)
        path: Option<PathBuf>,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ---------------------------------------------------------------------------
// Doctor
// ---------------------------------------------------------------------------

fn run_doctor(data_root: &std::path::Path) -> i32 {
    let mut failures = 0;
    let checks: [(&str, PathBuf, bool); 4] = [
        ("db", data_root.join("db"), true),
        ("vectors", data_root.join("vectors"), true),
        ("builtin_models", data_root.join("builtin_models"), false),
        ("logs", data_root.join("logs"), false),
    ];
    eprintln!("Data root: {}", data_root.display());
    for (label, path, required) in checks {
        let exists = path.is_dir();
        let mark = if exists {
            "ok"
        } else if required {
            failures += 1;
            "missing"
        } else {
            "absent (created on first run)"
        };
        eprintln!("  {label:>16}: {mark}");
    }
    match mindex_server::store::Store::open(&data_root.join("db"), Default::default()) {
        Ok(store) => match store.list_folders() {
            Ok(folders) => eprintln!("  {:>16}: ok ({} folders)", "store", folders.len()),
            Err(e) => {
                failures += 1;
                eprintln!("  {:>16}: query failed: {e}", "store");
            }
        },
        Err(e) => {
            failures += 1;
            eprintln!("  {:>16}: open failed: {e}", "store");
        }
    }
    if failures == 0 {
        eprintln!("All checks passed");
        0
    } else {
        eprintln!("{failures} check(s) failed");
        1
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs to stderr — stdout belongs to the event bridge.
    let filter = cli
        .log_filter
        .clone()
        .map(|f| tracing_subscriber::EnvFilter::new(f))
        .unwrap_or_else(|| {
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mindex=info".parse().expect("static directive"))
        });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Some(command) = &cli.command {
        match command {
            Commands::Doctor { path } => {
                let root = path
                    .clone()
                    .or_else(|| cli.data_root.clone())
                    .unwrap_or_else(mindex_server::default_data_root);
                std::process::exit(run_doctor(&root));
            }
            Commands::Completions { shell } => {
                clap_complete::generate(*shell, &mut Cli::command(), "mindex", &mut std::io::stdout());
                return;
            }
        }
    }

    let data_root = cli.data_root.clone().unwrap_or_else(mindex_server::default_data_root);
    if let Err(e) = std::fs::create_dir_all(&data_root) {
        error!(path = %data_root.display(), error = %e, "Cannot create data root");
        std::process::exit(1);
    }
    let mut config = EngineConfig::load(&data_root);
    if let Some(port) = cli.port {
        config.http.port = port;
    }
    if cli.bind_all {
        config.http.bind_addr = "0.0.0.0".to_string();
    }

    let bus = EventBus::stdout(config.events.clone());
    bus.emit(
        names::API_LOG,
        serde_json::json!({ "message": "engine starting", "data_root": data_root.to_string_lossy() }),
    );
    let engine = match Engine::start(config.clone(), bus.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Engine startup failed");
            bus.emit(
                names::API_ERROR,
                serde_json::json!({ "code": "startup_failed", "message": e.to_string() }),
            );
            std::process::exit(1);
        }
    };

    // Initial bulk sweep in the background; the HTTP surface is usable
    // immediately (topology mutations queue until the sweep finishes).
    engine.spawn_initial_sweep();

    // Bind: fixed port or auto-scan.
    let bind_addr = config.http.bind_addr.clone();
    let listener = if config.http.port != 0 {
        let port = config.http.port;
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
            error!(port, error = %e, "Could not bind to port");
            std::process::exit(1);
        })
    } else {
        let base = config.http.port_base;
        let range = config.http.port_range.max(1);
        let mut found = None;
        for port in base..base + range {
            if let Ok(l) = tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                found = Some(l);
                break;
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = base, range_end = base + range - 1, "No free port found");
            eprintln!("  Try: mindex --port <port>");
            std::process::exit(1);
        })
    };
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();

    let ctx = AppContext { engine: engine.clone(), start_time: std::time::Instant::now() };
    let app = build_router(ctx)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    info!(port, data_root = %data_root.display(), "Engine listening");
    // Machine-readable line for supervisors (not through tracing).
    eprintln!("MINDEX_PORT={port}");
    bus.emit(names::API_READY, serde_json::json!({ "port": port }));

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "Server error");
    }
    engine.shutdown();
}
