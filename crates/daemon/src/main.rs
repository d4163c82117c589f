// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `emberd` — the Ember edge runtime daemon.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use ember_daemon::lifecycle::{startup, Config, LifecycleError};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn parse_root_arg() -> Result<Option<PathBuf>, String> {
    let mut args = std::env::args().skip(1);
    let mut root = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--root" => match args.next() {
                Some(value) => root = Some(PathBuf::from(value)),
                None => return Err("--root requires a path".to_string()),
            },
            "--help" | "-h" => {
                println!("usage: emberd [--root <dir>]");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(root)
}

#[tokio::main]
async fn main() {
    let root = match parse_root_arg() {
        Ok(root) => root,
        Err(message) => {
            eprintln!("emberd: {message}");
            std::process::exit(1);
        }
    };

    let config = match Config::load(root) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("emberd: {e}");
            std::process::exit(1);
        }
    };

    // File logging next to the rest of the runtime state; RUST_LOG
    // filters as usual.
    if let Err(e) = std::fs::create_dir_all(config.paths.log_dir()) {
        eprintln!("emberd: cannot create log directory: {e}");
        std::process::exit(1);
    }
    let appender = tracing_appender::rolling::daily(config.paths.log_dir(), "emberd.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(config).await {
        error!(error = %e, "daemon failed");
        std::process::exit(5);
    }
}

async fn run(config: Config) -> Result<(), LifecycleError> {
    let result = startup(config)?;
    let daemon = result.daemon;

    tokio::spawn(result.supervisor_driver.run());
    tokio::spawn(result.engine_driver.run());
    tokio::spawn(
        std::sync::Arc::clone(&daemon.router)
            .serve(result.listener, daemon.shutdown_token.clone()),
    );

    // Resume deployments interrupted by the previous run.
    ember_daemon::resume_pending(&result.engine_ctx, &daemon.engine).await;

    info!(root = %daemon.config.paths.root().display(), "READY");
    println!("READY");

    wait_for_termination().await;
    daemon.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = term.recv() => info!("terminate received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
