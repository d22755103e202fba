// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cello_ai::{AiCellHandler, AiDriver};
use cello_core::{
    new_session_id, CoordinationEngine, MarkupCellHandler, Runtime, SqlCellHandler,
};
use cello_model::{ModelClient, OpenAiCompatClient};
use cello_store::{CellType, MemoryStore, Store};
use cello_worker::{
    CodeCellHandler, ProcessTransport, TransportFactory, WorkerBridge, WorkerConfig,
};
use cli::Cli;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Usage problems must exit 1 (configuration error class); --help and
    // --version exit 0.  clap's own exit() would use 2 for usage errors.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return Ok(());
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    init_logging();

    // The replicated sync transport is an external concern behind the Store
    // trait; this build ships the in-process store.
    if let Some(url) = &cli.sync_url {
        warn!(%url, "no sync transport in this build; using the in-process store");
    }
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    let model: Option<Arc<dyn ModelClient>> = match OpenAiCompatClient::from_env() {
        Some(client) => {
            info!(model = client.model_name(), "AI cells enabled");
            Some(Arc::new(client))
        }
        None => {
            info!("no AI credentials configured; AI cells will print setup instructions");
            None
        }
    };
    let ai_models = model.iter().map(|m| m.model_name().to_string()).collect();

    let config = cli.runtime_config(ai_models, cli.worker_cmd.is_some());
    config.validate()?;

    let session_id = new_session_id();
    let shutdown = CancellationToken::new();
    let mut engine =
        CoordinationEngine::new(Arc::clone(&store), session_id.clone(), shutdown.clone());
    engine.register(CellType::Markdown, Arc::new(MarkupCellHandler));
    engine.register(CellType::Raw, Arc::new(MarkupCellHandler));
    engine.register(CellType::Sql, Arc::new(SqlCellHandler));
    engine.register(
        CellType::Ai,
        Arc::new(AiCellHandler::new(AiDriver::new(
            Arc::clone(&store),
            session_id.clone(),
            model,
        ))),
    );

    if let Some(worker_cmd) = &cli.worker_cmd {
        let mut parts = worker_cmd.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("--worker-cmd must name a program"))?;
        let args: Vec<String> = parts.collect();
        let factory: TransportFactory =
            Box::new(move || -> Arc<dyn cello_worker::WorkerTransport> {
                ProcessTransport::new(program.clone(), args.clone())
            });
        let bridge = WorkerBridge::new(
            factory,
            WorkerConfig {
                packages: cli.preload_packages.clone(),
                package_cache_dir: cli.package_cache_dir.clone(),
            },
        )?;
        engine.register(CellType::Code, Arc::new(CodeCellHandler::new(Arc::new(bridge))));
    }

    let runtime = Runtime::start(store, config, engine, session_id).await?;

    wait_for_signal(&runtime).await;
    runtime.shutdown().await;
    info!("bye");
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("CELLO_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Block until SIGINT/SIGTERM or until the runtime stops on its own.
async fn wait_for_signal(runtime: &Runtime) {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                        _ = runtime.wait() => {}
                    }
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = sigterm.recv() => info!("termination requested"),
            _ = runtime.wait() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = runtime.wait() => {}
        }
    }
}
