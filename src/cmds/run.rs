// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base::{err, Error};
use bpaf::Bpaf;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use chronorec_core::collab::live::{HttpTsdbClient, LiveTaskMaster, TomlTaskStore};
use chronorec_core::collab::{Command, QueryResponse, Task, TaskStore, TsdbClient};
use chronorec_core::Store;

use crate::config::Config;
use crate::http::{self, AppState};

/// Starts the `chronorec` daemon.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the TOML configuration file.
    #[bpaf(long, argument("PATH"), fallback(PathBuf::from("/etc/chronorec.toml")))]
    config: PathBuf,

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[bpaf(long, argument("N"), optional)]
    worker_threads: Option<usize>,
}

/// A `TsdbClient` for when no `tsdb_base_url` is configured: every query
/// fails with `Unavailable`.
struct UnconfiguredTsdbClient;

#[async_trait]
impl TsdbClient for UnconfiguredTsdbClient {
    async fn query(&self, _cmd: Command) -> Result<QueryResponse, Error> {
        Err(err!(
            Unavailable,
            msg("no tsdb_base_url configured; batch/query recording is unavailable")
        ))
    }
}

/// A `TaskStore` for when no task manifest is configured: every lookup is
/// `NotFound`.
struct EmptyTaskStore;

#[async_trait]
impl TaskStore for EmptyTaskStore {
    async fn load(&self, name: &str) -> Result<Task, Error> {
        Err(err!(
            NotFound,
            msg("no task named {name:?} (no task_manifest configured)")
        ))
    }
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(n) = args.worker_threads {
        builder.worker_threads(n);
    }
    builder
        .build()
        .map_err(|e| err!(Internal, msg("building tokio runtime"), source(e)))?
        .block_on(async_run(args))
}

async fn async_run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    let store = Store::new(&config.save_dir)?;
    let task_store: Arc<dyn TaskStore> = match &config.task_manifest {
        Some(path) => Arc::new(TomlTaskStore::load_file(path)?),
        None => Arc::new(EmptyTaskStore),
    };
    let tsdb: Arc<dyn TsdbClient> = match &config.tsdb_base_url {
        Some(url) => Arc::new(HttpTsdbClient::new(url.clone())),
        None => Arc::new(UnconfiguredTsdbClient),
    };
    let live = LiveTaskMaster::new();

    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    let state = Arc::new(AppState {
        store,
        task_store,
        live,
        tsdb,
        shutdown: shutdown_rx.clone(),
    });

    let mut int = signal(SignalKind::interrupt())
        .map_err(|e| err!(Internal, msg("installing SIGINT handler"), source(e)))?;
    let mut term = signal(SignalKind::terminate())
        .map_err(|e| err!(Internal, msg("installing SIGTERM handler"), source(e)))?;

    let listener = TcpListener::bind(config.http_addr)
        .await
        .map_err(|e| err!(Internal, msg("binding {}", config.http_addr), source(e)))?;
    info!(addr = %config.http_addr, "listening for HTTP requests");

    let graceful = GracefulShutdown::new();
    let accept_loop = async {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.as_future() => break,
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(err = %e, "accept failed");
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let state = state.clone();
                    let conn = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, hyper::service::service_fn(move |req| http::serve(state.clone(), req)));
                    let conn = graceful.watch(conn);
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            warn!(err = %e, "connection error");
                        }
                    });
                }
            }
        }
    };
    tokio::pin!(accept_loop);

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. send another to shut down immediately.");
            shutdown_tx.take();
        }
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. send another to shut down immediately.");
            shutdown_tx.take();
        }
        _ = &mut accept_loop => {}
    }

    tokio::select! {
        _ = int.recv() => return Err(err!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)"))),
        _ = term.recv() => return Err(err!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)"))),
        _ = &mut accept_loop => {}
    }

    info!("waiting for in-flight requests to finish");
    graceful.shutdown().await;
    info!("exiting");
    Ok(0)
}
