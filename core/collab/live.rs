// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! In-process implementations of the [`super`] collaborator traits, wired
//! up by `chronorec run` so the binary is runnable standalone without a
//! real task compiler or time-series database:
//!
//! - [`LiveTaskMaster`] holds named forks over an internal broadcast of
//!   ingested points, and a null task executor (a real dataflow graph
//!   compiler is out of scope here).
//! - [`TomlTaskStore`] loads a TOML manifest of named tasks.
//! - [`HttpTsdbClient`] queries a real time-series database's HTTP API;
//!   nothing in the core depends on its wire format, so swapping databases
//!   means implementing [`super::TsdbClient`] again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use jiff::Timestamp;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use base::{err, Error, ResultExt};

use crate::types::{Dbrp, FieldValue, Point, TaskType};

use super::{
    BatchSink, Command, Edge, ExecutingTask, PointSink, QueryResponse, ResultTable, Task,
    TaskMaster, TaskStore, TsdbClient,
};

/// The live system's point fan-out: tasks subscribe via `new_fork`, and
/// whatever ingest path the deployment uses (not specified by this core)
/// calls [`LiveTaskMaster::ingest`] for each point it sees on the wire.
pub struct LiveTaskMaster {
    live: broadcast::Sender<Point>,
    forks: std::sync::Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl LiveTaskMaster {
    pub fn new() -> Arc<Self> {
        let (live, _) = broadcast::channel(1024);
        Arc::new(LiveTaskMaster {
            live,
            forks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Feeds one point from the live ingest path into every matching fork.
    pub fn ingest(&self, point: Point) {
        let _ = self.live.send(point);
    }
}

struct LiveEdge {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Point>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Edge for LiveEdge {
    async fn next_point(&self) -> Option<Point> {
        if *self.closed_rx.borrow() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        let mut closed_rx = self.closed_rx.clone();
        tokio::select! {
            biased;
            _ = closed_rx.changed() => None,
            p = rx.recv() => p,
        }
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

#[async_trait]
impl TaskMaster for LiveTaskMaster {
    async fn new_fork(&self, name: &str, dbrps: &[Dbrp]) -> Result<Arc<dyn Edge>, Error> {
        let mut live_rx = self.live.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let dbrps = dbrps.to_vec();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    point = live_rx.recv() => {
                        match point {
                            Ok(p) => {
                                let matches = dbrps.iter().any(|d| {
                                    d.database == p.database && d.retention_policy == p.retention_policy
                                });
                                if matches && tx.send(p).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            }
        });
        self.forks.lock().unwrap().insert(name.to_string(), stop_tx);
        Ok(Arc::new(LiveEdge {
            rx: tokio::sync::Mutex::new(rx),
            closed_tx,
            closed_rx,
        }))
    }

    async fn del_fork(&self, name: &str) {
        if let Some(stop_tx) = self.forks.lock().unwrap().remove(name) {
            let _ = stop_tx.send(true);
        }
    }

    async fn start_task(&self, task: &Task) -> Result<ExecutingTask, Error> {
        // A real dataflow graph compiler is out of scope; this null
        // executor just logs what it receives so `/replay` has something
        // real to drive without requiring one.
        match task.task_type {
            TaskType::Stream => Ok(ExecutingTask {
                point_sink: Some(Arc::new(LoggingPointSink(task.name.clone()))),
                batch_sinks: Vec::new(),
            }),
            TaskType::Batch => {
                let sinks = task
                    .batch_plan
                    .iter()
                    .enumerate()
                    .map(|(i, _)| Arc::new(LoggingBatchSink(task.name.clone(), i)) as Arc<dyn BatchSink>)
                    .collect();
                Ok(ExecutingTask {
                    point_sink: None,
                    batch_sinks: sinks,
                })
            }
        }
    }

    async fn stop_task(&self, _task_name: &str) -> Result<(), Error> {
        Ok(())
    }
}

struct LoggingPointSink(String);

#[async_trait]
impl PointSink for LoggingPointSink {
    async fn send(&self, point: Point) -> Result<(), Error> {
        debug!(task = %self.0, measurement = %point.measurement, "replayed point");
        Ok(())
    }
}

struct LoggingBatchSink(String, usize);

#[async_trait]
impl BatchSink for LoggingBatchSink {
    async fn send(&self, batch: crate::types::Batch) -> Result<(), Error> {
        debug!(task = %self.0, slot = self.1, rows = batch.rows.len(), "replayed batch");
        Ok(())
    }
}

/// A [`TaskStore`] backed by a TOML manifest of named tasks.
#[derive(Deserialize)]
struct ManifestTask {
    name: String,
    #[serde(rename = "type")]
    task_type: ManifestTaskType,
    #[serde(default)]
    dbrps: Vec<ManifestDbrp>,
    #[serde(default)]
    batch_plan: Vec<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum ManifestTaskType {
    Stream,
    Batch,
}

#[derive(Deserialize)]
struct ManifestDbrp {
    database: String,
    retention_policy: String,
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default, rename = "task")]
    tasks: Vec<ManifestTask>,
}

pub struct TomlTaskStore {
    tasks: HashMap<String, Task>,
}

impl TomlTaskStore {
    pub fn load_file(path: &std::path::Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| err!(Internal, msg("reading task manifest {}", path.display()), source(e)))?;
        let manifest: Manifest = toml::from_str(&text)
            .map_err(|e| err!(InvalidArgument, msg("parsing task manifest {}", path.display()), source(e)))?;
        let tasks = manifest
            .tasks
            .into_iter()
            .map(|t| {
                (
                    t.name.clone(),
                    Task {
                        name: t.name,
                        task_type: match t.task_type {
                            ManifestTaskType::Stream => TaskType::Stream,
                            ManifestTaskType::Batch => TaskType::Batch,
                        },
                        dbrps: t
                            .dbrps
                            .into_iter()
                            .map(|d| Dbrp {
                                database: d.database,
                                retention_policy: d.retention_policy,
                            })
                            .collect(),
                        batch_plan: t.batch_plan,
                    },
                )
            })
            .collect();
        Ok(TomlTaskStore { tasks })
    }
}

#[async_trait]
impl TaskStore for TomlTaskStore {
    async fn load(&self, name: &str) -> Result<Task, Error> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| err!(NotFound, msg("no task named {name:?}")))
    }
}

/// Wire schema for the time-series database's HTTP query API: a command and
/// optional bound range in, a list of result tables out.
#[derive(serde::Serialize)]
struct HttpQueryRequest<'a> {
    q: &'a str,
    start: Option<Timestamp>,
    stop: Option<Timestamp>,
}

#[derive(Deserialize)]
struct HttpQueryResponse {
    #[serde(default)]
    results: Vec<HttpResultTable>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct HttpResultTable {
    name: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    rows: Vec<HttpRow>,
}

#[derive(Deserialize)]
struct HttpRow {
    time: Timestamp,
    fields: BTreeMap<String, FieldValue>,
}

/// Queries a real time-series database over HTTP: `POST {base_url}/query`
/// with a JSON body, expecting a JSON array of result tables back.
pub struct HttpTsdbClient {
    base_url: String,
    client: Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>>,
}

impl HttpTsdbClient {
    pub fn new(base_url: String) -> Self {
        HttpTsdbClient {
            base_url,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

#[async_trait]
impl TsdbClient for HttpTsdbClient {
    async fn query(&self, cmd: Command) -> Result<QueryResponse, Error> {
        let body = serde_json::to_vec(&HttpQueryRequest {
            q: &cmd.text,
            start: cmd.start,
            stop: cmd.stop,
        })
        .err_kind(base::ErrorKind::Internal)?;
        let uri = format!("{}/query", self.base_url);
        let req = http::Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .err_kind(base::ErrorKind::Internal)?;
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| err!(Unavailable, msg("querying time-series database"), source(e)))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| err!(Unavailable, msg("reading time-series database response"), source(e)))?
            .to_bytes();
        if !status.is_success() {
            return Err(err!(
                Unavailable,
                msg("time-series database returned {status}: {}", String::from_utf8_lossy(&body))
            ));
        }
        let parsed: HttpQueryResponse = serde_json::from_slice(&body)
            .map_err(|e| err!(Unavailable, msg("decoding time-series database response"), source(e)))?;
        if let Some(e) = parsed.error {
            return Err(err!(Unavailable, msg("time-series database: {e}")));
        }
        Ok(QueryResponse {
            results: parsed
                .results
                .into_iter()
                .map(|t| ResultTable {
                    name: t.name,
                    tags: t.tags,
                    rows: t.rows.into_iter().map(|r| (r.time, r.fields)).collect(),
                })
                .collect(),
        })
    }
}
