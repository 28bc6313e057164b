// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The HTTP surface: four recording/replay routes plus an ambient `/ping`
//! liveness probe, all served over hyper 1.x.

use std::collections::HashSet;
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use jiff::Timestamp;
use serde::Serialize;
use tracing::{debug, warn};
use url::form_urlencoded;

use base::clock::{Clock, Fast, Wall};
use base::shutdown;
use base::{err, Error, ErrorKind};
use chronorec_core::collab::live::LiveTaskMaster;
use chronorec_core::collab::{TaskMaster, TaskStore, TsdbClient};
use chronorec_core::{recorder, RecordingId, Replayer, Store, TaskType};

pub type Body = Full<Bytes>;

/// Everything a request handler needs: the catalog, the shared task store
/// and live task master, and the (possibly unconfigured) TSDB client.
pub struct AppState {
    pub store: Store,
    pub task_store: Arc<dyn TaskStore>,
    pub live: Arc<LiveTaskMaster>,
    pub tsdb: Arc<dyn TsdbClient>,
    pub shutdown: shutdown::Receiver,
}

fn plain_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(Full::new(body.into()))
        .expect("hardcoded response head is valid")
}

fn json_response<T: Serialize>(status: StatusCode, val: &T) -> Response<Body> {
    match serde_json::to_vec(val) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .body(Full::new(Bytes::from(bytes)))
            .expect("hardcoded response head is valid"),
        Err(e) => from_error(err!(Internal, msg("encoding response"), source(e))),
    }
}

/// Maps an `ErrorKind` to an HTTP status and wraps the message as
/// `{"Error": "..."}`.
fn from_error(e: Error) -> Response<Body> {
    let status = match e.kind() {
        ErrorKind::InvalidArgument | ErrorKind::OutOfRange => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    #[derive(Serialize)]
    struct ErrBody {
        #[serde(rename = "Error")]
        error: String,
    }
    json_response(
        status,
        &ErrBody {
            error: e.to_string(),
        },
    )
}

struct Params(std::collections::HashMap<String, String>);

impl Params {
    fn parse(req: &Request<Incoming>) -> Self {
        let mut map = std::collections::HashMap::new();
        if let Some(q) = req.uri().query() {
            for (k, v) in form_urlencoded::parse(q.as_bytes()) {
                map.insert(k.into_owned(), v.into_owned());
            }
        }
        Params(map)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&str, Error> {
        self.get(key)
            .ok_or_else(|| err!(InvalidArgument, msg("missing required parameter {key:?}")))
    }
}

async fn recordings(state: &AppState, req: &Request<Incoming>) -> Result<Response<Body>, Error> {
    let params = Params::parse(req);
    let mut filter = HashSet::new();
    if let Some(rids) = params.get("rids") {
        for part in rids.split(',').filter(|s| !s.is_empty()) {
            filter.insert(RecordingId::from_str(part)?);
        }
    }
    // A directory-read failure here maps to 404, not 500: an odd mapping,
    // but the one this handler has always returned, preserved for callers
    // that may depend on it.
    let recordings = state.store.list(&filter).map_err(|e| {
        base::Error::new(ErrorKind::NotFound, Some("listing recordings".to_string()), Some(Box::new(e)))
    })?;
    #[derive(Serialize)]
    struct Resp {
        #[serde(rename = "Recordings")]
        recordings: Vec<chronorec_core::RecordingInfo>,
    }
    Ok(json_response(StatusCode::OK, &Resp { recordings }))
}

async fn delete_recording(state: &AppState, req: &Request<Incoming>) -> Result<Response<Body>, Error> {
    let params = Params::parse(req);
    let id = RecordingId::from_str(params.require("rid")?)?;
    // Best-effort: filesystem errors aren't surfaced to the caller.
    if let Err(e) = state.store.delete(id) {
        warn!(err = %e.chain(), %id, "delete failed (ignored)");
    }
    Ok(plain_response(StatusCode::OK, Bytes::new()))
}

async fn record(state: &AppState, req: &Request<Incoming>) -> Result<Response<Body>, Error> {
    let params = Params::parse(req);
    let mode = params.require("type")?;
    let id = match mode {
        "stream" => {
            let name = params.require("name")?;
            let duration = base::duration::parse_duration(params.require("duration")?)?;
            let duration = std::time::Duration::try_from(duration)
                .map_err(|_| err!(InvalidArgument, msg("duration must be non-negative")))?;
            let task = state.task_store.load(name).await?;
            recorder::record_stream(
                &state.store,
                state.live.as_ref(),
                duration,
                task.dbrps,
                &state.shutdown,
            )
            .await?
        }
        "batch" => {
            let name = params.require("name")?;
            let start = params.get("start");
            let past = params.get("past");
            if start.is_some() && past.is_some() {
                return Err(err!(
                    InvalidArgument,
                    msg("specify at most one of \"start\" or \"past\"")
                ));
            }
            let start = match (start, past) {
                (Some(s), None) => Some(base::duration::parse_rfc3339(s)?),
                (None, Some(p)) => Some(Timestamp::now() - base::duration::parse_duration(p)?),
                _ => None,
            };
            let stop = params.get("stop").map(base::duration::parse_rfc3339).transpose()?;
            recorder::record_batch(
                &state.store,
                state.task_store.as_ref(),
                state.tsdb.as_ref(),
                name,
                start,
                stop,
            )
            .await?
        }
        "query" => {
            let query = params.require("query")?;
            let tt = TaskType::parse_query_param(params.require("ttype")?)?;
            recorder::record_query(&state.store, state.tsdb.as_ref(), query, tt).await?
        }
        other => {
            return Err(err!(
                InvalidArgument,
                msg("unknown record type {other:?}; want \"stream\", \"batch\", or \"query\"")
            ));
        }
    };
    #[derive(Serialize)]
    struct Resp {
        #[serde(rename = "RecordingID")]
        recording_id: RecordingId,
    }
    Ok(json_response(StatusCode::OK, &Resp { recording_id: id }))
}

async fn replay(state: &AppState, req: &Request<Incoming>) -> Result<Response<Body>, Error> {
    let params = Params::parse(req);
    let name = params.require("name")?;
    let id = RecordingId::from_str(params.require("id")?)?;
    let rec_time = matches!(params.get("rec-time"), Some("true") | Some("1"));
    let clock: Arc<dyn Clock> = match params.get("clock").unwrap_or("") {
        // Pinned to replay start, not `Wall::default`'s 1970 zero: `zero()
        // + (tp - t0)` must land in the future for `until` to actually
        // pace, not resolve instantly against a decades-stale target.
        "" | "wall" => Arc::new(Wall::new(Timestamp::now())),
        "fast" => Arc::new(Fast::new(Timestamp::now())),
        other => {
            return Err(err!(
                InvalidArgument,
                msg("unknown clock {other:?}; want \"wall\" or \"fast\"")
            ));
        }
    };

    let task = state.task_store.load(name).await?;
    // An isolated task master per replay: it shares no state with the live
    // system beyond the persisted task definition just loaded above.
    let isolated = LiveTaskMaster::new();
    let executing = isolated.start_task(&task).await?;
    let replayer = Replayer::new(clock, state.shutdown.clone());

    match task.task_type {
        TaskType::Stream => {
            let src = state.store.find_stream(id)?;
            let sink = executing
                .point_sink
                .ok_or_else(|| err!(Internal, msg("task {name:?} yielded no point sink")))?;
            let rx = replayer.replay_stream(src, sink, rec_time);
            rx.await
                .map_err(|e| err!(Internal, msg("replay task dropped its completion channel"), source(e)))??;
        }
        TaskType::Batch => {
            let srcs = state.store.find_batch(id)?;
            let rx = replayer.replay_batch(srcs, executing.batch_sinks);
            rx.await
                .map_err(|e| err!(Internal, msg("replay task dropped its completion channel"), source(e)))??;
        }
    }
    Ok(plain_response(StatusCode::OK, Bytes::new()))
}

/// Routes and serves one request, never failing the connection itself:
/// handler errors become JSON error responses, not hyper errors.
pub async fn serve(state: Arc<AppState>, req: Request<Incoming>) -> Result<Response<Body>, Infallible> {
    debug!(method = %req.method(), path = req.uri().path(), "request");
    let result: Result<Response<Body>, Error> = match (req.method().as_str(), req.uri().path()) {
        ("GET", "/recordings") => recordings(&state, &req).await,
        ("DELETE", "/recording") => delete_recording(&state, &req).await,
        ("POST", "/record") => record(&state, &req).await,
        ("POST", "/replay") => replay(&state, &req).await,
        ("GET", "/ping") => Ok(plain_response(StatusCode::OK, Bytes::new())),
        (method, path) => Err(err!(
            NotFound,
            msg("no route for {method} {path}")
        )),
    };
    Ok(result.unwrap_or_else(|e| {
        warn!(err = %e.chain(), "request failed");
        from_error(e)
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use chronorec_core::collab::fake::{FakeTaskStore, FakeTsdbClient};
    use chronorec_core::collab::Task;
    use chronorec_core::Dbrp;

    use super::*;

    /// Spawns the real HTTP server on an ephemeral port, the same way the
    /// daemon's accept loop does, and returns its address. The listener
    /// task is aborted when the returned handle is dropped.
    async fn spawn(state: Arc<AppState>) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(a) => a,
                    Err(_) => return,
                };
                let io = TokioIo::new(stream);
                let state = state.clone();
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, hyper::service::service_fn(move |req| serve(state.clone(), req)))
                        .await;
                });
            }
        });
        (addr, handle)
    }

    /// Builds an `AppState` for tests, along with the shutdown sender that
    /// must outlive it: dropping the sender would cancel any in-flight
    /// recording or replay the test is still waiting on.
    fn test_state(dir: &std::path::Path) -> (Arc<AppState>, shutdown::Sender) {
        let stream_task = Task {
            name: "mytask".to_string(),
            task_type: TaskType::Stream,
            dbrps: vec![Dbrp {
                database: "telegraf".to_string(),
                retention_policy: "autogen".to_string(),
            }],
            batch_plan: Vec::new(),
        };
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let state = Arc::new(AppState {
            store: Store::new(dir).unwrap(),
            task_store: Arc::new(FakeTaskStore::new(vec![stream_task])),
            live: LiveTaskMaster::new(),
            tsdb: Arc::new(FakeTsdbClient::new(HashMap::new())),
            shutdown: shutdown_rx,
        });
        (state, shutdown_tx)
    }

    #[tokio::test]
    async fn ping_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _shutdown_tx) = test_state(dir.path());
        let (addr, _server) = spawn(state).await;
        let resp = reqwest::get(format!("http://{addr}/ping")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }

    /// Every request logs its method/path at `debug` on entry (§10.1).
    #[tracing_test::traced_test]
    #[tokio::test]
    async fn requests_are_logged_on_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _shutdown_tx) = test_state(dir.path());
        let (addr, _server) = spawn(state).await;
        let resp = reqwest::get(format!("http://{addr}/ping")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert!(logs_contain("request"));
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _shutdown_tx) = test_state(dir.path());
        let (addr, _server) = spawn(state).await;
        let resp = reqwest::get(format!("http://{addr}/nonexistent")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn record_missing_type_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _shutdown_tx) = test_state(dir.path());
        let (addr, _server) = spawn(state).await;
        let client = reqwest::Client::new();
        let resp = client.post(format!("http://{addr}/record")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn record_list_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _shutdown_tx) = test_state(dir.path());
        let (addr, _server) = spawn(state).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/record?type=stream&name=mytask&duration=10ms"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        let id = body["RecordingID"].as_str().unwrap().to_string();

        let resp = client.get(format!("http://{addr}/recordings")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        let recordings = body["Recordings"].as_array().unwrap();
        assert_eq!(recordings.len(), 1);
        assert_eq!(recordings[0]["ID"].as_str().unwrap(), id);
        assert_eq!(recordings[0]["Type"].as_str().unwrap(), "Stream");

        let resp = client
            .delete(format!("http://{addr}/recording?rid={id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        let resp = client.get(format!("http://{addr}/recordings")).send().await.unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["Recordings"].as_array().unwrap().is_empty());
    }
}
