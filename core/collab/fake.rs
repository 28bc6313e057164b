// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! In-process test doubles for the [`crate::collab`] traits.
//!
//! `TaskMaster`/`TaskStore`/`TsdbClient` fakes here stand in for the real
//! task-graph compiler and time-series database so Recorder/Replayer tests
//! don't need either. The map/reduce/join/derivative sinks are a stubbed
//! batch-task evaluator, not a real query language, just enough windowed
//! arithmetic to exercise the Replayer's clock discipline against concrete
//! scenarios.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use jiff::Timestamp;
use tokio::sync::{mpsc, watch};

use base::{err, Error};

use crate::types::{Batch, Dbrp, FieldValue, Point, TaskType};

use super::{BatchSink, Command, Edge, ExecutingTask, PointSink, QueryResponse, Task, TaskMaster, TaskStore, TsdbClient};

/// One row emitted by a fake batch evaluator, collected for test assertions.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputRow {
    pub group: BTreeMap<String, String>,
    pub time: Timestamp,
    pub fields: BTreeMap<String, FieldValue>,
}

pub type Collector = Arc<Mutex<Vec<OutputRow>>>;

pub fn new_collector() -> Collector {
    Arc::new(Mutex::new(Vec::new()))
}

fn elapsed_secs(from: Timestamp, to: Timestamp) -> f64 {
    let d = std::time::Duration::try_from(to - from).unwrap_or_default();
    d.as_secs_f64()
}

/// Windowed count-then-sum: each incoming batch is one window's worth of
/// raw rows; the sink counts them and reports that count as `sum` (S4/S5
/// both reduce with count-then-sum; S5 additionally joins two sides).
pub struct CountSumSink {
    group: BTreeMap<String, String>,
    out: Collector,
}

impl CountSumSink {
    pub fn new(group: BTreeMap<String, String>, out: Collector) -> Self {
        CountSumSink { group, out }
    }
}

#[async_trait]
impl BatchSink for CountSumSink {
    async fn send(&self, batch: Batch) -> Result<(), Error> {
        let Some(t) = batch.window_end() else {
            return Ok(());
        };
        let mut fields = BTreeMap::new();
        fields.insert("sum".to_string(), FieldValue::Float(batch.rows.len() as f64));
        self.out.lock().unwrap().push(OutputRow {
            group: self.group.clone(),
            time: t,
            fields,
        });
        Ok(())
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Left,
    Right,
}

struct JoinState {
    left: Mutex<HashMap<i64, f64>>,
    right: Mutex<HashMap<i64, f64>>,
    group: BTreeMap<String, String>,
    out: Collector,
}

/// One side of a two-way join-then-count-then-sum (S5): each side counts its
/// own batch's rows; once both sides have reported the same window, the
/// counts are summed and released.
pub struct JoinCountSumSink {
    state: Arc<JoinState>,
    side: Side,
}

impl JoinCountSumSink {
    /// Builds the two sinks for a join's left and right sides; both push
    /// into the same `out` collector once a window completes on both sides.
    pub fn pair(group: BTreeMap<String, String>, out: Collector) -> (Self, Self) {
        let state = Arc::new(JoinState {
            left: Mutex::new(HashMap::new()),
            right: Mutex::new(HashMap::new()),
            group,
            out,
        });
        (
            JoinCountSumSink {
                state: state.clone(),
                side: Side::Left,
            },
            JoinCountSumSink { state, side: Side::Right },
        )
    }
}

#[async_trait]
impl BatchSink for JoinCountSumSink {
    async fn send(&self, batch: Batch) -> Result<(), Error> {
        let Some(t) = batch.window_end() else {
            return Ok(());
        };
        let key = t.as_nanosecond() as i64;
        let count = batch.rows.len() as f64;
        let (mut mine, other) = match self.side {
            Side::Left => (self.state.left.lock().unwrap(), self.state.right.lock().unwrap()),
            Side::Right => (self.state.right.lock().unwrap(), self.state.left.lock().unwrap()),
        };
        mine.insert(key, count);
        if let Some(other_count) = other.get(&key) {
            let mut fields = BTreeMap::new();
            fields.insert("sum".to_string(), FieldValue::Float(count + other_count));
            self.state.out.lock().unwrap().push(OutputRow {
                group: self.state.group.clone(),
                time: t,
                fields,
            });
        }
        Ok(())
    }
}

/// Windowed derivative of `sum(value)` across consecutive batches: each
/// incoming batch's rows are summed into one scalar, and the derivative
/// against the *previous* batch's scalar (scaled to `unit`) is emitted, so
/// the first batch only seeds state and emits nothing.
pub struct DerivativeSink {
    unit: std::time::Duration,
    non_negative: bool,
    group: BTreeMap<String, String>,
    out: Collector,
    prev: Mutex<Option<(Timestamp, f64)>>,
}

impl DerivativeSink {
    pub fn new(
        unit: std::time::Duration,
        non_negative: bool,
        group: BTreeMap<String, String>,
        out: Collector,
    ) -> Self {
        DerivativeSink {
            unit,
            non_negative,
            group,
            out,
            prev: Mutex::new(None),
        }
    }
}

#[async_trait]
impl BatchSink for DerivativeSink {
    async fn send(&self, batch: Batch) -> Result<(), Error> {
        let Some(t) = batch.window_end() else {
            return Ok(());
        };
        let value: f64 = batch
            .rows
            .iter()
            .filter_map(|r| r.fields.get("value").and_then(FieldValue::as_f64))
            .sum();
        let mut prev = self.prev.lock().unwrap();
        let Some((prev_t, prev_value)) = *prev else {
            *prev = Some((t, value));
            return Ok(());
        };
        let elapsed = elapsed_secs(prev_t, t);
        let unit_secs = self.unit.as_secs_f64();
        *prev = Some((t, value));
        if elapsed == 0.0 || unit_secs == 0.0 {
            return Ok(());
        }
        let deriv = (value - prev_value) / (elapsed / unit_secs);
        if self.non_negative && deriv < 0.0 {
            return Ok(());
        }
        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), FieldValue::Float(deriv));
        self.out.lock().unwrap().push(OutputRow {
            group: self.group.clone(),
            time: t,
            fields,
        });
        Ok(())
    }
}

/// A point sink that simply appends to a shared, lockable buffer.
pub struct RecordingPointSink {
    points: Mutex<Vec<Point>>,
}

impl RecordingPointSink {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingPointSink {
            points: Mutex::new(Vec::new()),
        })
    }

    pub fn drain(&self) -> Vec<Point> {
        std::mem::take(&mut self.points.lock().unwrap())
    }
}

#[async_trait]
impl PointSink for RecordingPointSink {
    async fn send(&self, point: Point) -> Result<(), Error> {
        self.points.lock().unwrap().push(point);
        Ok(())
    }
}

/// An in-memory live edge backed by an mpsc channel, for stream-recorder
/// tests: a test pushes points via the returned sender and the Recorder
/// drains them via [`Edge::next_point`].
pub struct FakeEdge {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Point>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl FakeEdge {
    pub fn new() -> (mpsc::UnboundedSender<Point>, Arc<Self>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        (
            tx,
            Arc::new(FakeEdge {
                rx: tokio::sync::Mutex::new(rx),
                closed_tx,
                closed_rx,
            }),
        )
    }
}

#[async_trait]
impl Edge for FakeEdge {
    async fn next_point(&self) -> Option<Point> {
        // Fast path: already closed before we ever waited, so don't block
        // on a `changed()` that will never come.
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

/// A TSDB client backed by a fixed, pre-programmed set of responses keyed
/// by query text.
pub struct FakeTsdbClient {
    responses: HashMap<String, QueryResponse>,
}

impl FakeTsdbClient {
    pub fn new(responses: HashMap<String, QueryResponse>) -> Self {
        FakeTsdbClient { responses }
    }
}

#[async_trait]
impl TsdbClient for FakeTsdbClient {
    async fn query(&self, cmd: Command) -> Result<QueryResponse, Error> {
        self.responses
            .get(&cmd.text)
            .cloned()
            .ok_or_else(|| err!(Unavailable, msg("no fake response programmed for {:?}", cmd.text)))
    }
}

/// A task store backed by a fixed in-memory map.
pub struct FakeTaskStore {
    tasks: HashMap<String, Task>,
}

impl FakeTaskStore {
    pub fn new(tasks: Vec<Task>) -> Self {
        FakeTaskStore {
            tasks: tasks.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }
}

#[async_trait]
impl TaskStore for FakeTaskStore {
    async fn load(&self, name: &str) -> Result<Task, Error> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| err!(NotFound, msg("no task named {name:?}")))
    }
}

/// A task master whose `start_task` always yields fresh recording sinks,
/// and whose forks are backed by [`FakeEdge`].
pub struct FakeTaskMaster {
    forks: Mutex<HashMap<String, mpsc::UnboundedSender<Point>>>,
}

impl FakeTaskMaster {
    pub fn new() -> Self {
        FakeTaskMaster {
            forks: Mutex::new(HashMap::new()),
        }
    }

    /// Pushes a point into the named fork, as the live system would.
    pub fn push(&self, name: &str, point: Point) {
        if let Some(tx) = self.forks.lock().unwrap().get(name) {
            let _ = tx.send(point);
        }
    }
}

impl Default for FakeTaskMaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskMaster for FakeTaskMaster {
    async fn new_fork(&self, name: &str, _dbrps: &[Dbrp]) -> Result<Arc<dyn Edge>, Error> {
        let (tx, edge) = FakeEdge::new();
        self.forks.lock().unwrap().insert(name.to_string(), tx);
        Ok(edge)
    }

    async fn del_fork(&self, name: &str) {
        self.forks.lock().unwrap().remove(name);
    }

    async fn start_task(&self, task: &Task) -> Result<ExecutingTask, Error> {
        match task.task_type {
            TaskType::Stream => Ok(ExecutingTask {
                point_sink: Some(RecordingPointSink::new()),
                batch_sinks: Vec::new(),
            }),
            TaskType::Batch => {
                let out = new_collector();
                let sinks: Vec<Arc<dyn BatchSink>> = task
                    .batch_plan
                    .iter()
                    .enumerate()
                    .map(|(i, _)| {
                        Arc::new(CountSumSink::new(
                            BTreeMap::from([("slot".to_string(), i.to_string())]),
                            out.clone(),
                        )) as Arc<dyn BatchSink>
                    })
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
