// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Trait contracts for the collaborators the core consumes: the task
//! store, task master, live edges, and TSDB client. Concrete in-process
//! implementations sufficient to run `chronorec` standalone live in
//! [`live`]; pure test doubles live in [`fake`].

pub mod fake;
pub mod live;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use jiff::Timestamp;

use base::Error;

use crate::types::{Batch, Dbrp, FieldValue, Point, TaskType};

/// A compiled task as loaded from the task store: its subscriptions (for
/// stream tasks) or query plan (for batch tasks).
#[derive(Clone, Debug)]
pub struct Task {
    pub name: String,
    pub task_type: TaskType,
    pub dbrps: Vec<Dbrp>,
    /// Ordered batch slots, each an ordered list of query strings. Only
    /// meaningful for `TaskType::Batch`.
    pub batch_plan: Vec<Vec<String>>,
}

/// Looks up compiled tasks by name.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Task, Error>;
}

/// The output side of a live fork or a replay: accepts points one at a time.
#[async_trait]
pub trait PointSink: Send + Sync {
    /// Delivers one point. Returns an error (of kind `Cancelled`) once the
    /// sink has been closed, mirroring a closed channel.
    async fn send(&self, point: Point) -> Result<(), Error>;
}

/// The output side of one batch-query slot: accepts batches one at a time.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn send(&self, batch: Batch) -> Result<(), Error>;
}

/// A tap on the live stream, filtered to a fixed set of DBRPs, feeding a
/// single consumer (here, always the Recorder).
#[async_trait]
pub trait Edge: Send + Sync {
    /// Returns the next point, or `None` once the edge has been closed and
    /// drained.
    async fn next_point(&self) -> Option<Point>;

    /// Closes the edge. Idempotent; wakes any pending `next_point` call.
    fn close(&self);
}

/// A task that has been started against an isolated task master, exposing
/// the sinks the Replayer feeds.
pub struct ExecutingTask {
    /// Present for `TaskType::Stream` tasks.
    pub point_sink: Option<Arc<dyn PointSink>>,
    /// One sink per batch slot, present for `TaskType::Batch` tasks.
    pub batch_sinks: Vec<Arc<dyn BatchSink>>,
}

/// Forks the live stream, starts tasks, and exposes their input sinks.
/// `TaskMaster::isolated` produces a fresh instance for replay, sharing no
/// state with the live system.
#[async_trait]
pub trait TaskMaster: Send + Sync {
    /// Installs a fork named `name`, filtered to `dbrps`, on the live
    /// stream; returns the edge points are read from.
    async fn new_fork(&self, name: &str, dbrps: &[Dbrp]) -> Result<Arc<dyn Edge>, Error>;

    /// Removes the fork named `name`. A no-op if it doesn't exist.
    async fn del_fork(&self, name: &str);

    /// Starts executing `task`, returning the sinks that feed its input
    /// edges.
    async fn start_task(&self, task: &Task) -> Result<ExecutingTask, Error>;

    /// Reports that a previously-started task has finished (or should be
    /// torn down), releasing any resources `start_task` acquired.
    async fn stop_task(&self, task_name: &str) -> Result<(), Error>;
}

/// One query bound to a time range, as issued to the TSDB.
#[derive(Clone, Debug)]
pub struct Command {
    pub text: String,
    pub start: Option<Timestamp>,
    pub stop: Option<Timestamp>,
}

/// One query result table: a measurement name, the tags the rows are
/// grouped by, and the ordered `(time, fields)` rows themselves.
#[derive(Clone, Debug)]
pub struct ResultTable {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub rows: Vec<(Timestamp, BTreeMap<String, FieldValue>)>,
}

#[derive(Clone, Debug, Default)]
pub struct QueryResponse {
    pub results: Vec<ResultTable>,
}

/// The time-series database client the Recorder queries against.
#[async_trait]
pub trait TsdbClient: Send + Sync {
    async fn query(&self, cmd: Command) -> Result<QueryResponse, Error>;
}

/// Converts TSDB result tables into the [`Batch`]es a recording stores: one
/// batch per result table, tagged with the table's group-by tag set.
pub fn tables_to_batches(name_override: Option<&str>, resp: QueryResponse) -> Vec<Batch> {
    resp.results
        .into_iter()
        .map(|t| Batch {
            name: name_override.map(str::to_string).unwrap_or(t.name),
            group: t.tags,
            rows: t
                .rows
                .into_iter()
                .map(|(time, fields)| crate::types::Row {
                    time_unix_nanos: time.as_nanosecond() as i64,
                    tags: BTreeMap::new(),
                    fields,
                })
                .collect(),
        })
        .collect()
}
