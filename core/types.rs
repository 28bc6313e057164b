// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The recording/replay domain model: [`Point`], [`Batch`], [`Dbrp`],
//! [`TaskType`] and the catalog-facing [`RecordingInfo`].
//!
//! Timestamps are carried as raw nanoseconds-since-epoch (`i64`) rather than
//! `jiff::Timestamp` in the wire-coded structs, since the on-disk format is
//! nanosecond-precision throughout and this avoids pulling jiff's serde
//! helpers into the bincode path.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use base::{err, Error};

/// Opaque unique identifier for a recording; stable for its lifetime and
/// used verbatim as the on-disk filename stem.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct RecordingId(pub Uuid);

impl RecordingId {
    /// Mints a fresh, randomly-generated id.
    pub fn new() -> Self {
        RecordingId(Uuid::new_v4())
    }
}

impl Default for RecordingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for RecordingId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Uuid::parse_str(s)
            .map(RecordingId)
            .map_err(|e| err!(InvalidArgument, msg("invalid recording id {s:?}"), source(e)))
    }
}

/// Which of the two recording formats/replay paths a task uses.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum TaskType {
    Stream,
    Batch,
}

impl TaskType {
    /// Filename extension (including the leading dot) for this type.
    pub fn extension(self) -> &'static str {
        match self {
            TaskType::Stream => ".srpl",
            TaskType::Batch => ".brpl",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            ".srpl" => Some(TaskType::Stream),
            ".brpl" => Some(TaskType::Batch),
            _ => None,
        }
    }

    pub fn parse_query_param(s: &str) -> Result<Self, Error> {
        match s {
            "stream" => Ok(TaskType::Stream),
            "batch" => Ok(TaskType::Batch),
            _ => Err(err!(
                InvalidArgument,
                msg("invalid recording type {s:?}; want \"stream\" or \"batch\"")
            )),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskType::Stream => "stream",
            TaskType::Batch => "batch",
        })
    }
}

/// A catalog entry as returned by `Store::list`.
#[derive(Clone, Debug, Serialize)]
pub struct RecordingInfo {
    #[serde(rename = "ID")]
    pub id: RecordingId,
    #[serde(rename = "Type")]
    pub task_type: TaskType,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Created", with = "rfc3339")]
    pub created: Timestamp,
}

mod rfc3339 {
    use jiff::Timestamp;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(t: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.to_string())
    }
}

/// A (database, retention-policy) pair identifying a logical data stream.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Dbrp {
    pub database: String,
    pub retention_policy: String,
}

impl fmt::Display for Dbrp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.retention_policy)
    }
}

/// The closed union of value types a point or batch-row field may hold.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    UInt(u64),
    Str(String),
    Bool(bool),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Float(v) => Some(v),
            FieldValue::Int(v) => Some(v as f64),
            FieldValue::UInt(v) => Some(v as f64),
            _ => None,
        }
    }
}

/// The unit of a stream recording: one point of a measurement at a single
/// instant, with nanosecond-precision time. Timestamps may repeat within a
/// recording but are non-decreasing in file order.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    pub database: String,
    pub retention_policy: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Nanoseconds since the Unix epoch.
    pub time_unix_nanos: i64,
}

impl Point {
    pub fn time(&self) -> Timestamp {
        Timestamp::from_nanosecond(self.time_unix_nanos as i128)
            .expect("in-range nanosecond timestamp")
    }

    pub fn set_time(&mut self, t: Timestamp) {
        self.time_unix_nanos = t.as_nanosecond() as i64;
    }
}

/// One row of a [`Batch`]: a timestamp plus the tags/fields observed there.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Row {
    pub time_unix_nanos: i64,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Row {
    pub fn time(&self) -> Timestamp {
        Timestamp::from_nanosecond(self.time_unix_nanos as i128)
            .expect("in-range nanosecond timestamp")
    }
}

/// One query result: a name, the tag set the rows were grouped by, and the
/// ordered rows themselves.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Batch {
    pub name: String,
    pub group: BTreeMap<String, String>,
    pub rows: Vec<Row>,
}

impl Batch {
    /// The pacing anchor for replay: the upper bound of the batch's time
    /// range, i.e. the last row's timestamp. `None` for an empty batch.
    pub fn window_end(&self) -> Option<Timestamp> {
        self.rows.last().map(Row::time)
    }
}

/// A "wrong type" lookup is distinguished from a generic not-found so HTTP
/// handlers (and CLI users) get a clear diagnostic instead of a bare 404.
pub fn wrong_type_error(id: RecordingId, wanted: TaskType, found: TaskType) -> Error {
    err!(
        NotFound,
        msg("recording {id} is a {found} recording, not {wanted}")
    )
}

pub fn not_found_error(id: RecordingId) -> Error {
    err!(NotFound, msg("no recording {id}"))
}
