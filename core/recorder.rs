// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The three capture modes that write a recording through the [`Store`]:
//! stream-from-live, batch-from-queries, and query-to-either.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use jiff::Timestamp;

use base::shutdown;
use base::{err, Error};

use crate::collab::{tables_to_batches, Command, TaskMaster, TaskStore, TsdbClient};
use crate::store::{Store, StreamWriter};
use crate::types::{Dbrp, Point, RecordingId, TaskType};

/// Records `duration` worth of points from the live fork matching `dbrps`.
///
/// Spawns a producer that drains the fork's edge into the stream writer
/// while this call sleeps for `duration`; once the sleep resolves (or
/// `shutdown` fires first, so a process shutdown doesn't strand a recording
/// running to its full duration) it signals stop, closes the edge (the
/// producer's termination trigger), removes the fork, and closes the
/// writer. A point or two written after the duration elapses (the race
/// between the sleep resolving and the producer's next iteration) is
/// accepted, not trimmed.
pub async fn record_stream(
    store: &Store,
    tm: &dyn TaskMaster,
    duration: std::time::Duration,
    dbrps: Vec<Dbrp>,
    shutdown: &shutdown::Receiver,
) -> Result<RecordingId, Error> {
    let id = RecordingId::new();
    let fork_name = id.to_string();
    let edge = tm.new_fork(&fork_name, &dbrps).await?;
    let writer = store.new_stream_writer(id)?;
    let stop = Arc::new(AtomicBool::new(false));

    let producer_edge = edge.clone();
    let producer_stop = stop.clone();
    let producer = tokio::spawn(async move {
        let mut writer = writer;
        loop {
            if producer_stop.load(Ordering::Acquire) {
                break;
            }
            match producer_edge.next_point().await {
                Some(p) => {
                    if let Err(e) = writer.write_point(&p) {
                        return (writer, Err(e));
                    }
                }
                None => break,
            }
        }
        (writer, Ok(()))
    });

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.as_future() => {}
    }

    // Happens-before the producer's subsequent load/call: the flag store is
    // release-ordered, and closing the edge is the belt-and-braces backup
    // that unblocks a producer already parked in `next_point`.
    stop.store(true, Ordering::Release);
    edge.close();
    tm.del_fork(&fork_name).await;

    let (writer, write_result) = producer
        .await
        .map_err(|e| err!(Internal, msg("stream recorder producer task panicked"), source(e)))?;
    write_result?;
    writer.close()?;
    Ok(id)
}

/// Records a batch task's query plan, bound to `[start, stop]`, one archive
/// entry per batch slot.
pub async fn record_batch(
    store: &Store,
    task_store: &dyn TaskStore,
    tsdb: &dyn TsdbClient,
    task_name: &str,
    start: Option<Timestamp>,
    stop: Option<Timestamp>,
) -> Result<RecordingId, Error> {
    let task = task_store.load(task_name).await?;
    if task.task_type != TaskType::Batch {
        return Err(err!(
            InvalidArgument,
            msg("task {task_name:?} is a stream task, not batch")
        ));
    }
    let id = RecordingId::new();
    let mut archive = store.new_batch_archive(id)?;
    for (i, slot) in task.batch_plan.iter().enumerate() {
        let idx = u32::try_from(i).map_err(|_| err!(Internal, msg("too many batch slots")))?;
        archive.create_entry(idx)?;
        for query in slot {
            let resp = tsdb
                .query(Command {
                    text: query.clone(),
                    start,
                    stop,
                })
                .await?;
            for batch in tables_to_batches(None, resp) {
                archive.write_batch(&batch)?;
            }
        }
    }
    archive.close()?;
    Ok(id)
}

/// Parses a `SELECT ... FROM "db"."rp"."measurement" ...` query string,
/// requiring exactly one fully-qualified measurement source.
fn parse_fully_qualified_source(query: &str) -> Result<(String, String), Error> {
    let trimmed = query.trim_start();
    if trimmed.len() < 6 || !trimmed[..6].eq_ignore_ascii_case("select") {
        return Err(err!(InvalidArgument, msg("query must be a SELECT statement")));
    }
    let upper = query.to_ascii_uppercase();
    let from_at = upper
        .find(" FROM ")
        .ok_or_else(|| err!(InvalidArgument, msg("query has no FROM clause")))?;
    let after_from = &query[from_at + 6..];
    let source_end = after_from.find(char::is_whitespace).unwrap_or(after_from.len());
    let source = &after_from[..source_end];
    if source.contains(',') {
        return Err(err!(
            InvalidArgument,
            msg("query must have exactly one measurement source")
        ));
    }
    let parts: Vec<&str> = source.split('.').map(|p| p.trim_matches('"')).collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(err!(
            InvalidArgument,
            msg("query source {source:?} must be fully qualified as \"database\".\"retention_policy\".\"measurement\"")
        ));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

/// Records an ad hoc query directly to a recording of type `tt`, without
/// going through a compiled task.
pub async fn record_query(
    store: &Store,
    tsdb: &dyn TsdbClient,
    query: &str,
    tt: TaskType,
) -> Result<RecordingId, Error> {
    let (database, retention_policy) = parse_fully_qualified_source(query)?;
    let resp = tsdb
        .query(Command {
            text: query.to_string(),
            start: None,
            stop: None,
        })
        .await?;
    let id = RecordingId::new();
    match tt {
        TaskType::Stream => {
            let mut writer = store.new_stream_writer(id)?;
            if let Err(e) = write_query_as_points(&mut writer, resp, &database, &retention_policy) {
                return Err(e);
            }
            writer.close()?;
        }
        TaskType::Batch => {
            let mut archive = store.new_batch_archive(id)?;
            archive.create_entry(0)?;
            for batch in tables_to_batches(None, resp) {
                archive.write_batch(&batch)?;
            }
            archive.close()?;
        }
    }
    Ok(id)
}

fn write_query_as_points(
    writer: &mut StreamWriter,
    resp: crate::collab::QueryResponse,
    database: &str,
    retention_policy: &str,
) -> Result<(), Error> {
    for batch in tables_to_batches(None, resp) {
        for row in batch.rows {
            let mut tags = batch.group.clone();
            tags.extend(row.tags);
            let point = Point {
                measurement: batch.name.clone(),
                database: database.to_string(),
                retention_policy: retention_policy.to_string(),
                tags,
                fields: row.fields,
                time_unix_nanos: row.time_unix_nanos,
            };
            writer.write_point(&point)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::collab::fake::{FakeTaskStore, FakeTsdbClient};
    use crate::collab::{QueryResponse, ResultTable};
    use crate::types::FieldValue;

    #[test]
    fn fully_qualified_source_required() {
        assert!(parse_fully_qualified_source("select * from cpu").is_err());
        assert!(parse_fully_qualified_source("select * from \"db\".cpu").is_err());
        let (db, rp) =
            parse_fully_qualified_source("select * from \"telegraf\".\"autogen\".\"cpu\"").unwrap();
        assert_eq!(db, "telegraf");
        assert_eq!(rp, "autogen");
    }

    #[test]
    fn rejects_non_select() {
        assert!(parse_fully_qualified_source("drop database telegraf").is_err());
    }

    fn one_row_response(value: f64) -> QueryResponse {
        QueryResponse {
            results: vec![ResultTable {
                name: "cpu".to_string(),
                tags: Default::default(),
                rows: vec![(
                    "1971-01-01T00:00:01Z".parse().unwrap(),
                    [("value".to_string(), FieldValue::Float(value))].into(),
                )],
            }],
        }
    }

    /// A two-slot batch task's plan, each slot one query, each bound to
    /// produce a single-row result: the archive should hold one batch per
    /// slot matching that slot's query.
    #[tokio::test]
    async fn record_batch_writes_one_entry_per_slot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let task_store = FakeTaskStore::new(vec![crate::collab::Task {
            name: "mytask".to_string(),
            task_type: TaskType::Batch,
            dbrps: Vec::new(),
            batch_plan: vec![
                vec!["select * from cpu0".to_string()],
                vec!["select * from cpu1".to_string()],
            ],
        }]);
        let tsdb = FakeTsdbClient::new(HashMap::from([
            ("select * from cpu0".to_string(), one_row_response(1.0)),
            ("select * from cpu1".to_string(), one_row_response(2.0)),
        ]));

        let id = record_batch(&store, &task_store, &tsdb, "mytask", None, None)
            .await
            .unwrap();

        let mut readers = store.find_batch(id).unwrap();
        assert_eq!(readers.len(), 2);
        let b0 = crate::coding::read_batch(&mut readers[0]).unwrap().unwrap();
        assert_eq!(b0.rows[0].fields.get("value").and_then(FieldValue::as_f64), Some(1.0));
        let b1 = crate::coding::read_batch(&mut readers[1]).unwrap().unwrap();
        assert_eq!(b1.rows[0].fields.get("value").and_then(FieldValue::as_f64), Some(2.0));
    }

    #[tokio::test]
    async fn record_batch_rejects_stream_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let task_store = FakeTaskStore::new(vec![crate::collab::Task {
            name: "streamtask".to_string(),
            task_type: TaskType::Stream,
            dbrps: Vec::new(),
            batch_plan: Vec::new(),
        }]);
        let tsdb = FakeTsdbClient::new(HashMap::new());

        let err = record_batch(&store, &task_store, &tsdb, "streamtask", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::InvalidArgument);
    }

    /// `record_query` with `tt = Stream` tags every emitted row as a point
    /// under the query's fully-qualified database/retention-policy.
    #[tokio::test]
    async fn record_query_as_stream_tags_points_with_parsed_dbrp() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let query = "select * from \"telegraf\".\"autogen\".\"cpu\"";
        let tsdb = FakeTsdbClient::new(HashMap::from([(query.to_string(), one_row_response(3.0))]));

        let id = record_query(&store, &tsdb, query, TaskType::Stream).await.unwrap();

        let mut r = store.find_stream(id).unwrap();
        let point = crate::coding::read_point(&mut r).unwrap().unwrap();
        assert_eq!(point.database, "telegraf");
        assert_eq!(point.retention_policy, "autogen");
        assert_eq!(point.fields.get("value").and_then(FieldValue::as_f64), Some(3.0));
        assert!(crate::coding::read_point(&mut r).unwrap().is_none());
    }

    /// `record_query` with `tt = Batch` writes a single archive entry `0`.
    #[tokio::test]
    async fn record_query_as_batch_writes_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let query = "select * from \"telegraf\".\"autogen\".\"cpu\"";
        let tsdb = FakeTsdbClient::new(HashMap::from([(query.to_string(), one_row_response(4.0))]));

        let id = record_query(&store, &tsdb, query, TaskType::Batch).await.unwrap();

        let mut readers = store.find_batch(id).unwrap();
        assert_eq!(readers.len(), 1);
        let b = crate::coding::read_batch(&mut readers[0]).unwrap().unwrap();
        assert_eq!(b.rows[0].fields.get("value").and_then(FieldValue::as_f64), Some(4.0));
    }

    #[tokio::test]
    async fn record_query_requires_fully_qualified_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let tsdb = FakeTsdbClient::new(HashMap::new());
        let err = record_query(&store, &tsdb, "select * from cpu", TaskType::Stream)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::InvalidArgument);
    }
}
