// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Paces a recording against a [`Clock`] and pushes it into a task's input
//! edges.

use std::io::Read;
use std::sync::Arc;

use jiff::Timestamp;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use base::clock::Clock;
use base::shutdown;
use base::{err, Error};

use crate::coding;
use crate::collab::{BatchSink, PointSink};

/// Paces a recording against a single [`Clock`] and feeds it to a task's
/// input edges. Constructed once per replay.
///
/// Holds a process-wide shutdown [`shutdown::Receiver`]: a replay in
/// progress when shutdown is requested is cancelled rather than left to run
/// to completion, matching the Recorder's treatment of the same signal.
pub struct Replayer {
    clock: Arc<dyn Clock>,
    shutdown: shutdown::Receiver,
}

impl Replayer {
    pub fn new(clock: Arc<dyn Clock>, shutdown: shutdown::Receiver) -> Self {
        Replayer { clock, shutdown }
    }

    /// Replays a stream recording, returning a one-shot completion signal.
    ///
    /// Each point is held until the clock's elapsed time (from the
    /// recording's first point, pinned to the clock's `zero`) reaches the
    /// point's recorded offset. With `rec_time` false, timestamps are
    /// rewritten to the clock's time at emission instead of kept as
    /// recorded.
    pub fn replay_stream(
        &self,
        src: Box<dyn Read + Send>,
        sink: Arc<dyn PointSink>,
        rec_time: bool,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let clock = self.clock.clone();
        let shutdown = self.shutdown.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let res = run_stream(clock, src, sink, rec_time, shutdown).await;
            let _ = tx.send(res);
        });
        rx
    }

    /// Replays a batch recording's per-slot sources into their matching
    /// sinks concurrently, gating each batch's emission on the clock
    /// reaching that batch's window-end. The completion signal fires `Ok`
    /// only once every pair completes; the first error cancels the rest.
    pub fn replay_batch(
        &self,
        srcs: Vec<Box<dyn Read + Send>>,
        sinks: Vec<Arc<dyn BatchSink>>,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let clock = self.clock.clone();
        let shutdown = self.shutdown.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let res = run_batch(clock, srcs, sinks, shutdown).await;
            let _ = tx.send(res);
        });
        rx
    }
}

fn cancelled() -> Error {
    err!(Cancelled, msg("replay cancelled by shutdown"))
}

async fn run_stream(
    clock: Arc<dyn Clock>,
    mut src: Box<dyn Read + Send>,
    sink: Arc<dyn PointSink>,
    rec_time: bool,
    shutdown: shutdown::Receiver,
) -> Result<(), Error> {
    let mut t0: Option<Timestamp> = None;
    loop {
        let Some(mut point) = coding::read_point(&mut src)? else {
            return Ok(());
        };
        let tp = point.time();
        let t0 = *t0.get_or_insert(tp);
        let target = clock.zero() + (tp - t0);
        tokio::select! {
            _ = clock.until(target) => {}
            _ = shutdown.as_future() => return Err(cancelled()),
        }
        if !rec_time {
            point.set_time(clock.now());
        }
        tokio::select! {
            res = sink.send(point) => res?,
            _ = shutdown.as_future() => return Err(cancelled()),
        }
    }
}

async fn run_batch(
    clock: Arc<dyn Clock>,
    srcs: Vec<Box<dyn Read + Send>>,
    sinks: Vec<Arc<dyn BatchSink>>,
    shutdown: shutdown::Receiver,
) -> Result<(), Error> {
    if srcs.len() != sinks.len() {
        return Err(err!(
            Internal,
            msg(
                "batch replay source/sink count mismatch ({} vs {})",
                srcs.len(),
                sinks.len()
            )
        ));
    }
    let mut set = JoinSet::new();
    for (src, sink) in srcs.into_iter().zip(sinks.into_iter()) {
        let clock = clock.clone();
        let shutdown = shutdown.clone();
        set.spawn(replay_one_slot(clock, src, sink, shutdown));
    }
    let mut first_err = None;
    while let Some(res) = set.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                    set.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                if first_err.is_none() {
                    first_err = Some(err!(
                        Internal,
                        msg("batch replay worker panicked"),
                        source(join_err)
                    ));
                    set.abort_all();
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn replay_one_slot(
    clock: Arc<dyn Clock>,
    mut src: Box<dyn Read + Send>,
    sink: Arc<dyn BatchSink>,
    shutdown: shutdown::Receiver,
) -> Result<(), Error> {
    loop {
        let Some(batch) = coding::read_batch(&mut src)? else {
            return Ok(());
        };
        if let Some(end) = batch.window_end() {
            tokio::select! {
                _ = clock.until(end) => {}
                _ = shutdown.as_future() => return Err(cancelled()),
            }
        }
        tokio::select! {
            res = sink.send(batch) => res?,
            _ = shutdown.as_future() => return Err(cancelled()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    use base::clock::{Fast, Wall};
    use jiff::SignedDuration;

    use crate::collab::fake::{
        new_collector, CountSumSink, DerivativeSink, FakeTaskMaster, JoinCountSumSink,
        RecordingPointSink,
    };
    use crate::recorder;
    use crate::store::Store;
    use crate::types::{Batch, Dbrp, FieldValue, Row};

    fn zero() -> Timestamp {
        "1971-01-01T00:00:00Z".parse().unwrap()
    }

    /// One batch whose single row carries `value` and is timestamped
    /// `offset` after `zero()`; `window_end()` is that same offset.
    fn value_batch(offset: SignedDuration, value: f64) -> Batch {
        Batch {
            name: "cpu".to_string(),
            group: BTreeMap::new(),
            rows: vec![Row {
                time_unix_nanos: (zero() + offset).as_nanosecond() as i64,
                tags: BTreeMap::new(),
                fields: BTreeMap::from([("value".to_string(), FieldValue::Float(value))]),
            }],
        }
    }

    /// `n` rows, all timestamped `offset` after `zero()`: a count-then-sum
    /// window of `n` raw samples released at that offset.
    fn count_batch(offset: SignedDuration, n: usize) -> Batch {
        let t = (zero() + offset).as_nanosecond() as i64;
        Batch {
            name: "cpu".to_string(),
            group: BTreeMap::new(),
            rows: (0..n)
                .map(|_| Row {
                    time_unix_nanos: t,
                    tags: BTreeMap::new(),
                    fields: BTreeMap::new(),
                })
                .collect(),
        }
    }

    fn encode(batches: &[Batch]) -> Box<dyn Read + Send> {
        let mut buf = Vec::new();
        for b in batches {
            coding::write_batch(&mut buf, b).unwrap();
        }
        Box::new(Cursor::new(buf))
    }

    fn secs(n: i64) -> SignedDuration {
        SignedDuration::from_secs(n)
    }

    /// A shutdown receiver that never fires: the sender is leaked so these
    /// tests don't need to thread a real shutdown channel through.
    fn no_shutdown() -> shutdown::Receiver {
        let (tx, rx) = shutdown::channel();
        std::mem::forget(tx);
        rx
    }

    /// Derivative of sum(value) over 2s windows with the default 1s unit:
    /// rows at +0s, +2s, +4s, +6s, each 0.5.
    #[tokio::test]
    async fn batch_derivative_default_unit() {
        let clock: Arc<dyn Clock> = Arc::new(Fast::new(zero() + secs(21)));
        let batches = vec![
            value_batch(secs(-2), 0.0),
            value_batch(secs(0), 1.0),
            value_batch(secs(2), 2.0),
            value_batch(secs(4), 3.0),
            value_batch(secs(6), 4.0),
        ];
        let out = new_collector();
        let sink: Arc<dyn BatchSink> = Arc::new(DerivativeSink::new(
            std::time::Duration::from_secs(1),
            false,
            BTreeMap::new(),
            out.clone(),
        ));
        let replayer = Replayer::new(clock, no_shutdown());
        let rx = replayer.replay_batch(vec![encode(&batches)], vec![sink]);
        rx.await.unwrap().unwrap();

        let rows = out.lock().unwrap();
        let times: Vec<SignedDuration> = rows.iter().map(|r| r.time - zero()).collect();
        assert_eq!(times, vec![secs(0), secs(2), secs(4), secs(6)]);
        for r in rows.iter() {
            assert_eq!(r.fields.get("value").and_then(FieldValue::as_f64), Some(0.5));
        }
    }

    /// Same input, unit scaled to 2s: values become 1.0.
    #[tokio::test]
    async fn batch_derivative_scaled_unit() {
        let clock: Arc<dyn Clock> = Arc::new(Fast::new(zero() + secs(21)));
        let batches = vec![
            value_batch(secs(-2), 0.0),
            value_batch(secs(0), 1.0),
            value_batch(secs(2), 2.0),
            value_batch(secs(4), 3.0),
            value_batch(secs(6), 4.0),
        ];
        let out = new_collector();
        let sink: Arc<dyn BatchSink> = Arc::new(DerivativeSink::new(
            std::time::Duration::from_secs(2),
            false,
            BTreeMap::new(),
            out.clone(),
        ));
        let replayer = Replayer::new(clock, no_shutdown());
        let rx = replayer.replay_batch(vec![encode(&batches)], vec![sink]);
        rx.await.unwrap().unwrap();

        for r in out.lock().unwrap().iter() {
            assert_eq!(r.fields.get("value").and_then(FieldValue::as_f64), Some(1.0));
        }
    }

    /// A dip at +4s makes that window's derivative negative;
    /// `non_negative` drops it, leaving 0.5 at +0s, +2s, +6s.
    #[tokio::test]
    async fn non_negative_derivative_drops_dip() {
        let clock: Arc<dyn Clock> = Arc::new(Fast::new(zero() + secs(21)));
        let batches = vec![
            value_batch(secs(-2), 0.0),
            value_batch(secs(0), 1.0),
            value_batch(secs(2), 2.0),
            value_batch(secs(4), 1.5),
            value_batch(secs(6), 2.5),
        ];
        let out = new_collector();
        let sink: Arc<dyn BatchSink> = Arc::new(DerivativeSink::new(
            std::time::Duration::from_secs(1),
            true,
            BTreeMap::new(),
            out.clone(),
        ));
        let replayer = Replayer::new(clock, no_shutdown());
        let rx = replayer.replay_batch(vec![encode(&batches)], vec![sink]);
        rx.await.unwrap().unwrap();

        let rows = out.lock().unwrap();
        let times: Vec<SignedDuration> = rows.iter().map(|r| r.time - zero()).collect();
        assert_eq!(times, vec![secs(0), secs(2), secs(6)]);
        for r in rows.iter() {
            assert_eq!(r.fields.get("value").and_then(FieldValue::as_f64), Some(0.5));
        }
    }

    /// Three groups windowed count-then-sum: each yields sum=10.0 at +28s.
    #[tokio::test]
    async fn map_reduce_three_groups() {
        let clock: Arc<dyn Clock> = Arc::new(Fast::new(zero() + secs(30)));
        let groups = ["cpu-total", "cpu0", "cpu1"];
        let mut srcs = Vec::new();
        let mut sinks: Vec<Arc<dyn BatchSink>> = Vec::new();
        let out = new_collector();
        for g in groups {
            srcs.push(encode(&[count_batch(secs(28), 10)]));
            sinks.push(Arc::new(CountSumSink::new(
                BTreeMap::from([("group".to_string(), g.to_string())]),
                out.clone(),
            )));
        }
        let replayer = Replayer::new(clock, no_shutdown());
        let rx = replayer.replay_batch(srcs, sinks);
        rx.await.unwrap().unwrap();

        let rows = out.lock().unwrap();
        assert_eq!(rows.len(), 3);
        for r in rows.iter() {
            assert_eq!(r.time - zero(), secs(28));
            assert_eq!(r.fields.get("sum").and_then(FieldValue::as_f64), Some(10.0));
        }
    }

    /// Two sides joined, counted then summed: one row, sum=10.0 at +28s.
    #[tokio::test]
    async fn join_two_sides() {
        let clock: Arc<dyn Clock> = Arc::new(Fast::new(zero() + secs(30)));
        let out = new_collector();
        let (left, right) = JoinCountSumSink::pair(BTreeMap::new(), out.clone());
        let srcs = vec![encode(&[count_batch(secs(28), 5)]), encode(&[count_batch(secs(28), 5)])];
        let sinks: Vec<Arc<dyn BatchSink>> = vec![Arc::new(left), Arc::new(right)];
        let replayer = Replayer::new(clock, no_shutdown());
        let rx = replayer.replay_batch(srcs, sinks);
        rx.await.unwrap().unwrap();

        let rows = out.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time - zero(), secs(28));
        assert_eq!(rows[0].fields.get("sum").and_then(FieldValue::as_f64), Some(10.0));
    }

    /// Record a 2s stream, list it, replay it under the Fast clock, delete
    /// it, and confirm a further replay attempt is NotFound.
    #[tokio::test]
    async fn record_list_replay_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let tm = FakeTaskMaster::new();
        let dbrps = vec![Dbrp {
            database: "telegraf".to_string(),
            retention_policy: "autogen".to_string(),
        }];

        let id = recorder::record_stream(
            &store,
            &tm,
            std::time::Duration::from_millis(1),
            dbrps,
            &no_shutdown(),
        )
        .await
        .unwrap();

        let listed = store.list(&std::collections::HashSet::new()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].task_type, crate::types::TaskType::Stream);

        let clock: Arc<dyn Clock> = Arc::new(Fast::new(zero()));
        let replayer = Replayer::new(clock, no_shutdown());
        let sink = RecordingPointSink::new();
        let src = store.find_stream(id).unwrap();
        let rx = replayer.replay_stream(src, sink, true);
        rx.await.unwrap().unwrap();

        store.delete(id).unwrap();
        let err = store.find_stream(id).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::NotFound);
    }

    /// Under a [`Wall`] clock pinned to replay start, two points 40ms apart
    /// in the recording must take roughly 40ms of real time to replay, not
    /// be dumped instantly: this is the cadence guarantee §4.1/§4.4 promise
    /// for wall-clock replay.
    #[tokio::test]
    async fn wall_clock_paces_by_real_time() {
        let t0 = Timestamp::now();
        let gap = std::time::Duration::from_millis(40);
        let p0 = sample_point(t0);
        let p1 = sample_point(t0 + SignedDuration::from_millis(40));
        let mut buf = Vec::new();
        coding::write_point(&mut buf, &p0).unwrap();
        coding::write_point(&mut buf, &p1).unwrap();
        let src: Box<dyn Read + Send> = Box::new(Cursor::new(buf));

        let clock: Arc<dyn Clock> = Arc::new(Wall::new(Timestamp::now()));
        let replayer = Replayer::new(clock, no_shutdown());
        let sink = RecordingPointSink::new();
        let started = std::time::Instant::now();
        let rx = replayer.replay_stream(src, sink.clone(), true);
        rx.await.unwrap().unwrap();
        let elapsed = started.elapsed();

        assert_eq!(sink.drain().len(), 2);
        assert!(
            elapsed >= gap.mul_f64(0.8),
            "wall-clock replay of a {gap:?} gap finished in {elapsed:?}; expected real-time pacing"
        );
    }

    fn sample_point(t: Timestamp) -> crate::types::Point {
        crate::types::Point {
            measurement: "cpu".to_string(),
            database: "telegraf".to_string(),
            retention_policy: "autogen".to_string(),
            tags: BTreeMap::new(),
            fields: BTreeMap::from([("value".to_string(), FieldValue::Float(1.0))]),
            time_unix_nanos: t.as_nanosecond() as i64,
        }
    }
}
