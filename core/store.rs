// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! On-disk recording catalog: list/find/delete plus the writers used by the
//! [`crate::recorder`].
//!
//! Every recording lives directly under one save directory, named
//! `<RecordingId><ext>` with `.srpl` (gzip-compressed points) or `.brpl`
//! (zip archive of batches) as the authoritative type tag.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use jiff::Timestamp;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use base::{bail, err, Error, ErrorKind, ResultExt};

use crate::coding;
use crate::types::{not_found_error, wrong_type_error, Batch, Point, RecordingId, RecordingInfo, TaskType};

const STREAM_EXT: &str = ".srpl";
const BATCH_EXT: &str = ".brpl";

/// The on-disk recording catalog rooted at one save directory.
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Opens (creating if necessary) the save directory `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            err!(
                Internal,
                msg("creating save directory {}", dir.display()),
                source(e)
            )
        })?;
        Ok(Store { dir })
    }

    fn path_for(&self, id: RecordingId, ext: &str) -> PathBuf {
        self.dir.join(format!("{id}{ext}"))
    }

    /// Lists recordings, optionally restricted to `filter` (IDs not present
    /// on disk are silently omitted). An empty filter means "all".
    pub fn list(&self, filter: &HashSet<RecordingId>) -> Result<Vec<RecordingInfo>, Error> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            err!(
                Internal,
                msg("reading save directory {}", self.dir.display()),
                source(e)
            )
        })?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.err_kind(ErrorKind::Internal)?;
            let file_type = entry.file_type().err_kind(ErrorKind::Internal)?;
            if !file_type.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((stem, ext)) = split_extension(name) else {
                continue;
            };
            let Some(task_type) = TaskType::from_extension(ext) else {
                continue;
            };
            let Ok(id) = stem.parse::<RecordingId>() else {
                continue;
            };
            if !filter.is_empty() && !filter.contains(&id) {
                continue;
            }
            let metadata = entry.metadata().err_kind(ErrorKind::Internal)?;
            let created = metadata
                .modified()
                .ok()
                .and_then(|t| Timestamp::try_from(t).ok())
                .unwrap_or(Timestamp::UNIX_EPOCH);
            out.push(RecordingInfo {
                id,
                task_type,
                size: metadata.len(),
                created,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn which_exists(&self, id: RecordingId) -> (bool, bool) {
        (
            self.path_for(id, STREAM_EXT).is_file(),
            self.path_for(id, BATCH_EXT).is_file(),
        )
    }

    /// Opens the stream recording `id` for reading, transparently
    /// decompressing. Fails with a distinct wrong-type error if `id` exists
    /// only as a batch recording.
    pub fn find_stream(&self, id: RecordingId) -> Result<Box<dyn Read + Send>, Error> {
        let (has_stream, has_batch) = self.which_exists(id);
        if !has_stream {
            if has_batch {
                return Err(wrong_type_error(id, TaskType::Stream, TaskType::Batch));
            }
            return Err(not_found_error(id));
        }
        let file = File::open(self.path_for(id, STREAM_EXT)).err_kind(ErrorKind::Internal)?;
        Ok(Box::new(flate2::read::GzDecoder::new(file)))
    }

    /// Opens the batch recording `id`, returning one reader per archive
    /// entry in batch-index order. Fails with a distinct wrong-type error if
    /// `id` exists only as a stream recording.
    pub fn find_batch(&self, id: RecordingId) -> Result<Vec<Box<dyn Read + Send>>, Error> {
        let (has_stream, has_batch) = self.which_exists(id);
        if !has_batch {
            if has_stream {
                return Err(wrong_type_error(id, TaskType::Batch, TaskType::Stream));
            }
            return Err(not_found_error(id));
        }
        let file = File::open(self.path_for(id, BATCH_EXT)).err_kind(ErrorKind::Internal)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| err!(DataLoss, msg("opening batch archive for {id}"), source(e)))?;
        let mut entries: Vec<(u32, Vec<u8>)> = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| err!(DataLoss, msg("reading batch archive entry {i}"), source(e)))?;
            let idx: u32 = entry.name().parse().map_err(|_| {
                err!(
                    DataLoss,
                    msg("non-numeric batch archive entry {:?}", entry.name())
                )
            })?;
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .err_kind(ErrorKind::Internal)?;
            entries.push((idx, buf));
        }
        entries.sort_by_key(|(idx, _)| *idx);
        Ok(entries
            .into_iter()
            .map(|(_, buf)| Box::new(Cursor::new(buf)) as Box<dyn Read + Send>)
            .collect())
    }

    /// Removes both extensions for `id`, if present. Idempotent: a missing
    /// file is not an error.
    pub fn delete(&self, id: RecordingId) -> Result<(), Error> {
        for ext in [STREAM_EXT, BATCH_EXT] {
            match std::fs::remove_file(self.path_for(id, ext)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => bail!(Internal, msg("deleting recording {id}"), source(e)),
            }
        }
        Ok(())
    }

    /// Creates a new stream writer for `id`, gzip-layered over the file.
    pub fn new_stream_writer(&self, id: RecordingId) -> Result<StreamWriter, Error> {
        let file = File::create(self.path_for(id, STREAM_EXT)).err_kind(ErrorKind::Internal)?;
        Ok(StreamWriter {
            enc: GzEncoder::new(file, Compression::default()),
        })
    }

    /// Creates a new batch archive for `id`, layered with a zip writer.
    pub fn new_batch_archive(&self, id: RecordingId) -> Result<BatchArchive, Error> {
        let file = File::create(self.path_for(id, BATCH_EXT)).err_kind(ErrorKind::Internal)?;
        Ok(BatchArchive {
            zip: ZipWriter::new(file),
            entry_open: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};

    use crate::types::{FieldValue, Row};

    fn sample_point(n: i64) -> Point {
        let mut tags = BTreeMap::new();
        tags.insert("host".to_string(), "a".to_string());
        Point {
            measurement: "cpu".to_string(),
            database: "telegraf".to_string(),
            retention_policy: "autogen".to_string(),
            tags,
            fields: BTreeMap::from([("value".to_string(), FieldValue::Float(n as f64))]),
            time_unix_nanos: n,
        }
    }

    fn sample_batch(name: &str, n: usize) -> Batch {
        Batch {
            name: name.to_string(),
            group: BTreeMap::new(),
            rows: (0..n)
                .map(|i| Row {
                    time_unix_nanos: i as i64,
                    tags: BTreeMap::new(),
                    fields: BTreeMap::from([("value".to_string(), FieldValue::Int(i as i64))]),
                })
                .collect(),
        }
    }

    /// Invariant 1: a stream recorded through the store and immediately
    /// read back decodes to the exact sequence of points written.
    #[test]
    fn stream_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let id = RecordingId::new();
        let points: Vec<Point> = (0..5).map(sample_point).collect();

        let mut w = store.new_stream_writer(id).unwrap();
        for p in &points {
            w.write_point(p).unwrap();
        }
        w.close().unwrap();

        let mut r = store.find_stream(id).unwrap();
        let mut decoded = Vec::new();
        while let Some(p) = coding::read_point(&mut r).unwrap() {
            decoded.push(p);
        }
        assert_eq!(decoded, points);
    }

    /// Invariant 2: a batch recording partitioned across slots round-trips
    /// slot by slot, in slot order, via `find_batch`.
    #[test]
    fn batch_round_trip_multi_slot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let id = RecordingId::new();
        let slots = vec![
            vec![sample_batch("cpu0", 3)],
            vec![sample_batch("cpu1", 2), sample_batch("cpu1", 1)],
        ];

        let mut archive = store.new_batch_archive(id).unwrap();
        for (i, slot) in slots.iter().enumerate() {
            archive.create_entry(i as u32).unwrap();
            for b in slot {
                archive.write_batch(b).unwrap();
            }
        }
        archive.close().unwrap();

        let mut readers = store.find_batch(id).unwrap();
        assert_eq!(readers.len(), slots.len());
        for (slot, reader) in slots.iter().zip(readers.iter_mut()) {
            let mut decoded = Vec::new();
            while let Some(b) = coding::read_batch(reader).unwrap() {
                decoded.push(b);
            }
            assert_eq!(&decoded, slot);
        }
    }

    /// Invariant 3: `list` returns exactly the recognized recordings,
    /// respecting a non-empty filter and silently dropping missing ids.
    #[test]
    fn catalog_consistency() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let stream_id = RecordingId::new();
        let w = store.new_stream_writer(stream_id).unwrap();
        w.close().unwrap();

        let batch_id = RecordingId::new();
        let mut a = store.new_batch_archive(batch_id).unwrap();
        a.create_entry(0).unwrap();
        a.write_batch(&sample_batch("cpu", 1)).unwrap();
        a.close().unwrap();

        let all = store.list(&HashSet::new()).unwrap();
        let mut ids: Vec<_> = all.iter().map(|r| r.id).collect();
        ids.sort();
        let mut expected = vec![stream_id, batch_id];
        expected.sort();
        assert_eq!(ids, expected);

        let missing = RecordingId::new();
        let filtered = store
            .list(&HashSet::from([stream_id, missing]))
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, stream_id);
        assert_eq!(filtered[0].task_type, TaskType::Stream);
    }

    /// Invariant 4: deleting twice is the same as deleting once, and a
    /// deleted recording is subsequently not found.
    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let id = RecordingId::new();
        let w = store.new_stream_writer(id).unwrap();
        w.close().unwrap();

        store.delete(id).unwrap();
        store.delete(id).unwrap();

        let err = store.find_stream(id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    /// Invariant 5: requesting the wrong type for an existing recording of
    /// the other type is a distinct error from plain not-found.
    #[test]
    fn wrong_type_is_distinguished_from_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let id = RecordingId::new();
        let mut a = store.new_batch_archive(id).unwrap();
        a.create_entry(0).unwrap();
        a.write_batch(&sample_batch("cpu", 1)).unwrap();
        a.close().unwrap();

        let err = store.find_stream(id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("not stream"));

        let never_existed = RecordingId::new();
        let err = store.find_batch(never_existed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.to_string().contains("not batch"));
    }
}

fn split_extension(name: &str) -> Option<(&str, &str)> {
    let dot = name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some((&name[..dot], &name[dot..]))
}

/// Writer for a `.srpl` stream recording. Dropping without calling
/// [`StreamWriter::close`] leaves no guarantee about the file's contents.
pub struct StreamWriter {
    enc: GzEncoder<File>,
}

impl StreamWriter {
    pub fn write_point(&mut self, p: &Point) -> Result<(), Error> {
        coding::write_point(&mut self.enc, p)
    }

    /// Flushes the gzip trailer, then closes the file, returning the first
    /// error encountered.
    pub fn close(self) -> Result<(), Error> {
        let mut file = self
            .enc
            .finish()
            .map_err(|e| err!(Internal, msg("finishing gzip stream"), source(e)))?;
        file.flush().err_kind(ErrorKind::Internal)
    }
}

/// Writer for a `.brpl` batch archive. Entries must be created and fully
/// written in order; dropping without calling [`BatchArchive::close`] leaves
/// no guarantee about the file's contents.
pub struct BatchArchive {
    zip: ZipWriter<File>,
    entry_open: bool,
}

impl BatchArchive {
    /// Starts archive entry `index`. The previous entry (if any) must
    /// already be fully written.
    pub fn create_entry(&mut self, index: u32) -> Result<(), Error> {
        self.zip
            .start_file(index.to_string(), SimpleFileOptions::default())
            .map_err(|e| err!(Internal, msg("creating batch archive entry {index}"), source(e)))?;
        self.entry_open = true;
        Ok(())
    }

    pub fn write_batch(&mut self, b: &Batch) -> Result<(), Error> {
        if !self.entry_open {
            bail!(Internal, msg("write_batch called with no open entry"));
        }
        coding::write_batch(&mut self.zip, b)
    }

    /// Finalizes the central directory, then closes the file. On
    /// archive-finalize error the file is still closed, but the error is
    /// surfaced to the caller.
    pub fn close(self) -> Result<(), Error> {
        self.zip
            .finish()
            .map(|_file| ())
            .map_err(|e| err!(Internal, msg("finishing batch archive"), source(e)))
    }
}
