// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The recording/replay core: domain model, on-disk catalog, wire coding,
//! collaborator contracts, and the Recorder/Replayer themselves.
//!
//! Everything here is storage- and clock-driven; nothing in this crate binds
//! an HTTP server or a CLI, both of which live in the `chronorec` binary.

pub mod coding;
pub mod collab;
pub mod recorder;
pub mod replayer;
pub mod store;
pub mod types;

pub use crate::replayer::Replayer;
pub use crate::store::{BatchArchive, Store, StreamWriter};
pub use crate::types::{
    Batch, Dbrp, FieldValue, Point, RecordingId, RecordingInfo, Row, TaskType,
};
