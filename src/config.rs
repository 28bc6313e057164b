// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! TOML configuration file for the `chronorec` daemon.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use base::{err, Error, ResultExt};

/// On-disk configuration, loaded by `chronorec run --config <path>` and
/// written by `chronorec init`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Directory the recording catalog lives under.
    pub save_dir: PathBuf,

    /// Address the HTTP service binds to.
    pub http_addr: SocketAddr,

    /// Base URL of the time-series database's HTTP query API. Absent means
    /// every batch/query-mode operation fails with `Unavailable`.
    #[serde(default)]
    pub tsdb_base_url: Option<String>,

    /// TOML manifest of named tasks (DBRPs, TaskType, batch query plan).
    /// Absent means the task store starts out empty.
    #[serde(default)]
    pub task_manifest: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            save_dir: PathBuf::from("/var/lib/chronorec/recordings"),
            http_addr: "0.0.0.0:9092".parse().expect("valid default bind address"),
            tsdb_base_url: None,
            task_manifest: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| err!(Internal, msg("reading config {}", path.display()), source(e)))?;
        toml::from_str(&text)
            .map_err(|e| err!(InvalidArgument, msg("parsing config {}", path.display()), source(e)))
    }

    /// Serializes a starter config with this crate's defaults, for
    /// `chronorec init` to write out.
    pub fn starter_toml() -> Result<String, Error> {
        toml::to_string_pretty(&Config::default()).err_kind(base::ErrorKind::Internal)
    }
}
