// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;
use tracing::info;

use crate::config::Config;

/// Writes a starter configuration file.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    /// Path to write the starter configuration to.
    #[bpaf(long, argument("PATH"), fallback(PathBuf::from("/etc/chronorec.toml")))]
    config: PathBuf,

    /// Overwrite an existing file at `--config`.
    #[bpaf(long)]
    force: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    if args.config.exists() && !args.force {
        eprintln!(
            "{} already exists; pass --force to overwrite",
            args.config.display()
        );
        return Ok(1);
    }
    let text = Config::starter_toml()?;
    std::fs::write(&args.config, text)
        .map_err(|e| base::err!(Internal, msg("writing {}", args.config.display()), source(e)))?;
    info!("wrote starter config to {}", args.config.display());
    Ok(0)
}
