// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Binary encoding/decoding of [`Point`]s and [`Batch`]es for on-disk
//! recordings.
//!
//! Each value is preceded by a little-endian `u32` byte length, mirroring
//! the length-delimited framing this codebase already uses for its on-disk
//! metadata; the payload itself is `bincode`'s default encoding of the
//! `serde`-derived domain type.

use std::io::{self, Read, Write};

use base::{err, Error, ErrorKind, ResultExt};

use crate::types::{Batch, Point};

fn write_framed<T: serde::Serialize, W: Write>(w: &mut W, v: &T) -> Result<(), Error> {
    let payload = bincode::serialize(v)
        .map_err(|e| err!(Internal, msg("encoding recording payload"), source(e)))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| err!(Internal, msg("recording payload too large ({} bytes)", payload.len())))?;
    w.write_all(&len.to_le_bytes())
        .err_kind(ErrorKind::Internal)?;
    w.write_all(&payload).err_kind(ErrorKind::Internal)?;
    Ok(())
}

/// Reads one length-prefixed, bincode-encoded value. Returns `Ok(None)` on a
/// clean end-of-stream (no bytes read for the length prefix); any other
/// truncation or corruption is a [`ErrorKind::DataLoss`] error.
fn read_framed<T: serde::de::DeserializeOwned, R: Read>(r: &mut R) -> Result<Option<T>, Error> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(r, &mut len_buf)? {
        false => return Ok(None),
        true => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .map_err(|e| err!(DataLoss, msg("truncated recording payload"), source(e)))?;
    let v = bincode::deserialize(&payload)
        .map_err(|e| err!(DataLoss, msg("corrupt recording payload"), source(e)))?;
    Ok(Some(v))
}

/// Like `Read::read_exact`, but returns `Ok(false)` instead of erroring if
/// zero bytes were available (a clean EOF) rather than a partial read.
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(err!(DataLoss, msg("truncated recording frame header")));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(err!(Internal, msg("reading recording"), source(e))),
        }
    }
    Ok(true)
}

pub fn write_point<W: Write>(w: &mut W, p: &Point) -> Result<(), Error> {
    write_framed(w, p)
}

pub fn read_point<R: Read>(r: &mut R) -> Result<Option<Point>, Error> {
    read_framed(r)
}

pub fn write_batch<W: Write>(w: &mut W, b: &Batch) -> Result<(), Error> {
    write_framed(w, b)
}

pub fn read_batch<R: Read>(r: &mut R) -> Result<Option<Batch>, Error> {
    read_framed(r)
}
