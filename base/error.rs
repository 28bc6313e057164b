// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A single crate-wide error type with a closed classification of kinds.
//!
//! No `anyhow`, no `thiserror`: `Error` pairs an [`ErrorKind`] with an
//! optional message and an optional boxed source, and the [`err!`]/[`bail!`]
//! macros build one from the pieces at the call site.

use std::fmt;

/// Classification of an [`Error`], modeled on a small set of general-purpose
/// outcomes (deliberately similar to gRPC's status codes, which already cover
/// most of what a service needs to say about why an operation failed).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::DeadlineExceeded => "deadline exceeded",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::FailedPrecondition => "failed precondition",
            ErrorKind::Aborted => "aborted",
            ErrorKind::OutOfRange => "out of range",
            ErrorKind::Unimplemented => "unimplemented",
            ErrorKind::Internal => "internal",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::DataLoss => "data loss",
        };
        f.write_str(s)
    }
}

pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(
        kind: ErrorKind,
        msg: Option<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Error { kind, msg, source }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the full cause chain, one line per cause, for logging.
    pub fn chain(&self) -> String {
        use std::fmt::Write;
        let mut s = self.to_string();
        let mut cause = self.source.as_deref().and_then(|e| e.source());
        while let Some(c) = cause {
            write!(&mut s, "\ncaused by: {c}").unwrap();
            cause = c.source();
        }
        s
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.msg, &self.source) {
            (Some(m), Some(s)) => write!(f, "{}: {m}: {s}", self.kind),
            (Some(m), None) => write!(f, "{}: {m}", self.kind),
            (None, Some(s)) => write!(f, "{}: {s}", self.kind),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind, None, None)
    }
}

/// Extension methods for adapting foreign `Result`s at a boundary.
pub trait ResultExt<T> {
    /// Wraps the error (if any) as the source of a new [`Error`] of kind `k`.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k, None, Some(Box::new(e))))
    }
}

/// Builds an [`Error`] from a kind plus an optional message and/or source.
///
/// ```ignore
/// err!(NotFound, msg("no such recording {id}"))
/// err!(Internal, source(io_err))
/// err!(Internal, msg("writing {path:?}"), source(io_err))
/// err!(existing_err, msg("while closing writer"))  // reclassify-and-wrap
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, None)
    };
    ($kind:ident, msg($($m:tt)+)) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($m)+)), None)
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, Some(Box::new($src)))
    };
    ($kind:ident, msg($($m:tt)+), source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($m)+)), Some(Box::new($src)))
    };
    ($existing:expr, msg($($m:tt)+)) => {{
        let existing: $crate::Error = $existing;
        $crate::Error::new(existing.kind(), Some(format!($($m)+)), Some(Box::new(existing)))
    }};
}

/// Like [`err!`], but returns the error immediately.
#[macro_export]
macro_rules! bail {
    ($($tt:tt)+) => {
        return Err($crate::err!($($tt)+))
    };
}
