// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Virtual clock abstraction used throughout replay.
//!
//! The [`Clock`] trait is the *only* source of time the replayer consults;
//! nothing in `core::replayer` calls `jiff::Timestamp::now()` or
//! `tokio::time::sleep` directly. Two implementations are provided: [`Wall`],
//! which paces replay at real wall-clock speed, and [`Fast`], which
//! advances its notion of "now" the instant something waits on a later
//! deadline, so a replay runs as fast as the consuming task can keep up.

use std::sync::Mutex;

use async_trait::async_trait;
use jiff::{SignedDuration, Timestamp};

/// Abstract "what time is it, and how do I wait for a later time" interface.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Timestamp;

    /// Returns the fixed reference instant replay pins "the beginning" to.
    fn zero(&self) -> Timestamp;

    /// Waits until the clock reaches `t`, then returns.
    async fn until(&self, t: Timestamp);
}

/// Real-time clock: `now()` is the actual time, `until` sleeps.
pub struct Wall {
    zero: Timestamp,
}

impl Wall {
    pub fn new(zero: Timestamp) -> Self {
        Wall { zero }
    }
}

impl Default for Wall {
    fn default() -> Self {
        Wall::new(Timestamp::UNIX_EPOCH)
    }
}

#[async_trait]
impl Clock for Wall {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    fn zero(&self) -> Timestamp {
        self.zero
    }

    async fn until(&self, t: Timestamp) {
        let now = Timestamp::now();
        if t <= now {
            return;
        }
        let remaining: SignedDuration = t - now;
        if let Ok(d) = std::time::Duration::try_from(remaining) {
            tokio::time::sleep(d).await;
        }
    }
}

/// Logical clock whose "now" advances on demand: `until(t)` jumps the
/// internal time forward to `t` (if `t` is later than the current time) and
/// returns immediately, rather than actually sleeping. A test harness may
/// also call [`Fast::set`] directly to pin the clock to a specific instant
/// before driving a deterministic scenario.
pub struct Fast {
    zero: Timestamp,
    current: Mutex<Timestamp>,
}

impl Fast {
    pub fn new(zero: Timestamp) -> Self {
        Fast {
            zero,
            current: Mutex::new(zero),
        }
    }

    /// Sets the clock's current time directly, without going through a wait.
    ///
    /// Used by tests to pin a scenario's starting point (e.g.
    /// `1971-01-01T00:00:00Z + 21s`) before replay observes it.
    pub fn set(&self, t: Timestamp) {
        *self.current.lock().unwrap() = t;
    }
}

#[async_trait]
impl Clock for Fast {
    fn now(&self) -> Timestamp {
        *self.current.lock().unwrap()
    }

    fn zero(&self) -> Timestamp {
        self.zero
    }

    async fn until(&self, t: Timestamp) {
        let mut cur = self.current.lock().unwrap();
        if t > *cur {
            *cur = t;
        }
    }
}
