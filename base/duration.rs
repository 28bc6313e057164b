// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Parsing for the duration literals accepted by the HTTP surface (`10s`,
//! `90s`, `2h30m`, ...) plus RFC 3339 instant parsing, both reused by the
//! `/record` and `/replay` query-parameter parsers.

use crate::{bail, err, Error};
use jiff::{SignedDuration, Timestamp};
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::digit1;
use nom::combinator::{map_res, opt};
use nom::multi::many1;
use nom::sequence::tuple;
use nom::IResult;

fn one_part(input: &str) -> IResult<&str, (i64, &str)> {
    let (input, n) = map_res(digit1, str::parse::<i64>)(input)?;
    let (input, unit) = alt((tag("ms"), tag("h"), tag("m"), tag("s")))(input)?;
    Ok((input, (n, unit)))
}

/// Parses a duration literal such as `10s`, `90s`, `2h30m`, `1500ms`.
///
/// Unlike a fully general duration grammar, each unit may appear at most
/// once and units must appear in descending order (`h` then `m` then `s`
/// then `ms`); this matches every literal this service's callers actually
/// write and keeps the parser (and its error messages) small.
pub fn parse_duration(input: &str) -> Result<SignedDuration, Error> {
    let (remaining, (parts, _)) = tuple((many1(one_part), opt(tag(""))))(input)
        .map_err(|_| err!(InvalidArgument, msg("invalid duration literal {input:?}")))?;
    if !remaining.is_empty() || parts.is_empty() {
        bail!(InvalidArgument, msg("invalid duration literal {input:?}"));
    }
    let mut secs: i64 = 0;
    let mut nanos: i64 = 0;
    let mut last_rank = i64::MAX;
    for (n, unit) in parts {
        let (rank, contribution_secs, contribution_nanos) = match unit {
            "h" => (3, n * 3_600, 0),
            "m" => (2, n * 60, 0),
            "s" => (1, n, 0),
            "ms" => (0, 0, n * 1_000_000),
            _ => unreachable!(),
        };
        if rank >= last_rank {
            bail!(
                InvalidArgument,
                msg("duration units out of order in {input:?}")
            );
        }
        last_rank = rank;
        secs += contribution_secs;
        nanos += contribution_nanos;
    }
    Ok(SignedDuration::new(secs, nanos as i32))
}

/// Parses an RFC 3339 timestamp, e.g. `2021-01-02T03:04:05Z`.
pub fn parse_rfc3339(input: &str) -> Result<Timestamp, Error> {
    input
        .parse::<Timestamp>()
        .map_err(|e| err!(InvalidArgument, msg("invalid RFC 3339 timestamp {input:?}"), source(e)))
}
