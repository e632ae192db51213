//! Text interchange format for the committed stable model.
//!
//! Line 1 holds `"<width> <height>"`, line 2 an opaque frame-type integer
//! written back verbatim. Then one line per pixel, row-major, listing its
//! modes as space-separated `R G B` triples (disk order is R, G, B even
//! though memory order is B, G, R); a pixel with no modes is an empty
//! line.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{BufRead, Write};

use crate::{Error, Result, TryVec};

/// A parsed model file.
pub(crate) struct ModelFile {
    pub width: u32,
    pub height: u32,
    pub frame_type: i64,
    /// One mode list per pixel, BGR in memory order.
    pub rows: TryVec<Vec<[u8; 3]>>,
}

fn next_line<R: BufRead>(reader: &mut R, line: &mut String) -> Result<bool> {
    line.clear();
    let n = reader.read_line(line)?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(n > 0)
}

pub(crate) fn read_model<R: BufRead>(mut reader: R) -> Result<ModelFile> {
    let mut line = String::new();

    if !next_line(&mut reader, &mut line)? {
        return Err(Error::ModelFormat("missing size header"));
    }
    let mut header = line.split_whitespace();
    let width: u32 = header
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(Error::ModelFormat("malformed width"))?;
    let height: u32 = header
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(Error::ModelFormat("malformed height"))?;
    if header.next().is_some() {
        return Err(Error::ModelFormat("trailing tokens in size header"));
    }
    if width == 0 || height == 0 {
        return Err(Error::ModelFormat("empty frame size"));
    }

    if !next_line(&mut reader, &mut line)? {
        return Err(Error::ModelFormat("missing frame type"));
    }
    let frame_type: i64 = line
        .trim()
        .parse()
        .map_err(|_| Error::ModelFormat("malformed frame type"))?;

    let num_pixels = width as usize * height as usize;
    let mut rows = TryVec::with_capacity(num_pixels)?;
    for _ in 0..num_pixels {
        if !next_line(&mut reader, &mut line)? {
            return Err(Error::ModelFormat("missing pixel rows"));
        }
        let mut modes = Vec::new();
        let mut tokens = line.split_whitespace();
        loop {
            let r = match tokens.next() {
                Some(t) => t,
                None => break,
            };
            let g = tokens.next().ok_or(Error::ModelFormat("truncated mode triple"))?;
            let b = tokens.next().ok_or(Error::ModelFormat("truncated mode triple"))?;
            let parse = |t: &str| -> Result<u8> {
                t.parse().map_err(|_| Error::ModelFormat("malformed channel value"))
            };
            modes.push([parse(b)?, parse(g)?, parse(r)?]);
        }
        rows.push(modes)?;
    }

    while next_line(&mut reader, &mut line)? {
        if !line.trim().is_empty() {
            return Err(Error::ModelFormat("trailing data after pixel rows"));
        }
    }

    Ok(ModelFile { width, height, frame_type, rows })
}

pub(crate) fn write_model<W: Write>(
    mut writer: W,
    width: u32,
    height: u32,
    frame_type: i64,
    rows: &[Vec<[u8; 3]>],
) -> Result<()> {
    writeln!(writer, "{} {}", width, height)?;
    writeln!(writer, "{}", frame_type)?;
    for modes in rows {
        for value in modes {
            write!(writer, "{} {} {} ", value[2], value[1], value[0])?;
        }
        writeln!(writer)?;
    }
    Ok(())
}
