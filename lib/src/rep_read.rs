// Copyright 2025 The Stratum Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Streaming expansion of representations.
//!
//! A DELTA representation names a base, which may itself be a DELTA,
//! forming a chain that bottoms out at a PLAIN representation or at the
//! empty stream. Expansion walks the chain once per target chunk: the
//! windows of every delta in a chain are aligned by chunk index, so chunk
//! `k` of the output needs only window `k` of each delta, applied deepest
//! first. A delta window with no source instructions cuts the chain early;
//! windows of other chunks are skipped by their headers without being
//! materialized.
//!
//! Every emitted byte updates an MD5 context; once the declared expanded
//! size has been produced the digest must equal the one stored with the
//! representation.

use std::fs::File;
use std::io;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek as _;
use std::io::SeekFrom;

use digest::Digest as _;
use md5::Md5;

use crate::noderev::Representation;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::StoreResult;
use crate::store::corrupt;
use crate::svndiff;
use crate::svndiff::Window;

/// Read size for PLAIN representations and for the bottom of delta chains.
const PLAIN_CHUNK_SIZE: u64 = 65_536;

/// A representation body header line: `PLAIN`, `DELTA`, or
/// `DELTA <rev> <offset> <size>`.
enum RepHeader {
    Plain,
    Delta { base: Option<(u64, u64, u64)> },
}

fn read_rep_header(file: &mut File, at: u64) -> StoreResult<(RepHeader, u64)> {
    file.seek(SeekFrom::Start(at))
        .map_err(|_| corrupt("unseekable representation offset"))?;
    let mut buf = [0u8; 96];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file
            .read(&mut buf[filled..])
            .map_err(|_| corrupt("unreadable representation header"))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let newline = buf[..filled]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| corrupt("representation header line is missing"))?;
    let line = std::str::from_utf8(&buf[..newline])
        .map_err(|_| corrupt("malformed representation header line"))?;
    let header = if line == "PLAIN" {
        RepHeader::Plain
    } else if line == "DELTA" {
        RepHeader::Delta { base: None }
    } else if let Some(rest) = line.strip_prefix("DELTA ") {
        let fields: Vec<&str> = rest.split(' ').collect();
        let [rev, offset, size] = fields[..] else {
            return Err(corrupt(format!(
                "malformed representation header line {line:?}"
            )));
        };
        let parse = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| corrupt(format!("malformed representation header line {line:?}")))
        };
        RepHeader::Delta {
            base: Some((parse(rev)?, parse(offset)?, parse(size)?)),
        }
    } else {
        return Err(corrupt(format!(
            "unknown representation header line {line:?}"
        )));
    };
    Ok((header, at + newline as u64 + 1))
}

/// One delta in a chain, positioned inside its owning rev file. Windows are
/// consumed in chunk order; earlier windows can be skipped by header.
struct DeltaLevel {
    reader: BufReader<File>,
    pos: u64,
    end: u64,
    magic_checked: bool,
    window_index: u64,
    /// Total target bytes declared by the windows already consumed, which is
    /// the absolute target offset at which the next window's output starts.
    target_offset: u64,
}

impl Read for DeltaLevel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.end.saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = self.reader.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl DeltaLevel {
    fn check_magic(&mut self) -> StoreResult<()> {
        if self.magic_checked {
            return Ok(());
        }
        let mut magic = [0u8; 4];
        self.read_exact(&mut magic)
            .map_err(|_| corrupt("truncated delta stream"))?;
        if magic != *svndiff::MAGIC {
            return Err(corrupt("delta stream has a bad magic number"));
        }
        self.magic_checked = true;
        Ok(())
    }

    /// Advances to window `index` and reads it, returning the absolute
    /// target offset its output starts at.
    fn window_at(&mut self, index: u64) -> StoreResult<(u64, Window)> {
        self.check_magic()?;
        debug_assert!(self.window_index <= index);
        while self.window_index < index {
            if self.pos >= self.end {
                return Err(corrupt("delta chunk absent from base delta"));
            }
            let header = svndiff::read_window_header(self)?;
            let skip = header.ins_len + header.new_len;
            if self.pos + skip > self.end {
                return Err(corrupt("truncated delta window"));
            }
            self.reader
                .seek_relative(skip as i64)
                .map_err(|_| corrupt("truncated delta window"))?;
            self.pos += skip;
            self.target_offset += header.tview_len;
            self.window_index += 1;
        }
        if self.pos >= self.end {
            return Err(corrupt("delta ran out of windows"));
        }
        let header = svndiff::read_window_header(self)?;
        let window = svndiff::read_window_body(self, header)?;
        let target_start = self.target_offset;
        self.target_offset += window.tview_len;
        self.window_index += 1;
        Ok((target_start, window))
    }
}

/// The PLAIN representation (or absence of one) at the bottom of a chain.
struct PlainSource {
    file: File,
    body_start: u64,
    len: u64,
}

impl PlainSource {
    fn read_at(&mut self, offset: u64, len: u64) -> StoreResult<Vec<u8>> {
        if offset + len > self.len {
            return Err(corrupt("source reference past end of base"));
        }
        self.file
            .seek(SeekFrom::Start(self.body_start + offset))
            .map_err(|_| corrupt("unseekable plain representation"))?;
        let mut buf = vec![0; usize::try_from(len).map_err(|_| corrupt("oversized source view"))?];
        self.file
            .read_exact(&mut buf)
            .map_err(|_| corrupt("truncated plain representation"))?;
        Ok(buf)
    }
}

/// A digest-verifying streaming reader over one representation.
pub struct RepReader {
    levels: Vec<DeltaLevel>,
    plain: Option<PlainSource>,
    expanded_size: u64,
    expected_md5: [u8; 16],
    digest: Md5,
    produced: u64,
    verified: bool,
    chunk_index: u64,
    buf: Vec<u8>,
    buf_pos: usize,
}

impl RepReader {
    pub(crate) fn new(
        store: &Store,
        txn_id: Option<&str>,
        rep: &Representation,
    ) -> StoreResult<Self> {
        let mut levels = Vec::new();
        let mut plain = None;
        let mut location = rep.location.clone();
        let mut offset = rep.offset;
        let mut size = rep.size;
        loop {
            let mut file = store.rep_file(&location, txn_id)?;
            let (header, body_start) = read_rep_header(&mut file, offset)?;
            match header {
                RepHeader::Plain => {
                    plain = Some(PlainSource {
                        file,
                        body_start,
                        len: size,
                    });
                    break;
                }
                RepHeader::Delta { base } => {
                    file.seek(SeekFrom::Start(body_start))
                        .map_err(|_| corrupt("unseekable representation offset"))?;
                    levels.push(DeltaLevel {
                        reader: BufReader::new(file),
                        pos: body_start,
                        end: body_start + size,
                        magic_checked: false,
                        window_index: 0,
                        target_offset: 0,
                    });
                    match base {
                        None => break,
                        Some((base_rev, base_offset, base_size)) => {
                            location = crate::noderev::RepLocation::Revision(base_rev);
                            offset = base_offset;
                            size = base_size;
                        }
                    }
                }
            }
        }
        Ok(Self {
            levels,
            plain,
            expanded_size: rep.expanded_size,
            expected_md5: rep.md5,
            digest: Md5::new(),
            produced: 0,
            verified: false,
            chunk_index: 0,
            buf: Vec::new(),
            buf_pos: 0,
        })
    }

    /// Unwraps a [`StoreError`] that this reader funneled through
    /// [`io::Error`] while being used as a [`Read`].
    pub fn into_store_error(err: io::Error) -> StoreError {
        match err.downcast::<StoreError>() {
            Ok(store_err) => store_err,
            Err(err) => corrupt(format!("representation read failed: {err}")),
        }
    }

    fn verify_digest(&mut self) -> StoreResult<()> {
        if self.verified {
            return Ok(());
        }
        self.verified = true;
        let actual: [u8; 16] = self.digest.clone().finalize().into();
        if actual != self.expected_md5 {
            return Err(StoreError::ChecksumMismatch {
                expected: hex::encode(self.expected_md5),
                actual: hex::encode(actual),
            });
        }
        Ok(())
    }

    fn next_chunk(&mut self) -> StoreResult<Option<Vec<u8>>> {
        if self.produced >= self.expanded_size {
            self.verify_digest()?;
            return Ok(None);
        }
        let chunk = if self.levels.is_empty() {
            let plain = self
                .plain
                .as_mut()
                .ok_or_else(|| corrupt("representation has neither delta nor plain data"))?;
            let want = (self.expanded_size - self.produced).min(PLAIN_CHUNK_SIZE);
            plain.read_at(self.produced, want)?
        } else {
            self.next_delta_chunk()?
        };
        self.digest.update(&chunk);
        self.produced += chunk.len() as u64;
        self.chunk_index += 1;
        if self.produced > self.expanded_size {
            return Err(corrupt(
                "representation expanded beyond its declared size",
            ));
        }
        Ok(Some(chunk))
    }

    fn next_delta_chunk(&mut self) -> StoreResult<Vec<u8>> {
        let index = self.chunk_index;
        let (_, top) = self.levels[0].window_at(index)?;
        let mut windows = vec![top];
        let mut starts = vec![0u64];
        let mut source = Vec::new();
        let mut level_idx = 1;
        loop {
            let deepest = windows.last().expect("at least the top window is present");
            if deepest.src_ops() == 0 {
                break;
            }
            if level_idx < self.levels.len() {
                let (window_start, window) = self.levels[level_idx].window_at(index)?;
                if deepest.sview_offset < window_start
                    || deepest.sview_offset + deepest.sview_len
                        > window_start + window.tview_len
                {
                    return Err(corrupt(
                        "delta window references data outside its base window",
                    ));
                }
                starts.push(window_start);
                windows.push(window);
                level_idx += 1;
            } else if let Some(plain) = self.plain.as_mut() {
                source = plain.read_at(deepest.sview_offset, deepest.sview_len)?;
                break;
            } else {
                return Err(corrupt("delta chain needs source data but has no base"));
            }
        }
        let deepest = windows.len() - 1;
        let mut expanded = svndiff::apply_window(&windows[deepest], &source)?;
        let mut expanded_start = starts[deepest];
        for i in (0..deepest).rev() {
            let window = &windows[i];
            let from = (window.sview_offset - expanded_start) as usize;
            let to = from + window.sview_len as usize;
            expanded = svndiff::apply_window(window, &expanded[from..to])?;
            expanded_start = starts[i];
        }
        Ok(expanded)
    }
}

impl Read for RepReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buf_pos == self.buf.len() {
            match self.next_chunk() {
                Ok(Some(chunk)) => {
                    self.buf = chunk;
                    self.buf_pos = 0;
                }
                Ok(None) => return Ok(0),
                Err(err) => return Err(io::Error::other(err)),
            }
        }
        let n = buf.len().min(self.buf.len() - self.buf_pos);
        buf[..n].copy_from_slice(&self.buf[self.buf_pos..self.buf_pos + n]);
        self.buf_pos += n;
        Ok(n)
    }
}
