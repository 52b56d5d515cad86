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

//! The svndiff binary delta format.
//!
//! A delta stream opens with the magic `SVN\0` and then carries a sequence
//! of windows. Each window declares a view into the source stream and a
//! target view length, followed by instructions that reconstruct the target
//! view from source copies, target copies, and literal inserts:
//!
//! ```text
//! window := sview_offset sview_len tview_len inslen newlen
//!           <inslen instruction bytes> <newlen literal bytes>
//! ```
//!
//! All five header fields are variable-length integers: 7 bits per byte,
//! most significant group first, high bit set on every byte but the last.
//! An instruction starts with a byte whose top two bits select the action
//! (`00` copy-from-source, `01` copy-from-target, `10` insert-new) and whose
//! low six bits carry the length, zero meaning the length follows as a
//! varint. Copy instructions are followed by a varint offset.

use std::collections::HashMap;
use std::io;
use std::io::Read;
use std::io::Write;

use adler32::RollingAdler32;

use crate::store::StoreError;
use crate::store::StoreResult;

pub const MAGIC: &[u8; 4] = b"SVN\0";

/// Source and target views advance through their streams in lockstep chunks
/// of this size, which keeps the windows of every delta in a chain aligned
/// by chunk index.
pub const WINDOW_SIZE: usize = 102_400;

/// Length of the blocks hashed by the match generator.
const MATCH_BLOCKSIZE: usize = 64;

fn corrupt(reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        reason: reason.into(),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    CopySource,
    CopyTarget,
    InsertNew,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Op {
    pub kind: OpKind,
    /// Offset into the source view (`CopySource`) or the target produced so
    /// far (`CopyTarget`); unused for `InsertNew`.
    pub offset: u64,
    pub len: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Window {
    pub sview_offset: u64,
    pub sview_len: u64,
    pub tview_len: u64,
    pub ops: Vec<Op>,
    pub new_data: Vec<u8>,
}

impl Window {
    /// Number of instructions that reference the source view. A window with
    /// none cuts the delta chain: no deeper data is needed to expand it.
    pub fn src_ops(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| op.kind == OpKind::CopySource)
            .count()
    }
}

pub fn read_varint<R: Read>(reader: &mut R) -> StoreResult<u64> {
    let mut value: u64 = 0;
    loop {
        let mut byte = [0u8; 1];
        reader
            .read_exact(&mut byte)
            .map_err(|_| corrupt("truncated delta integer"))?;
        value = value
            .checked_mul(128)
            .ok_or_else(|| corrupt("oversized delta integer"))?
            + u64::from(byte[0] & 0x7f);
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
}

pub fn write_varint<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    let mut groups = [0u8; 10];
    let mut n = 0;
    let mut rest = value;
    loop {
        groups[n] = (rest % 128) as u8;
        rest /= 128;
        n += 1;
        if rest == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let continuation = if i > 0 { 0x80 } else { 0 };
        writer.write_all(&[groups[i] | continuation])?;
    }
    Ok(())
}

/// The five header integers of a window, without its instruction and data
/// payload. Used to skip windows without materializing them.
#[derive(Clone, Copy, Debug)]
pub struct WindowHeader {
    pub sview_offset: u64,
    pub sview_len: u64,
    pub tview_len: u64,
    pub ins_len: u64,
    pub new_len: u64,
}

pub fn read_window_header<R: Read>(reader: &mut R) -> StoreResult<WindowHeader> {
    Ok(WindowHeader {
        sview_offset: read_varint(reader)?,
        sview_len: read_varint(reader)?,
        tview_len: read_varint(reader)?,
        ins_len: read_varint(reader)?,
        new_len: read_varint(reader)?,
    })
}

fn parse_instructions(bytes: &[u8]) -> StoreResult<Vec<Op>> {
    let mut ops = Vec::new();
    let mut reader = bytes;
    while !reader.is_empty() {
        let selector = reader[0];
        reader = &reader[1..];
        let kind = match selector >> 6 {
            0 => OpKind::CopySource,
            1 => OpKind::CopyTarget,
            2 => OpKind::InsertNew,
            _ => return Err(corrupt("unknown delta instruction")),
        };
        let len = match selector & 0x3f {
            0 => read_varint(&mut reader)?,
            len => u64::from(len),
        };
        let offset = match kind {
            OpKind::CopySource | OpKind::CopyTarget => read_varint(&mut reader)?,
            OpKind::InsertNew => 0,
        };
        ops.push(Op { kind, offset, len });
    }
    Ok(ops)
}

pub fn read_window<R: Read>(reader: &mut R) -> StoreResult<Window> {
    let header = read_window_header(reader)?;
    read_window_body(reader, header)
}

pub fn read_window_body<R: Read>(reader: &mut R, header: WindowHeader) -> StoreResult<Window> {
    let mut ins = vec![0; usize::try_from(header.ins_len).map_err(|_| corrupt("oversized window"))?];
    reader
        .read_exact(&mut ins)
        .map_err(|_| corrupt("truncated delta window"))?;
    let mut new_data =
        vec![0; usize::try_from(header.new_len).map_err(|_| corrupt("oversized window"))?];
    reader
        .read_exact(&mut new_data)
        .map_err(|_| corrupt("truncated delta window"))?;
    Ok(Window {
        sview_offset: header.sview_offset,
        sview_len: header.sview_len,
        tview_len: header.tview_len,
        ops: parse_instructions(&ins)?,
        new_data,
    })
}

pub fn write_window<W: Write>(writer: &mut W, window: &Window) -> io::Result<()> {
    let mut ins = Vec::new();
    for op in &window.ops {
        let action = match op.kind {
            OpKind::CopySource => 0u8,
            OpKind::CopyTarget => 1,
            OpKind::InsertNew => 2,
        };
        if op.len > 0 && op.len < 64 {
            ins.push((action << 6) | op.len as u8);
        } else {
            ins.push(action << 6);
            write_varint(&mut ins, op.len)?;
        }
        if op.kind != OpKind::InsertNew {
            write_varint(&mut ins, op.offset)?;
        }
    }
    write_varint(writer, window.sview_offset)?;
    write_varint(writer, window.sview_len)?;
    write_varint(writer, window.tview_len)?;
    write_varint(writer, ins.len() as u64)?;
    write_varint(writer, window.new_data.len() as u64)?;
    writer.write_all(&ins)?;
    writer.write_all(&window.new_data)
}

/// Expands a window against its source view, producing exactly `tview_len`
/// bytes.
pub fn apply_window(window: &Window, source: &[u8]) -> StoreResult<Vec<u8>> {
    if window.src_ops() > 0 && source.len() as u64 != window.sview_len {
        return Err(corrupt("delta source view length mismatch"));
    }
    let mut target: Vec<u8> =
        Vec::with_capacity(usize::try_from(window.tview_len).unwrap_or_default());
    let mut new_pos: usize = 0;
    for op in &window.ops {
        let len = usize::try_from(op.len).map_err(|_| corrupt("oversized delta instruction"))?;
        match op.kind {
            OpKind::CopySource => {
                let start =
                    usize::try_from(op.offset).map_err(|_| corrupt("oversized delta offset"))?;
                let end = start
                    .checked_add(len)
                    .filter(|end| *end <= source.len())
                    .ok_or_else(|| corrupt("source reference past end of base"))?;
                target.extend_from_slice(&source[start..end]);
            }
            OpKind::CopyTarget => {
                let start =
                    usize::try_from(op.offset).map_err(|_| corrupt("oversized delta offset"))?;
                if start >= target.len() {
                    return Err(corrupt("target copy from unwritten output"));
                }
                // The copy may overlap its own output (run-length encoding).
                for i in 0..len {
                    let byte = target[start + i];
                    target.push(byte);
                }
            }
            OpKind::InsertNew => {
                let end = new_pos
                    .checked_add(len)
                    .filter(|end| *end <= window.new_data.len())
                    .ok_or_else(|| corrupt("insert past end of window data"))?;
                target.extend_from_slice(&window.new_data[new_pos..end]);
                new_pos = end;
            }
        }
    }
    if target.len() as u64 != window.tview_len {
        return Err(corrupt("expanded window does not match declared length"));
    }
    Ok(target)
}

fn block_hash(block: &[u8]) -> u32 {
    let mut adler = RollingAdler32::new();
    adler.update_buffer(block);
    adler.hash()
}

/// Builds one delta window turning `source` (the current source view, at
/// `sview_offset` in the source stream) into `target`.
///
/// Matching hashes fixed-size source blocks and greedily extends verified
/// matches in both directions, emitting literal inserts for the gaps.
pub fn build_window(sview_offset: u64, source: &[u8], target: &[u8]) -> Window {
    let mut window = Window {
        sview_offset,
        sview_len: source.len() as u64,
        tview_len: target.len() as u64,
        ops: Vec::new(),
        new_data: Vec::new(),
    };
    if source.is_empty() {
        if !target.is_empty() {
            window.sview_len = 0;
            window.ops.push(Op {
                kind: OpKind::InsertNew,
                offset: 0,
                len: target.len() as u64,
            });
            window.new_data.extend_from_slice(target);
        }
        return window;
    }

    let mut blocks: HashMap<u32, Vec<usize>> = HashMap::new();
    for start in (0..source.len()).step_by(MATCH_BLOCKSIZE) {
        let end = start + MATCH_BLOCKSIZE;
        if end > source.len() {
            break;
        }
        blocks
            .entry(block_hash(&source[start..end]))
            .or_default()
            .push(start);
    }

    let mut flush_insert = |window: &mut Window, from: usize, to: usize| {
        if from < to {
            window.ops.push(Op {
                kind: OpKind::InsertNew,
                offset: 0,
                len: (to - from) as u64,
            });
            window.new_data.extend_from_slice(&target[from..to]);
        }
    };

    let mut pos = 0;
    let mut pending = 0;
    while pos + MATCH_BLOCKSIZE <= target.len() {
        let hash = block_hash(&target[pos..pos + MATCH_BLOCKSIZE]);
        let matched = blocks.get(&hash).and_then(|starts| {
            starts
                .iter()
                .find(|&&s| source[s..s + MATCH_BLOCKSIZE] == target[pos..pos + MATCH_BLOCKSIZE])
                .copied()
        });
        let Some(src_start) = matched else {
            pos += 1;
            continue;
        };
        // Extend the verified block forwards and backwards.
        let mut match_src = src_start;
        let mut match_pos = pos;
        let mut match_len = MATCH_BLOCKSIZE;
        while match_src + match_len < source.len()
            && match_pos + match_len < target.len()
            && source[match_src + match_len] == target[match_pos + match_len]
        {
            match_len += 1;
        }
        while match_src > 0 && match_pos > pending && source[match_src - 1] == target[match_pos - 1]
        {
            match_src -= 1;
            match_pos -= 1;
            match_len += 1;
        }
        flush_insert(&mut window, pending, match_pos);
        window.ops.push(Op {
            kind: OpKind::CopySource,
            offset: match_src as u64,
            len: match_len as u64,
        });
        pos = match_pos + match_len;
        pending = pos;
    }
    flush_insert(&mut window, pending, target.len());
    window
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use test_case::test_case;

    use super::*;

    fn round_trip_window(window: &Window) -> Window {
        let mut bytes = Vec::new();
        write_window(&mut bytes, window).unwrap();
        read_window(&mut bytes.as_slice()).unwrap()
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 129, 16383, 16384, u64::from(u32::MAX)] {
            let mut bytes = Vec::new();
            write_varint(&mut bytes, value).unwrap();
            assert_eq!(read_varint(&mut bytes.as_slice()).unwrap(), value);
        }
    }

    #[test]
    fn varint_single_byte_values() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, 127).unwrap();
        assert_eq!(bytes, [0x7f]);
        bytes.clear();
        write_varint(&mut bytes, 128).unwrap();
        assert_eq!(bytes, [0x81, 0x00]);
    }

    #[test]
    fn window_codec_round_trip() {
        let window = Window {
            sview_offset: 1000,
            sview_len: 200,
            tview_len: 270,
            ops: vec![
                Op {
                    kind: OpKind::CopySource,
                    offset: 0,
                    len: 200,
                },
                Op {
                    kind: OpKind::InsertNew,
                    offset: 0,
                    len: 64,
                },
                Op {
                    kind: OpKind::CopyTarget,
                    offset: 194,
                    len: 6,
                },
            ],
            new_data: vec![7; 64],
        };
        assert_eq!(round_trip_window(&window), window);
    }

    #[test_case(b"".as_slice(), b"hello world".as_slice(); "insert only")]
    #[test_case(b"hello world".as_slice(), b"hello world".as_slice(); "identical")]
    #[test_case(b"hello world".as_slice(), b"".as_slice(); "empty target")]
    fn build_and_apply(source: &[u8], target: &[u8]) {
        let window = build_window(0, source, target);
        assert_eq!(apply_window(&window, source).unwrap(), target);
    }

    #[test]
    fn build_window_finds_copies() {
        let source: Vec<u8> = (0..200u8).cycle().take(4096).collect();
        let mut target = source.clone();
        target.splice(1000..1000, b"inserted text".iter().copied());
        target.truncate(3000);
        let window = build_window(0, &source, &target);
        assert_eq!(apply_window(&window, &source).unwrap(), target);
        assert!(window.src_ops() > 0);
        // The literal data should be a small fraction of the target.
        assert!(window.new_data.len() < 200);
    }

    #[test]
    fn apply_rejects_source_overrun() {
        let window = Window {
            sview_offset: 0,
            sview_len: 4,
            tview_len: 8,
            ops: vec![Op {
                kind: OpKind::CopySource,
                offset: 2,
                len: 8,
            }],
            new_data: vec![],
        };
        assert_matches!(
            apply_window(&window, b"abcd"),
            Err(StoreError::Corrupt { .. })
        );
    }

    #[test]
    fn apply_rejects_length_mismatch() {
        let window = Window {
            sview_offset: 0,
            sview_len: 0,
            tview_len: 10,
            ops: vec![Op {
                kind: OpKind::InsertNew,
                offset: 0,
                len: 3,
            }],
            new_data: b"abc".to_vec(),
        };
        assert_matches!(apply_window(&window, b""), Err(StoreError::Corrupt { .. }));
    }

    #[test]
    fn overlapping_target_copy() {
        // A run-length encoded window: two literal bytes repeated.
        let window = Window {
            sview_offset: 0,
            sview_len: 0,
            tview_len: 10,
            ops: vec![
                Op {
                    kind: OpKind::InsertNew,
                    offset: 0,
                    len: 2,
                },
                Op {
                    kind: OpKind::CopyTarget,
                    offset: 0,
                    len: 8,
                },
            ],
            new_data: b"ab".to_vec(),
        };
        assert_eq!(apply_window(&window, b"").unwrap(), b"ababababab");
    }
}
