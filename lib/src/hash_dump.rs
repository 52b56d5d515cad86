// Copyright 2024 The Stratum Authors
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

//! Length-prefixed key/value serialization.
//!
//! This is the common wire form for properties, directory entries, and
//! revision props:
//!
//! ```text
//! K <key length>\n
//! <key>\n
//! V <value length>\n
//! <value>\n
//! ...
//! END\n
//! ```
//!
//! Directories staged in a transaction additionally support incremental
//! records appended after `END`: further `K`/`V` pairs overwrite an entry,
//! and `D <length>\n<key>\n` deletes one.

use std::collections::BTreeMap;
use std::io;
use std::io::BufRead;
use std::io::Write;

use crate::store::StoreError;
use crate::store::StoreResult;

pub type Hash = BTreeMap<String, Vec<u8>>;

fn corrupt(reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        reason: reason.into(),
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> StoreResult<Option<String>> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|_| corrupt("unreadable hash record"))?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(corrupt("truncated hash record"));
    }
    line.pop();
    Ok(Some(line))
}

fn read_counted<R: BufRead>(reader: &mut R, len: usize) -> StoreResult<Vec<u8>> {
    let mut buf = vec![0; len + 1];
    reader
        .read_exact(&mut buf)
        .map_err(|_| corrupt("truncated hash record"))?;
    if buf.pop() != Some(b'\n') {
        return Err(corrupt("hash record not terminated by newline"));
    }
    Ok(buf)
}

fn parse_len(line: &str, tag: &str) -> StoreResult<usize> {
    line.strip_prefix(tag)
        .and_then(|rest| rest.strip_prefix(' '))
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| corrupt(format!("malformed hash record {line:?}")))
}

fn read_value<R: BufRead>(reader: &mut R) -> StoreResult<Vec<u8>> {
    let line = read_line(reader)?.ok_or_else(|| corrupt("missing hash value record"))?;
    let len = parse_len(&line, "V")?;
    read_counted(reader, len)
}

/// Reads a terminated hash dump, leaving the reader positioned after the
/// `END` record.
pub fn read_hash<R: BufRead>(reader: &mut R) -> StoreResult<Hash> {
    let mut hash = Hash::new();
    loop {
        let line = read_line(reader)?.ok_or_else(|| corrupt("hash dump missing END record"))?;
        if line == "END" {
            return Ok(hash);
        }
        let len = parse_len(&line, "K")?;
        let key = read_counted(reader, len)?;
        let key = String::from_utf8(key).map_err(|_| corrupt("hash key is not valid UTF-8"))?;
        let value = read_value(reader)?;
        hash.insert(key, value);
    }
}

/// Reads a base hash dump followed by incremental records running to end of
/// input, replaying each record in order.
pub fn read_hash_incremental<R: BufRead>(reader: &mut R) -> StoreResult<Hash> {
    let mut hash = read_hash(reader)?;
    loop {
        let Some(line) = read_line(reader)? else {
            return Ok(hash);
        };
        if let Ok(len) = parse_len(&line, "D") {
            let key = read_counted(reader, len)?;
            let key = String::from_utf8(key).map_err(|_| corrupt("hash key is not valid UTF-8"))?;
            hash.remove(&key);
        } else {
            let len = parse_len(&line, "K")?;
            let key = read_counted(reader, len)?;
            let key = String::from_utf8(key).map_err(|_| corrupt("hash key is not valid UTF-8"))?;
            let value = read_value(reader)?;
            hash.insert(key, value);
        }
    }
}

/// Writes a terminated hash dump.
pub fn write_hash<W: Write>(writer: &mut W, hash: &Hash) -> io::Result<()> {
    for (key, value) in hash {
        write!(writer, "K {}\n{key}\n", key.len())?;
        write!(writer, "V {}\n", value.len())?;
        writer.write_all(value)?;
        writer.write_all(b"\n")?;
    }
    writer.write_all(b"END\n")
}

pub fn hash_to_bytes(hash: &Hash) -> Vec<u8> {
    let mut bytes = Vec::new();
    write_hash(&mut bytes, hash).expect("writing to an in-memory buffer should never fail");
    bytes
}

/// Appends one incremental record: a `K`/`V` pair when `value` is set, a `D`
/// deletion otherwise.
pub fn write_incremental_entry<W: Write>(
    writer: &mut W,
    key: &str,
    value: Option<&[u8]>,
) -> io::Result<()> {
    match value {
        Some(value) => {
            write!(writer, "K {}\n{key}\n", key.len())?;
            write!(writer, "V {}\n", value.len())?;
            writer.write_all(value)?;
            writer.write_all(b"\n")
        }
        None => write!(writer, "D {}\n{key}\n", key.len()),
    }
}
