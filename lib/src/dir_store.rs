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

//! Directory entry serialization.
//!
//! A directory's representation is a hash dump mapping each entry name to
//! `"<kind> <node-revision id>"`. Directories staged in a transaction keep
//! their base dump in a `node.*.children` file and append incremental
//! records for every later edit; [`crate::hash_dump`] replays those on
//! read.

use std::collections::BTreeMap;

use crate::hash_dump;
use crate::hash_dump::Hash;
use crate::id::NodeRevId;
use crate::noderev::NodeKind;
use crate::store::StoreResult;
use crate::store::corrupt;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub kind: NodeKind,
    pub id: NodeRevId,
}

pub type DirEntries = BTreeMap<String, DirEntry>;

pub(crate) fn entry_value(entry: &DirEntry) -> Vec<u8> {
    format!("{} {}", entry.kind, entry.id).into_bytes()
}

fn parse_entry_value(name: &str, value: &[u8]) -> StoreResult<DirEntry> {
    let bad_entry = || corrupt(format!("malformed directory entry {name:?}"));
    let value = std::str::from_utf8(value).map_err(|_| bad_entry())?;
    let (kind, id) = value.split_once(' ').ok_or_else(bad_entry)?;
    Ok(DirEntry {
        kind: NodeKind::parse(kind).ok_or_else(bad_entry)?,
        id: NodeRevId::parse(id).ok_or_else(bad_entry)?,
    })
}

pub(crate) fn entries_from_hash(hash: &Hash) -> StoreResult<DirEntries> {
    hash.iter()
        .map(|(name, value)| Ok((name.clone(), parse_entry_value(name, value)?)))
        .collect()
}

pub(crate) fn entries_to_hash(entries: &DirEntries) -> Hash {
    entries
        .iter()
        .map(|(name, entry)| (name.clone(), entry_value(entry)))
        .collect()
}

/// The full hash-dump serialization of a directory, as written for a PLAIN
/// directory representation.
pub(crate) fn serialize_entries(entries: &DirEntries) -> Vec<u8> {
    hash_dump::hash_to_bytes(&entries_to_hash(entries))
}
