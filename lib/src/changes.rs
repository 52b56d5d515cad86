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

//! The per-transaction change log and its fold into the changed-paths
//! summary of a revision.
//!
//! Every tree edit appends two lines:
//!
//! ```text
//! <noderev id or -> <action> <text mod> <prop mod> <path>
//! <copyfrom rev> <copyfrom path>     (or an empty line)
//! ```
//!
//! At commit time the raw log is folded into one entry per path; a revision
//! file carries the folded form between its node-revisions and its trailer.

use std::collections::BTreeMap;
use std::io;
use std::io::BufRead;
use std::io::Write;

use crate::id::NodeRevId;
use crate::noderev::CopySource;
use crate::store::StoreResult;
use crate::store::corrupt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeKind {
    Modify,
    Add,
    Delete,
    Replace,
    /// Drops everything recorded for the path so far. Only ever appears in a
    /// raw transaction log, never in a folded summary.
    Reset,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modify => "modify",
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Reset => "reset",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "modify" => Some(Self::Modify),
            "add" => Some(Self::Add),
            "delete" => Some(Self::Delete),
            "replace" => Some(Self::Replace),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Change {
    pub id: Option<NodeRevId>,
    pub kind: ChangeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub copyfrom: Option<CopySource>,
}

/// Appends one change record.
pub fn write_change<W: Write>(writer: &mut W, path: &str, change: &Change) -> io::Result<()> {
    let id = match &change.id {
        Some(id) => id.to_string(),
        None => "-".to_string(),
    };
    writeln!(
        writer,
        "{id} {} {} {} {path}",
        change.kind.as_str(),
        change.text_mod,
        change.prop_mod
    )?;
    match &change.copyfrom {
        Some(copyfrom) => writeln!(writer, "{} {}", copyfrom.rev, copyfrom.path),
        None => writeln!(writer),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Reads change records until end of input or a blank record line (the lead
/// of a revision file's trailer).
pub fn read_changes<R: BufRead>(reader: &mut R) -> StoreResult<Vec<(String, Change)>> {
    let mut entries = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|_| corrupt("unreadable change record"))?;
        if n == 0 {
            return Ok(entries);
        }
        let line = line
            .strip_suffix('\n')
            .ok_or_else(|| corrupt("truncated change record"))?;
        if line.is_empty() {
            return Ok(entries);
        }
        let mut fields = line.splitn(5, ' ');
        let bad_record = || corrupt(format!("malformed change record {line:?}"));
        let id = match fields.next().ok_or_else(bad_record)? {
            "-" => None,
            id => Some(NodeRevId::parse(id).ok_or_else(bad_record)?),
        };
        let kind = ChangeKind::parse(fields.next().ok_or_else(bad_record)?)
            .ok_or_else(bad_record)?;
        let text_mod = parse_bool(fields.next().ok_or_else(bad_record)?).ok_or_else(bad_record)?;
        let prop_mod = parse_bool(fields.next().ok_or_else(bad_record)?).ok_or_else(bad_record)?;
        let path = fields.next().ok_or_else(bad_record)?.to_string();

        let mut copyfrom_line = String::new();
        reader
            .read_line(&mut copyfrom_line)
            .map_err(|_| corrupt("unreadable change record"))?;
        let copyfrom_line = copyfrom_line
            .strip_suffix('\n')
            .ok_or_else(|| corrupt("change record is missing its copyfrom line"))?;
        let copyfrom = if copyfrom_line.is_empty() {
            None
        } else {
            let (rev, from_path) = copyfrom_line
                .split_once(' ')
                .ok_or_else(|| corrupt(format!("malformed copyfrom line {copyfrom_line:?}")))?;
            Some(CopySource {
                rev: rev
                    .parse()
                    .map_err(|_| corrupt(format!("malformed copyfrom line {copyfrom_line:?}")))?,
                path: from_path.to_string(),
            })
        };
        entries.push((
            path,
            Change {
                id,
                kind,
                text_mod,
                prop_mod,
                copyfrom,
            },
        ));
    }
}

fn is_strict_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        path != "/"
    } else {
        path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/'
    }
}

/// Folds a change sequence into one entry per path.
///
/// `prefolded` marks input that is already a folded summary (read back from
/// a revision file); descendant pruning is skipped for it because any
/// pruning already happened at commit time.
pub fn fold_changes(
    entries: Vec<(String, Change)>,
    prefolded: bool,
) -> StoreResult<BTreeMap<String, Change>> {
    let mut folded: BTreeMap<String, Change> = BTreeMap::new();
    for (path, change) in entries {
        if change.kind != ChangeKind::Reset && change.id.is_none() {
            return Err(corrupt(format!(
                "change for {path} has no node-revision id"
            )));
        }
        if let Some(old) = folded.get(&path) {
            if old.kind == ChangeKind::Delete
                && !matches!(
                    change.kind,
                    ChangeKind::Add | ChangeKind::Replace | ChangeKind::Reset
                )
            {
                return Err(corrupt(format!(
                    "invalid change ordering: {} of deleted path {path}",
                    change.kind.as_str()
                )));
            }
            if let (Some(old_id), Some(new_id)) = (&old.id, &change.id) {
                if old_id != new_id
                    && old.kind != ChangeKind::Delete
                    && !matches!(change.kind, ChangeKind::Delete | ChangeKind::Reset)
                {
                    return Err(corrupt(format!(
                        "invalid change ordering: new node-revision id for {path} without a \
                         preceding delete"
                    )));
                }
            }
        }
        let mut prune = false;
        match change.kind {
            ChangeKind::Reset => {
                folded.remove(&path);
            }
            ChangeKind::Delete => {
                // Deleting something added in this transaction cancels out.
                if folded.get(&path).is_some_and(|old| old.kind == ChangeKind::Add) {
                    folded.remove(&path);
                } else {
                    folded.insert(
                        path.clone(),
                        Change {
                            id: change.id,
                            kind: ChangeKind::Delete,
                            text_mod: false,
                            prop_mod: false,
                            copyfrom: None,
                        },
                    );
                }
                prune = true;
            }
            ChangeKind::Add | ChangeKind::Replace => {
                let kind = if folded
                    .get(&path)
                    .is_some_and(|old| old.kind == ChangeKind::Delete)
                {
                    ChangeKind::Replace
                } else {
                    change.kind
                };
                prune = kind == ChangeKind::Replace;
                folded.insert(path.clone(), Change { kind, ..change });
            }
            ChangeKind::Modify => match folded.get_mut(&path) {
                Some(old) => {
                    old.id = change.id;
                    old.text_mod |= change.text_mod;
                    old.prop_mod |= change.prop_mod;
                }
                None => {
                    folded.insert(path.clone(), change);
                }
            },
        }
        if prune && !prefolded {
            folded.retain(|other, _| !is_strict_descendant(other, &path));
        }
    }
    Ok(folded)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::store::StoreError;

    fn id(s: &str) -> Option<NodeRevId> {
        Some(NodeRevId::parse(s).unwrap())
    }

    fn change(id_str: &str, kind: ChangeKind) -> Change {
        Change {
            id: id(id_str),
            kind,
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
        }
    }

    #[test]
    fn codec_round_trip() {
        let entries = vec![
            (
                "/A".to_string(),
                Change {
                    id: id("1.0.t2-1"),
                    kind: ChangeKind::Add,
                    text_mod: true,
                    prop_mod: false,
                    copyfrom: Some(CopySource {
                        rev: 1,
                        path: "/old A".to_string(),
                    }),
                },
            ),
            (
                "/dir with spaces/f".to_string(),
                change("2.0.r1/10", ChangeKind::Modify),
            ),
        ];
        let mut bytes = Vec::new();
        for (path, change) in &entries {
            write_change(&mut bytes, path, change).unwrap();
        }
        assert_eq!(read_changes(&mut bytes.as_slice()).unwrap(), entries);
    }

    #[test]
    fn read_stops_at_blank_line() {
        let mut bytes = Vec::new();
        write_change(&mut bytes, "/A", &change("1.0.r1/5", ChangeKind::Modify)).unwrap();
        bytes.extend_from_slice(b"\n17 42\n");
        let entries = read_changes(&mut bytes.as_slice()).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn fold_add_delete_add_collapses() {
        let entries = vec![
            ("/X".to_string(), change("_1.0.t0-1", ChangeKind::Add)),
            ("/X".to_string(), change("_1.0.t0-1", ChangeKind::Delete)),
            ("/X".to_string(), change("_2.0.t0-1", ChangeKind::Add)),
        ];
        let folded = fold_changes(entries, false).unwrap();
        assert_eq!(folded.len(), 1);
        assert_eq!(folded["/X"].kind, ChangeKind::Add);
        assert_eq!(folded["/X"].id, id("_2.0.t0-1"));
    }

    #[test]
    fn fold_delete_after_modify_overrides() {
        let entries = vec![
            ("/X".to_string(), change("1.0.r1/5", ChangeKind::Modify)),
            ("/X".to_string(), change("1.0.r1/5", ChangeKind::Delete)),
        ];
        let folded = fold_changes(entries, false).unwrap();
        assert_eq!(folded["/X"].kind, ChangeKind::Delete);
        assert!(!folded["/X"].text_mod);
    }

    #[test]
    fn fold_add_after_delete_is_replace() {
        let entries = vec![
            ("/X".to_string(), change("1.0.r1/5", ChangeKind::Delete)),
            ("/X".to_string(), change("_1.0.t0-1", ChangeKind::Add)),
        ];
        let folded = fold_changes(entries, false).unwrap();
        assert_eq!(folded["/X"].kind, ChangeKind::Replace);
    }

    #[test]
    fn fold_modify_accumulates_mod_flags() {
        let mut text_change = change("1.0.r1/5", ChangeKind::Modify);
        text_change.text_mod = true;
        let mut prop_change = change("1.0.r1/5", ChangeKind::Modify);
        prop_change.prop_mod = true;
        let entries = vec![
            ("/X".to_string(), text_change),
            ("/X".to_string(), prop_change),
        ];
        let folded = fold_changes(entries, false).unwrap();
        assert!(folded["/X"].text_mod);
        assert!(folded["/X"].prop_mod);
        assert_eq!(folded["/X"].kind, ChangeKind::Modify);
    }

    #[test]
    fn fold_reset_removes_entry() {
        let entries = vec![
            ("/X".to_string(), change("1.0.r1/5", ChangeKind::Modify)),
            (
                "/X".to_string(),
                Change {
                    id: None,
                    kind: ChangeKind::Reset,
                    text_mod: false,
                    prop_mod: false,
                    copyfrom: None,
                },
            ),
        ];
        assert!(fold_changes(entries, false).unwrap().is_empty());
    }

    #[test]
    fn fold_delete_prunes_descendants() {
        let entries = vec![
            ("/d/a".to_string(), change("1.0.r1/5", ChangeKind::Modify)),
            ("/da".to_string(), change("2.0.r1/9", ChangeKind::Modify)),
            ("/d".to_string(), change("3.0.r1/13", ChangeKind::Delete)),
        ];
        let folded = fold_changes(entries, false).unwrap();
        assert!(!folded.contains_key("/d/a"));
        // "/da" is not a strict descendant of "/d".
        assert!(folded.contains_key("/da"));
        assert_eq!(folded["/d"].kind, ChangeKind::Delete);
    }

    #[test]
    fn prefolded_skips_pruning() {
        let entries = vec![
            ("/d/a".to_string(), change("1.0.r1/5", ChangeKind::Modify)),
            ("/d".to_string(), change("3.0.r1/13", ChangeKind::Delete)),
        ];
        let folded = fold_changes(entries, true).unwrap();
        assert!(folded.contains_key("/d/a"));
    }

    #[test]
    fn fold_rejects_null_id() {
        let entries = vec![(
            "/X".to_string(),
            Change {
                id: None,
                kind: ChangeKind::Modify,
                text_mod: false,
                prop_mod: false,
                copyfrom: None,
            },
        )];
        assert_matches!(
            fold_changes(entries, false),
            Err(StoreError::Corrupt { .. })
        );
    }

    #[test]
    fn fold_rejects_modify_of_deleted_path() {
        let entries = vec![
            ("/X".to_string(), change("1.0.r1/5", ChangeKind::Delete)),
            ("/X".to_string(), change("1.0.r1/5", ChangeKind::Modify)),
        ];
        assert_matches!(
            fold_changes(entries, false),
            Err(StoreError::Corrupt { .. })
        );
    }

    #[test]
    fn fold_rejects_new_id_without_delete() {
        let entries = vec![
            ("/X".to_string(), change("1.0.r1/5", ChangeKind::Modify)),
            ("/X".to_string(), change("2.0.r1/9", ChangeKind::Modify)),
        ];
        assert_matches!(
            fold_changes(entries, false),
            Err(StoreError::Corrupt { .. })
        );
    }
}
