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

//! Node-revisions and their on-disk header-block codec.
//!
//! A node-revision is a snapshot of one file or directory at one point in
//! history. On disk it is a block of `name: value` lines terminated by a
//! blank line:
//!
//! ```text
//! id: 4.1.r3/1207
//! type: file
//! pred: 4.1.r2/219
//! count: 3
//! text: 3 879 51 67 2d18eb4153245b6d10c7ab0f4ccffc6b
//! cpath: /trunk/file
//! <blank line>
//! ```

use std::fmt;
use std::io;
use std::io::BufRead;
use std::io::Write;

use crate::id::NodeRevId;
use crate::store::StoreError;
use crate::store::StoreResult;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "dir" => Some(Self::Dir),
            _ => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which file a representation's bytes live in.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum RepLocation {
    /// A published revision file.
    Revision(u64),
    /// The prototype rev file of the transaction that owns the node-revision
    /// pointing at this representation.
    Staging,
}

/// A pointer to a byte sequence stored inside a revision or transaction
/// file.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Representation {
    pub location: RepLocation,
    /// Offset of the `PLAIN`/`DELTA` header line inside the owning file.
    pub offset: u64,
    /// On-disk length of the representation body, excluding the header line
    /// and the `ENDREP` trailer.
    pub size: u64,
    /// Length of the decoded byte stream.
    pub expanded_size: u64,
    /// MD5 digest of the decoded byte stream.
    pub md5: [u8; 16],
}

impl Representation {
    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }
}

/// A representation slot in a node-revision header: either a stored pointer,
/// or the `-1` marker of a mutable prop/directory rep whose current state
/// lives in the transaction staging area.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum RepPointer {
    Mutable,
    Stored(Representation),
}

impl RepPointer {
    pub fn as_stored(&self) -> Option<&Representation> {
        match self {
            Self::Stored(rep) => Some(rep),
            Self::Mutable => None,
        }
    }

    fn to_field_value(&self) -> String {
        match self {
            Self::Mutable => "-1".to_string(),
            Self::Stored(rep) => {
                let rev = match rep.location {
                    RepLocation::Revision(rev) => rev.to_string(),
                    RepLocation::Staging => "-1".to_string(),
                };
                format!(
                    "{rev} {} {} {} {}",
                    rep.offset,
                    rep.size,
                    rep.expanded_size,
                    rep.md5_hex()
                )
            }
        }
    }

    fn parse_field_value(value: &str) -> Option<Self> {
        let fields: Vec<&str> = value.split(' ').collect();
        match fields[..] {
            ["-1"] => Some(Self::Mutable),
            [rev, offset, size, expanded, md5] => {
                let location = if rev == "-1" {
                    RepLocation::Staging
                } else {
                    RepLocation::Revision(rev.parse().ok()?)
                };
                let md5: [u8; 16] = hex::decode(md5).ok()?.try_into().ok()?;
                Some(Self::Stored(Representation {
                    location,
                    offset: offset.parse().ok()?,
                    size: size.parse().ok()?,
                    expanded_size: expanded.parse().ok()?,
                    md5,
                }))
            }
            _ => None,
        }
    }
}

/// A `(revision, path)` pair naming either a copy source or a copy root.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CopySource {
    pub rev: u64,
    pub path: String,
}

impl CopySource {
    fn parse(value: &str) -> Option<Self> {
        let (rev, path) = value.split_once(' ')?;
        Some(Self {
            rev: rev.parse().ok()?,
            path: path.to_string(),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeRev {
    pub id: NodeRevId,
    pub kind: NodeKind,
    pub predecessor: Option<NodeRevId>,
    /// Length of the predecessor chain.
    pub predecessor_count: u64,
    pub data_rep: Option<RepPointer>,
    pub prop_rep: Option<RepPointer>,
    /// The canonical tree path at which this node-revision was created.
    pub created_path: String,
    pub copyfrom: Option<CopySource>,
    /// The nearest ancestor that originated a copy; `None` means this
    /// node-revision itself.
    pub copyroot: Option<CopySource>,
}

fn corrupt(reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        reason: reason.into(),
    }
}

/// Reads one header block, leaving the reader positioned after the
/// terminating blank line.
pub fn read_noderev<R: BufRead>(reader: &mut R) -> StoreResult<NodeRev> {
    let mut id = None;
    let mut kind = None;
    let mut predecessor = None;
    let mut predecessor_count = None;
    let mut data_rep = None;
    let mut prop_rep = None;
    let mut created_path = None;
    let mut copyfrom = None;
    let mut copyroot = None;
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|_| corrupt("unreadable node-revision header"))?;
        if n == 0 {
            return Err(corrupt("unterminated node-revision header"));
        }
        let line = line
            .strip_suffix('\n')
            .ok_or_else(|| corrupt("unterminated node-revision header"))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(": ")
            .ok_or_else(|| corrupt(format!("malformed node-revision header line {line:?}")))?;
        match name {
            "id" => {
                id = Some(
                    NodeRevId::parse(value)
                        .ok_or_else(|| corrupt(format!("malformed node-revision id {value:?}")))?,
                );
            }
            "type" => {
                kind = Some(
                    NodeKind::parse(value)
                        .ok_or_else(|| corrupt(format!("unknown node kind {value:?}")))?,
                );
            }
            "pred" => {
                predecessor = Some(
                    NodeRevId::parse(value)
                        .ok_or_else(|| corrupt(format!("malformed predecessor id {value:?}")))?,
                );
            }
            "count" => {
                predecessor_count = Some(
                    value
                        .parse()
                        .map_err(|_| corrupt(format!("malformed predecessor count {value:?}")))?,
                );
            }
            "text" => {
                data_rep = Some(
                    RepPointer::parse_field_value(value)
                        .ok_or_else(|| corrupt(format!("malformed text rep {value:?}")))?,
                );
            }
            "props" => {
                prop_rep = Some(
                    RepPointer::parse_field_value(value)
                        .ok_or_else(|| corrupt(format!("malformed props rep {value:?}")))?,
                );
            }
            "cpath" => {
                created_path = Some(value.to_string());
            }
            "copyfrom" => {
                copyfrom = Some(
                    CopySource::parse(value)
                        .ok_or_else(|| corrupt(format!("malformed copyfrom {value:?}")))?,
                );
            }
            "copyroot" => {
                copyroot = Some(
                    CopySource::parse(value)
                        .ok_or_else(|| corrupt(format!("malformed copyroot {value:?}")))?,
                );
            }
            _ => {
                return Err(corrupt(format!(
                    "unknown node-revision header field {name:?}"
                )));
            }
        }
    }
    Ok(NodeRev {
        id: id.ok_or_else(|| corrupt("node-revision header is missing 'id'"))?,
        kind: kind.ok_or_else(|| corrupt("node-revision header is missing 'type'"))?,
        predecessor,
        predecessor_count: predecessor_count
            .ok_or_else(|| corrupt("node-revision header is missing 'count'"))?,
        data_rep,
        prop_rep,
        created_path: created_path
            .ok_or_else(|| corrupt("node-revision header is missing 'cpath'"))?,
        copyfrom,
        copyroot,
    })
}

/// Writes one header block including the terminating blank line.
pub fn write_noderev<W: Write>(writer: &mut W, noderev: &NodeRev) -> io::Result<()> {
    writeln!(writer, "id: {}", noderev.id)?;
    writeln!(writer, "type: {}", noderev.kind)?;
    if let Some(pred) = &noderev.predecessor {
        writeln!(writer, "pred: {pred}")?;
    }
    writeln!(writer, "count: {}", noderev.predecessor_count)?;
    if let Some(rep) = &noderev.data_rep {
        writeln!(writer, "text: {}", rep.to_field_value())?;
    }
    if let Some(rep) = &noderev.prop_rep {
        writeln!(writer, "props: {}", rep.to_field_value())?;
    }
    writeln!(writer, "cpath: {}", noderev.created_path)?;
    if let Some(copyfrom) = &noderev.copyfrom {
        writeln!(writer, "copyfrom: {} {}", copyfrom.rev, copyfrom.path)?;
    }
    if let Some(copyroot) = &noderev.copyroot {
        writeln!(writer, "copyroot: {} {}", copyroot.rev, copyroot.path)?;
    }
    writer.write_all(b"\n")
}
