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

//! Node-revision identifiers.
//!
//! A node-revision id is a triplet of a node key, a copy key, and a location.
//! Published node-revisions live at a byte offset inside a revision file and
//! render as `node.copy.r<rev>/<offset>`; in-flight ones live in a
//! transaction's staging area and render as `node.copy.t<txn_id>`.

use std::fmt;

use crate::keys;

/// Where a node-revision is stored.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum IdLocation {
    /// Published, at `offset` inside the revision file for `rev`.
    Revision { rev: u64, offset: u64 },
    /// Staged inside the transaction named by `txn_id`.
    Transaction { txn_id: String },
}

/// Identifier of one node-revision: one file or directory at one point in
/// history.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NodeRevId {
    node: String,
    copy: String,
    location: IdLocation,
}

impl NodeRevId {
    pub fn new_revision(
        node: impl Into<String>,
        copy: impl Into<String>,
        rev: u64,
        offset: u64,
    ) -> Self {
        Self {
            node: node.into(),
            copy: copy.into(),
            location: IdLocation::Revision { rev, offset },
        }
    }

    pub fn new_transaction(
        node: impl Into<String>,
        copy: impl Into<String>,
        txn_id: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            copy: copy.into(),
            location: IdLocation::Transaction {
                txn_id: txn_id.into(),
            },
        }
    }

    pub fn node_key(&self) -> &str {
        &self.node
    }

    pub fn copy_key(&self) -> &str {
        &self.copy
    }

    pub fn location(&self) -> &IdLocation {
        &self.location
    }

    /// Whether this id refers to a mutable node-revision inside a
    /// transaction.
    pub fn is_txn(&self) -> bool {
        matches!(self.location, IdLocation::Transaction { .. })
    }

    pub fn txn_id(&self) -> Option<&str> {
        match &self.location {
            IdLocation::Transaction { txn_id } => Some(txn_id),
            IdLocation::Revision { .. } => None,
        }
    }

    pub fn rev(&self) -> Option<u64> {
        match &self.location {
            IdLocation::Revision { rev, .. } => Some(*rev),
            IdLocation::Transaction { .. } => None,
        }
    }

    /// Parses `node.copy.r<rev>/<offset>` or `node.copy.t<txn_id>`. Returns
    /// `None` on malformed input; callers report corruption with context.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '.');
        let node = parts.next()?;
        let copy = parts.next()?;
        let loc = parts.next()?;
        if !keys::is_node_key(node) || !keys::is_node_key(copy) {
            return None;
        }
        if let Some(rest) = loc.strip_prefix('r') {
            let (rev, offset) = rest.split_once('/')?;
            let rev = rev.parse().ok()?;
            let offset = offset.parse().ok()?;
            Some(Self::new_revision(node, copy, rev, offset))
        } else if let Some(txn_id) = loc.strip_prefix('t') {
            if txn_id.is_empty() {
                return None;
            }
            Some(Self::new_transaction(node, copy, txn_id))
        } else {
            None
        }
    }
}

impl fmt::Display for NodeRevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            IdLocation::Revision { rev, offset } => {
                write!(f, "{}.{}.r{}/{}", self.node, self.copy, rev, offset)
            }
            IdLocation::Transaction { txn_id } => {
                write!(f, "{}.{}.t{}", self.node, self.copy, txn_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_revision_id() {
        let id = NodeRevId::parse("4.1.r3/1207").unwrap();
        assert_eq!(id.node_key(), "4");
        assert_eq!(id.copy_key(), "1");
        assert_eq!(
            *id.location(),
            IdLocation::Revision {
                rev: 3,
                offset: 1207
            }
        );
        assert!(!id.is_txn());
        assert_eq!(id.to_string(), "4.1.r3/1207");
    }

    #[test]
    fn parse_transaction_id() {
        let id = NodeRevId::parse("_2.0.t5-1").unwrap();
        assert_eq!(id.node_key(), "_2");
        assert_eq!(id.copy_key(), "0");
        assert_eq!(id.txn_id(), Some("5-1"));
        assert!(id.is_txn());
        assert_eq!(id.to_string(), "_2.0.t5-1");
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(NodeRevId::parse("").is_none());
        assert!(NodeRevId::parse("4.1").is_none());
        assert!(NodeRevId::parse("4.1.x3/7").is_none());
        assert!(NodeRevId::parse("4.1.r3").is_none());
        assert!(NodeRevId::parse("4.1.rx/7").is_none());
        assert!(NodeRevId::parse("4.1.t").is_none());
        assert!(NodeRevId::parse("A.1.r3/7").is_none());
    }

    #[test]
    fn display_parse_round_trip() {
        for s in ["0.0.r0/17", "_1._2.t9-12", "z9.0.r42/0"] {
            let id = NodeRevId::parse(s).unwrap();
            assert_eq!(NodeRevId::parse(&id.to_string()), Some(id));
        }
    }
}
