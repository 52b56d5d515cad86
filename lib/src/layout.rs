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

//! On-disk layout of a store: the deterministic mapping from logical
//! entities (revisions, transactions, staged nodes) to filesystem paths.

use std::path::Path;
use std::path::PathBuf;

use crate::keys;
use crate::store::StoreError;
use crate::store::StoreResult;

#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn current_path(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn uuid_path(&self) -> PathBuf {
        self.root.join("uuid")
    }

    pub fn write_lock_path(&self) -> PathBuf {
        self.root.join("write-lock")
    }

    pub fn revs_dir(&self) -> PathBuf {
        self.root.join("revs")
    }

    pub fn rev_path(&self, rev: u64) -> PathBuf {
        self.revs_dir().join(rev.to_string())
    }

    pub fn revprops_dir(&self) -> PathBuf {
        self.root.join("revprops")
    }

    pub fn revprops_path(&self, rev: u64) -> PathBuf {
        self.revprops_dir().join(rev.to_string())
    }

    pub fn txns_dir(&self) -> PathBuf {
        self.root.join("transactions")
    }

    pub fn txn_dir(&self, txn_id: &str) -> PathBuf {
        self.txns_dir().join(format!("{txn_id}.txn"))
    }

    /// The transaction's prototype rev file, accumulating representation
    /// bodies as they are written and renamed into `revs/<N>` at commit.
    pub fn txn_rev_path(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join("rev")
    }

    pub fn txn_changes_path(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join("changes")
    }

    pub fn txn_props_path(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join("props")
    }

    pub fn txn_next_ids_path(&self, txn_id: &str) -> PathBuf {
        self.txn_dir(txn_id).join("next-ids")
    }

    pub fn txn_node_path(&self, txn_id: &str, node_key: &str, copy_key: &str) -> PathBuf {
        self.txn_dir(txn_id).join(format!("node.{node_key}.{copy_key}"))
    }

    pub fn txn_node_props_path(&self, txn_id: &str, node_key: &str, copy_key: &str) -> PathBuf {
        self.txn_dir(txn_id)
            .join(format!("node.{node_key}.{copy_key}.props"))
    }

    pub fn txn_node_children_path(&self, txn_id: &str, node_key: &str, copy_key: &str) -> PathBuf {
        self.txn_dir(txn_id)
            .join(format!("node.{node_key}.{copy_key}.children"))
    }
}

/// Contents of the `current` file: the youngest revision and the next free
/// node and copy keys.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CurrentLine {
    pub youngest: u64,
    pub next_node_key: String,
    pub next_copy_key: String,
}

impl CurrentLine {
    pub fn parse(data: &str) -> StoreResult<Self> {
        let corrupt = || StoreError::Corrupt {
            reason: format!("malformed 'current' contents {data:?}"),
        };
        let line = data.strip_suffix('\n').ok_or_else(corrupt)?;
        let mut fields = line.split(' ');
        let youngest = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(corrupt)?;
        let next_node_key = fields.next().ok_or_else(corrupt)?;
        let next_copy_key = fields.next().ok_or_else(corrupt)?;
        if fields.next().is_some() || !keys::is_key(next_node_key) || !keys::is_key(next_copy_key) {
            return Err(corrupt());
        }
        Ok(Self {
            youngest,
            next_node_key: next_node_key.to_string(),
            next_copy_key: next_copy_key.to_string(),
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {} {}\n",
            self.youngest, self.next_node_key, self.next_copy_key
        )
    }
}
