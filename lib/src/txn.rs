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

//! Transactions: the writable staging area that becomes the next revision.
//!
//! A transaction lives in `transactions/<base>-<seq>.txn/` and holds a
//! prototype rev file, a change log, a revision proplist, a temp-id counter
//! file, and one `node.*` staging file per mutable node-revision. Nothing
//! under the published tree is touched until commit renames the staged
//! files into place; aborting simply deletes the directory.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write as _;

use crate::changes;
use crate::changes::Change;
use crate::changes::ChangeKind;
use crate::dir_store::DirEntry;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::hash_dump;
use crate::hash_dump::Hash;
use crate::id::NodeRevId;
use crate::keys;
use crate::noderev;
use crate::noderev::CopySource;
use crate::noderev::NodeKind;
use crate::noderev::NodeRev;
use crate::noderev::RepPointer;
use crate::rep_write::RepWriter;
use crate::rep_write::choose_delta_base;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::StoreResult;
use crate::store::corrupt;
use crate::store::join_path;
use crate::store::parent_path;
use crate::store::path_components;

/// Upper bound on the per-base sequence numbers tried when allocating a
/// fresh transaction directory.
const MAX_TXN_NAME_ATTEMPTS: u64 = 99_999;

/// An open transaction based on some revision.
#[derive(Debug)]
pub struct Transaction<'a> {
    store: &'a Store,
    id: String,
    base_rev: u64,
}

impl<'a> Transaction<'a> {
    /// Creates a new transaction staging directory based on `base_rev` and
    /// seeds it with a mutable clone of the base root directory.
    pub fn begin(store: &'a Store, base_rev: u64) -> StoreResult<Self> {
        let youngest = store.youngest_rev()?;
        if base_rev > youngest {
            return Err(StoreError::RevisionNotFound(base_rev));
        }
        let base_root = store.rev_root(base_rev)?;
        for seq in 0..MAX_TXN_NAME_ATTEMPTS {
            let id = format!("{base_rev}-{seq}");
            let dir = store.layout().txn_dir(&id);
            match fs::create_dir(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(PathError {
                        path: dir,
                        source: err,
                    }
                    .into());
                }
            }
            let txn = Self {
                store,
                id,
                base_rev,
            };
            txn.initialize(&base_root)?;
            tracing::debug!(txn = %txn.id, base_rev, "created transaction");
            return Ok(txn);
        }
        Err(StoreError::UniqueNamesExhausted)
    }

    fn initialize(&self, base_root: &NodeRev) -> StoreResult<()> {
        let layout = self.store.layout();
        let rev_path = layout.txn_rev_path(&self.id);
        File::create(&rev_path).context(&rev_path)?;
        let changes_path = layout.txn_changes_path(&self.id);
        File::create(&changes_path).context(&changes_path)?;
        let props_path = layout.txn_props_path(&self.id);
        fs::write(&props_path, hash_dump::hash_to_bytes(&Hash::new())).context(&props_path)?;
        self.write_next_ids("0", "0")?;
        let root = NodeRev {
            id: NodeRevId::new_transaction("0", "0", &self.id),
            kind: NodeKind::Dir,
            predecessor: Some(base_root.id.clone()),
            predecessor_count: base_root.predecessor_count + 1,
            data_rep: base_root.data_rep.clone(),
            prop_rep: base_root.prop_rep.clone(),
            created_path: "/".to_string(),
            copyfrom: None,
            copyroot: None,
        };
        self.put_noderev(&root)
    }

    /// Opens an existing transaction directory.
    pub fn open(store: &'a Store, id: &str) -> StoreResult<Self> {
        let base_rev = id
            .split_once('-')
            .and_then(|(base, _)| base.parse().ok())
            .ok_or_else(|| StoreError::TransactionNotFound(id.to_string()))?;
        let root_path = store.layout().txn_node_path(id, "0", "0");
        if !root_path.is_file() {
            return Err(StoreError::TransactionNotFound(id.to_string()));
        }
        Ok(Self {
            store,
            id: id.to_string(),
            base_rev,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base_rev(&self) -> u64 {
        self.base_rev
    }

    pub fn store(&self) -> &Store {
        self.store
    }

    /// Deletes the staging directory. Published state is never affected.
    pub fn abort(self) -> StoreResult<()> {
        Self::purge(self.store, &self.id)
    }

    pub(crate) fn purge(store: &Store, id: &str) -> StoreResult<()> {
        let dir = store.layout().txn_dir(id);
        fs::remove_dir_all(&dir).context(&dir)?;
        store.dir_cache_clear();
        tracing::debug!(txn = %id, "purged transaction");
        Ok(())
    }

    /// The transaction's mutable root directory.
    pub fn root(&self) -> StoreResult<NodeRev> {
        self.store
            .read_noderev(&NodeRevId::new_transaction("0", "0", &self.id))
    }

    pub(crate) fn put_noderev(&self, noderev: &NodeRev) -> StoreResult<()> {
        let id = &noderev.id;
        debug_assert_eq!(id.txn_id(), Some(self.id.as_str()));
        let path = self
            .store
            .layout()
            .txn_node_path(&self.id, id.node_key(), id.copy_key());
        let mut bytes = Vec::new();
        noderev::write_noderev(&mut bytes, noderev)
            .expect("writing to an in-memory buffer should never fail");
        fs::write(&path, bytes).context(&path)?;
        Ok(())
    }

    pub(crate) fn read_next_ids(&self) -> StoreResult<(String, String)> {
        let path = self.store.layout().txn_next_ids_path(&self.id);
        let data = fs::read_to_string(&path).context(&path)?;
        let bad = || corrupt(format!("malformed next-ids contents {data:?}"));
        let line = data.strip_suffix('\n').ok_or_else(bad)?;
        let (node, copy) = line.split_once(' ').ok_or_else(bad)?;
        if !keys::is_key(node) || !keys::is_key(copy) {
            return Err(bad());
        }
        Ok((node.to_string(), copy.to_string()))
    }

    fn write_next_ids(&self, node: &str, copy: &str) -> StoreResult<()> {
        let path = self.store.layout().txn_next_ids_path(&self.id);
        fs::write(&path, format!("{node} {copy}\n")).context(&path)?;
        Ok(())
    }

    fn alloc_node_key(&self) -> StoreResult<String> {
        let (node, copy) = self.read_next_ids()?;
        self.write_next_ids(&keys::next_key(&node), &copy)?;
        Ok(format!("_{node}"))
    }

    fn alloc_copy_key(&self) -> StoreResult<String> {
        let (node, copy) = self.read_next_ids()?;
        self.write_next_ids(&node, &keys::next_key(&copy))?;
        Ok(format!("_{copy}"))
    }

    /// Resolves `path` in the transaction's tree, following mutable nodes
    /// where they exist and base nodes elsewhere.
    pub fn node_at_path(&self, path: &str) -> StoreResult<NodeRev> {
        let mut node = self.root()?;
        let mut walked = String::from("/");
        for name in path_components(path) {
            if node.kind != NodeKind::Dir {
                return Err(StoreError::NotADirectory { path: walked });
            }
            let entries = self.store.dir_entries(&node)?;
            let entry = entries.get(name).ok_or_else(|| StoreError::PathNotFound {
                path: join_path(&walked, name),
            })?;
            node = self.store.read_noderev(&entry.id)?;
            walked = join_path(&walked, name);
        }
        Ok(node)
    }

    /// Clones the node at `path` (and every ancestor) into the staging area
    /// if it is not already mutable, and returns the mutable node.
    pub fn make_path_mutable(&self, path: &str) -> StoreResult<NodeRev> {
        if path == "/" {
            return self.root();
        }
        let (parent_path, name) = parent_path(path)
            .ok_or_else(|| corrupt(format!("uncanonical path {path:?}")))?;
        let mut parent = self.make_path_mutable(parent_path)?;
        let entries = self.store.dir_entries(&parent)?;
        let entry = entries.get(name).ok_or_else(|| StoreError::PathNotFound {
            path: path.to_string(),
        })?;
        let child = self.store.read_noderev(&entry.id)?;
        if child.id.is_txn() {
            return Ok(child);
        }
        let mutable = NodeRev {
            id: NodeRevId::new_transaction(entry.id.node_key(), entry.id.copy_key(), &self.id),
            kind: child.kind,
            predecessor: Some(child.id.clone()),
            predecessor_count: child.predecessor_count + 1,
            data_rep: child.data_rep.clone(),
            prop_rep: child.prop_rep.clone(),
            created_path: path.to_string(),
            copyfrom: None,
            // The nearest copy root is inherited from the parent; under a
            // directory copied in this transaction that is the copy itself.
            copyroot: parent.copyroot.clone(),
        };
        self.put_noderev(&mutable)?;
        self.set_entry(
            &mut parent,
            name,
            Some(DirEntry {
                kind: mutable.kind,
                id: mutable.id.clone(),
            }),
        )?;
        Ok(mutable)
    }

    /// Applies one entry edit to a mutable directory, materializing its
    /// append-log overlay on first touch.
    fn set_entry(
        &self,
        parent: &mut NodeRev,
        name: &str,
        entry: Option<DirEntry>,
    ) -> StoreResult<()> {
        debug_assert!(parent.id.is_txn());
        let layout = self.store.layout();
        let children_path =
            layout.txn_node_children_path(&self.id, parent.id.node_key(), parent.id.copy_key());
        if !matches!(parent.data_rep, Some(RepPointer::Mutable)) {
            let entries = self.store.dir_entries(parent)?;
            fs::write(&children_path, crate::dir_store::serialize_entries(&entries))
                .context(&children_path)?;
            parent.data_rep = Some(RepPointer::Mutable);
            self.put_noderev(parent)?;
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(&children_path)
            .context(&children_path)?;
        let value = entry.as_ref().map(crate::dir_store::entry_value);
        hash_dump::write_incremental_entry(&mut file, name, value.as_deref())
            .context(&children_path)?;
        self.store.dir_cache_edit(&parent.id, name, entry);
        Ok(())
    }

    fn record_change(&self, path: &str, change: &Change) -> StoreResult<()> {
        let changes_path = self.store.layout().txn_changes_path(&self.id);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&changes_path)
            .context(&changes_path)?;
        changes::write_change(&mut file, path, change).context(&changes_path)?;
        Ok(())
    }

    /// The raw, unfolded change log recorded so far.
    pub fn changes(&self) -> StoreResult<Vec<(String, Change)>> {
        let changes_path = self.store.layout().txn_changes_path(&self.id);
        let file = File::open(&changes_path).context(&changes_path)?;
        changes::read_changes(&mut io::BufReader::new(file))
    }

    fn add_node(&self, path: &str, kind: NodeKind) -> StoreResult<()> {
        let (parent_dir, name) = parent_path(path).ok_or_else(|| StoreError::EntryExists {
            path: "/".to_string(),
        })?;
        let mut parent = self.make_path_mutable(parent_dir)?;
        if parent.kind != NodeKind::Dir {
            return Err(StoreError::NotADirectory {
                path: parent_dir.to_string(),
            });
        }
        if self.store.dir_entries(&parent)?.contains_key(name) {
            return Err(StoreError::EntryExists {
                path: path.to_string(),
            });
        }
        let node_key = self.alloc_node_key()?;
        let node = NodeRev {
            id: NodeRevId::new_transaction(node_key, parent.id.copy_key(), &self.id),
            kind,
            predecessor: None,
            predecessor_count: 0,
            data_rep: None,
            prop_rep: None,
            created_path: path.to_string(),
            copyfrom: None,
            copyroot: parent.copyroot.clone(),
        };
        self.put_noderev(&node)?;
        self.set_entry(
            &mut parent,
            name,
            Some(DirEntry {
                kind,
                id: node.id.clone(),
            }),
        )?;
        self.record_change(
            path,
            &Change {
                id: Some(node.id),
                kind: ChangeKind::Add,
                text_mod: false,
                prop_mod: false,
                copyfrom: None,
            },
        )
    }

    /// Creates an empty file at `path`.
    pub fn add_file(&self, path: &str) -> StoreResult<()> {
        self.add_node(path, NodeKind::File)
    }

    /// Creates an empty directory at `path`.
    pub fn add_dir(&self, path: &str) -> StoreResult<()> {
        self.add_node(path, NodeKind::Dir)
    }

    /// Removes the entry at `path`.
    ///
    /// Deleting a path that does not exist underneath a directory copied in
    /// this transaction is silently elided: a mixed-revision copy source may
    /// schedule deletes for children the copy never had.
    pub fn delete(&self, path: &str) -> StoreResult<()> {
        let (parent_dir, name) = parent_path(path)
            .ok_or_else(|| corrupt("the root directory cannot be deleted"))?;
        let mut parent = self.make_path_mutable(parent_dir)?;
        let entries = self.store.dir_entries(&parent)?;
        let Some(entry) = entries.get(name).cloned() else {
            if self.path_has_fresh_copy_ancestor(parent_dir)? {
                tracing::debug!(path, "eliding delete of not-present copy child");
                return Ok(());
            }
            return Err(StoreError::PathNotFound {
                path: path.to_string(),
            });
        };
        self.set_entry(&mut parent, name, None)?;
        self.record_change(
            path,
            &Change {
                id: Some(entry.id),
                kind: ChangeKind::Delete,
                text_mod: false,
                prop_mod: false,
                copyfrom: None,
            },
        )
    }

    /// Whether any directory along `path` was created by a copy in this
    /// transaction.
    fn path_has_fresh_copy_ancestor(&self, path: &str) -> StoreResult<bool> {
        let mut node = self.root()?;
        if node.copyfrom.is_some() {
            return Ok(true);
        }
        for name in path_components(path) {
            let entries = self.store.dir_entries(&node)?;
            let Some(entry) = entries.get(name) else {
                return Ok(false);
            };
            node = self.store.read_noderev(&entry.id)?;
            if node.id.is_txn() && node.copyfrom.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Copies the node at `from_path` in revision `from_rev` to `to_path`.
    pub fn copy(&self, from_rev: u64, from_path: &str, to_path: &str) -> StoreResult<()> {
        let source = self.store.node_at_path(from_rev, from_path)?;
        let (parent_dir, name) = parent_path(to_path).ok_or_else(|| StoreError::EntryExists {
            path: "/".to_string(),
        })?;
        let mut parent = self.make_path_mutable(parent_dir)?;
        if parent.kind != NodeKind::Dir {
            return Err(StoreError::NotADirectory {
                path: parent_dir.to_string(),
            });
        }
        if let Some(parent_copyfrom) = &parent.copyfrom {
            // A child copy inside a copied directory must agree with the
            // parent's source, otherwise the copy is switched.
            if from_rev != parent_copyfrom.rev
                || from_path != join_path(&parent_copyfrom.path, name)
            {
                return Err(StoreError::SwitchedCopy {
                    path: to_path.to_string(),
                });
            }
        }
        let replaced = self.store.dir_entries(&parent)?.contains_key(name);
        let copy_key = self.alloc_copy_key()?;
        let copyfrom = CopySource {
            rev: from_rev,
            path: from_path.to_string(),
        };
        let node = NodeRev {
            id: NodeRevId::new_transaction(source.id.node_key(), copy_key, &self.id),
            kind: source.kind,
            predecessor: Some(source.id.clone()),
            predecessor_count: source.predecessor_count + 1,
            data_rep: source.data_rep.clone(),
            prop_rep: source.prop_rep.clone(),
            created_path: to_path.to_string(),
            copyfrom: Some(copyfrom.clone()),
            // The destination roots the new copy; it becomes permanent in
            // the revision this transaction produces.
            copyroot: Some(CopySource {
                rev: self.base_rev + 1,
                path: to_path.to_string(),
            }),
        };
        self.put_noderev(&node)?;
        self.set_entry(
            &mut parent,
            name,
            Some(DirEntry {
                kind: node.kind,
                id: node.id.clone(),
            }),
        )?;
        self.record_change(
            to_path,
            &Change {
                id: Some(node.id),
                kind: if replaced {
                    ChangeKind::Replace
                } else {
                    ChangeKind::Add
                },
                text_mod: false,
                prop_mod: false,
                copyfrom: Some(copyfrom),
            },
        )
    }

    /// Replaces the contents of the file at `path`, deltified against the
    /// skip-delta base of its history.
    pub fn apply_text(&self, path: &str, contents: &[u8]) -> StoreResult<()> {
        let mut node = self.make_path_mutable(path)?;
        if node.kind != NodeKind::File {
            return Err(StoreError::NotAFile {
                path: path.to_string(),
            });
        }
        let base = choose_delta_base(self.store, &node)?;
        let mut writer = RepWriter::new(self.store, &self.id, base)?;
        writer.write_all(contents).map_err(|err| {
            err.downcast::<StoreError>()
                .map_or_else(|err| corrupt(format!("text write failed: {err}")), |err| err)
        })?;
        let rep = writer.finish()?;
        node.data_rep = Some(RepPointer::Stored(rep));
        self.put_noderev(&node)?;
        self.record_change(
            path,
            &Change {
                id: Some(node.id),
                kind: ChangeKind::Modify,
                text_mod: true,
                prop_mod: false,
                copyfrom: None,
            },
        )
    }

    /// Sets or deletes one property of the node at `path`.
    pub fn change_node_prop(&self, path: &str, name: &str, value: Option<&[u8]>) -> StoreResult<()> {
        let mut node = self.make_path_mutable(path)?;
        let props_path = self.store.layout().txn_node_props_path(
            &self.id,
            node.id.node_key(),
            node.id.copy_key(),
        );
        if !matches!(node.prop_rep, Some(RepPointer::Mutable)) {
            let props = self.store.proplist(&node)?;
            fs::write(&props_path, hash_dump::hash_to_bytes(&props)).context(&props_path)?;
            node.prop_rep = Some(RepPointer::Mutable);
            self.put_noderev(&node)?;
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(&props_path)
            .context(&props_path)?;
        hash_dump::write_incremental_entry(&mut file, name, value).context(&props_path)?;
        self.record_change(
            path,
            &Change {
                id: Some(node.id),
                kind: ChangeKind::Modify,
                text_mod: false,
                prop_mod: true,
                copyfrom: None,
            },
        )
    }

    /// The transaction's revision properties, which become the revprops of
    /// the committed revision.
    pub fn txn_proplist(&self) -> StoreResult<Hash> {
        let path = self.store.layout().txn_props_path(&self.id);
        let file = File::open(&path).context(&path)?;
        hash_dump::read_hash(&mut io::BufReader::new(file))
    }

    pub fn change_txn_prop(&self, name: &str, value: Option<&[u8]>) -> StoreResult<()> {
        let mut props = self.txn_proplist()?;
        match value {
            Some(value) => {
                props.insert(name.to_string(), value.to_vec());
            }
            None => {
                props.remove(name);
            }
        }
        // The props file must stay a plain hash dump because it is renamed
        // into revprops/<N> verbatim at commit.
        let path = self.store.layout().txn_props_path(&self.id);
        fs::write(&path, hash_dump::hash_to_bytes(&props)).context(&path)?;
        Ok(())
    }
}
