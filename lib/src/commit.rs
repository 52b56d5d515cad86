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

//! The commit coordinator.
//!
//! Commit serializes writers behind the store's write lock and then turns a
//! transaction into revision N+1 in a strict order: finalize node-revisions
//! bottom-up in the prototype rev file, append the folded changed-paths
//! section and the trailer, fsync, rename the prototype into `revs/<N+1>`,
//! rename the transaction props into `revprops/<N+1>`, and finally publish
//! by rewriting `current` through a temp file. A failure at any step leaves
//! the published store untouched; readers never observe a revision before
//! `current` names it.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;

use crate::changes;
use crate::changes::Change;
use crate::dir_store;
use crate::file_util::IoResultExt as _;
use crate::file_util::persist_temp_file;
use crate::hash_dump;
use crate::id::NodeRevId;
use crate::keys;
use crate::layout::CurrentLine;
use crate::lock::FileLock;
use crate::noderev;
use crate::noderev::NodeKind;
use crate::noderev::RepLocation;
use crate::noderev::RepPointer;
use crate::rep_write::write_plain_rep;
use crate::store::MAX_TRAILER_LEN;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::StoreResult;
use crate::store::corrupt;
use crate::txn::Transaction;

impl Transaction<'_> {
    /// Commits this transaction, producing and publishing the next
    /// revision. The transaction is purged on success.
    pub fn commit(self) -> StoreResult<u64> {
        commit(self.store(), &self)
    }
}

/// See [`Transaction::commit`].
#[tracing::instrument(skip_all, fields(txn = %txn.id()))]
pub fn commit(store: &Store, txn: &Transaction) -> StoreResult<u64> {
    let _lock = FileLock::lock(store.layout().write_lock_path())?;
    let current = store.read_current()?;
    if txn.base_rev() != current.youngest {
        return Err(StoreError::OutOfDate {
            base: txn.base_rev(),
            youngest: current.youngest,
        });
    }
    let new_rev = current.youngest + 1;
    let (txn_node_count, txn_copy_count) = txn.read_next_ids()?;

    let proto_path = store.layout().txn_rev_path(txn.id());
    let file = OpenOptions::new()
        .write(true)
        .open(&proto_path)
        .context(&proto_path)?;
    let mut writer = CommitWriter {
        store,
        file,
        path: proto_path.clone(),
        new_rev,
        start_node_key: current.next_node_key.clone(),
        start_copy_key: current.next_copy_key.clone(),
        id_map: HashMap::new(),
    };

    let root_id = txn.root()?.id;
    let final_root_id = writer.write_final_node(&root_id)?;
    let root_offset = match final_root_id.location() {
        crate::id::IdLocation::Revision { offset, .. } => *offset,
        crate::id::IdLocation::Transaction { .. } => {
            return Err(corrupt("transaction root survived finalization"));
        }
    };
    tracing::debug!(new_rev, root_offset, "finalized node-revisions");

    let folded = changes::fold_changes(txn.changes()?, false)?;
    let final_changes = writer.translate_change_ids(folded)?;
    let mut file = writer.file;
    let changes_offset = file.seek(SeekFrom::End(0)).context(&proto_path)?;
    for (path, change) in &final_changes {
        changes::write_change(&mut file, path, change).context(&proto_path)?;
    }

    let trailer = format!("\n{root_offset} {changes_offset}\n");
    debug_assert!(trailer.len() - 2 <= MAX_TRAILER_LEN);
    file.write_all(trailer.as_bytes()).context(&proto_path)?;
    file.sync_all().context(&proto_path)?;
    drop(file);

    // Publication: the new rev file carries the previous one's permission
    // bits, and every step from here on is a single atomic rename.
    let prev_rev_path = store.layout().rev_path(new_rev - 1);
    let permissions = fs::metadata(&prev_rev_path)
        .context(&prev_rev_path)?
        .permissions();
    fs::set_permissions(&proto_path, permissions).context(&proto_path)?;
    let rev_path = store.layout().rev_path(new_rev);
    rename_or_copy(&proto_path, &rev_path)?;
    let props_path = store.layout().txn_props_path(txn.id());
    let revprops_path = store.layout().revprops_path(new_rev);
    rename_or_copy(&props_path, &revprops_path)?;

    let new_current = CurrentLine {
        youngest: new_rev,
        next_node_key: keys::key_add(&current.next_node_key, &txn_node_count),
        next_copy_key: keys::key_add(&current.next_copy_key, &txn_copy_count),
    };
    let root_dir = store.layout().root().to_path_buf();
    let mut temp_file = NamedTempFile::new_in(&root_dir).context(&root_dir)?;
    temp_file
        .write_all(new_current.to_line().as_bytes())
        .context(temp_file.path())?;
    let current_path = store.layout().current_path();
    persist_temp_file(temp_file, &current_path).context(&current_path)?;

    Transaction::purge(store, txn.id())?;
    tracing::debug!(new_rev, "committed");
    Ok(new_rev)
}

/// Renames across filesystems by degrading to copy+fsync+unlink.
fn rename_or_copy(from: &Path, to: &Path) -> StoreResult<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to).context(to)?;
            File::open(to).context(to)?.sync_all().context(to)?;
            fs::remove_file(from).context(from)?;
            Ok(())
        }
        Err(err) => Err(crate::file_util::PathError {
            path: from.to_path_buf(),
            source: err,
        }
        .into()),
    }
}

struct CommitWriter<'a> {
    store: &'a Store,
    file: File,
    path: PathBuf,
    new_rev: u64,
    start_node_key: String,
    start_copy_key: String,
    /// Maps each staged id (by display form) to its permanent id.
    id_map: HashMap<String, NodeRevId>,
}

impl CommitWriter<'_> {
    fn renumber_key(key: &str, start: &str) -> String {
        match key.strip_prefix('_') {
            Some(offset) => keys::key_add(start, offset),
            None => key.to_string(),
        }
    }

    /// Finalizes one staged node-revision: children first (post-order),
    /// then its mutable directory and prop representations, then its
    /// renumbered header block at a permanent offset. Published ids pass
    /// through untouched.
    fn write_final_node(&mut self, id: &NodeRevId) -> StoreResult<NodeRevId> {
        if !id.is_txn() {
            return Ok(id.clone());
        }
        let mut noderev = self.store.read_noderev(id)?;
        if noderev.kind == NodeKind::Dir && matches!(noderev.data_rep, Some(RepPointer::Mutable)) {
            let mut entries = (*self.store.dir_entries(&noderev)?).clone();
            for entry in entries.values_mut() {
                entry.id = self.write_final_node(&entry.id)?;
            }
            let bytes = dir_store::serialize_entries(&entries);
            let rep = write_plain_rep(&mut self.file, &self.path, self.new_rev, &bytes)?;
            noderev.data_rep = Some(RepPointer::Stored(rep));
        } else if let Some(RepPointer::Stored(rep)) = &mut noderev.data_rep {
            if rep.location == RepLocation::Staging {
                rep.location = RepLocation::Revision(self.new_rev);
            }
        } else if matches!(noderev.data_rep, Some(RepPointer::Mutable)) {
            return Err(corrupt(format!("file {} has a truncated data rep", id)));
        }

        if matches!(noderev.prop_rep, Some(RepPointer::Mutable)) {
            let props = self.store.proplist(&noderev)?;
            let bytes = hash_dump::hash_to_bytes(&props);
            let rep = write_plain_rep(&mut self.file, &self.path, self.new_rev, &bytes)?;
            noderev.prop_rep = Some(RepPointer::Stored(rep));
        }

        let offset = self.file.seek(SeekFrom::End(0)).context(&self.path)?;
        let final_id = NodeRevId::new_revision(
            Self::renumber_key(id.node_key(), &self.start_node_key),
            Self::renumber_key(id.copy_key(), &self.start_copy_key),
            self.new_rev,
            offset,
        );
        noderev.id = final_id.clone();
        noderev::write_noderev(&mut self.file, &noderev).context(&self.path)?;
        self.id_map.insert(id.to_string(), final_id.clone());
        Ok(final_id)
    }

    /// Rewrites staged ids in the folded change log to their permanent
    /// forms. A staged node that was never finalized must have been cloned
    /// and then deleted; its entry references the published node the clone
    /// superseded.
    fn translate_change_ids(
        &self,
        folded: BTreeMap<String, Change>,
    ) -> StoreResult<BTreeMap<String, Change>> {
        folded
            .into_iter()
            .map(|(path, mut change)| {
                if let Some(id) = &change.id {
                    if id.is_txn() {
                        match self.id_map.get(&id.to_string()) {
                            Some(final_id) => change.id = Some(final_id.clone()),
                            None => {
                                let staged = self.store.read_noderev(id)?;
                                let predecessor = staged.predecessor.ok_or_else(|| {
                                    corrupt(format!(
                                        "changed path {path} references unwritten node {id}"
                                    ))
                                })?;
                                change.id = Some(predecessor);
                            }
                        }
                    }
                }
                Ok((path, change))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use digest::Digest as _;
    use md5::Md5;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::changes::ChangeKind;
    use crate::noderev::CopySource;
    use crate::tests::new_temp_dir;

    #[test]
    fn empty_commit() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        let rev = txn.commit().unwrap();
        assert_eq!(rev, 1);
        assert_eq!(store.read_current().unwrap().to_line(), "1 1 1\n");
        assert!(temp_dir.path().join("revs/1").is_file());
        let root = store.rev_root(1).unwrap();
        assert_eq!(root.kind, NodeKind::Dir);
        assert_eq!(root.created_path, "/");
        assert!(store.dir_entries(&root).unwrap().is_empty());
        assert!(store.paths_changed(1).unwrap().is_empty());
        // The staging directory is gone.
        assert!(fs::read_dir(temp_dir.path().join("transactions"))
            .unwrap()
            .next()
            .is_none());
    }

    #[test]
    fn commit_added_file() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        txn.add_file("/A").unwrap();
        txn.apply_text("/A", b"hello\n").unwrap();
        let rev = txn.commit().unwrap();
        assert_eq!(rev, 1);

        let node = store.node_at_path(1, "/A").unwrap();
        assert_eq!(node.kind, NodeKind::File);
        assert!(!node.id.is_txn());
        assert_eq!(node.id.node_key(), "1");
        assert_eq!(store.file_contents(&node).unwrap(), b"hello\n");
        let rep = node.data_rep.as_ref().unwrap().as_stored().unwrap();
        assert_eq!(rep.location, RepLocation::Revision(1));
        assert_eq!(rep.expanded_size, 6);
        assert_eq!(rep.md5, <[u8; 16]>::from(Md5::digest(b"hello\n")));

        let changed = store.paths_changed(1).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed["/A"].kind, ChangeKind::Add);
        assert!(changed["/A"].text_mod);
        assert_eq!(changed["/A"].id.as_ref().unwrap(), &node.id);

        // One node id was consumed, no copy ids.
        assert_eq!(store.read_current().unwrap().to_line(), "1 2 1\n");
    }

    #[test]
    fn modify_deltifies_against_previous_revision() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        txn.add_file("/A").unwrap();
        txn.apply_text("/A", b"hello\n").unwrap();
        txn.commit().unwrap();

        let txn = Transaction::begin(&store, 1).unwrap();
        txn.apply_text("/A", b"hello world\n").unwrap();
        let rev = txn.commit().unwrap();
        assert_eq!(rev, 2);

        let node = store.node_at_path(2, "/A").unwrap();
        assert_eq!(node.predecessor_count, 1);
        let rep = node.data_rep.as_ref().unwrap().as_stored().unwrap();
        assert_eq!(rep.location, RepLocation::Revision(2));
        assert_eq!(rep.expanded_size, 12);
        assert_eq!(store.file_contents(&node).unwrap(), b"hello world\n");

        // The on-disk representation is a delta whose base lives in rev 1.
        let base = store
            .node_at_path(1, "/A")
            .unwrap()
            .data_rep
            .unwrap()
            .as_stored()
            .unwrap()
            .clone();
        let rev2 = fs::read(temp_dir.path().join("revs/2")).unwrap();
        let header_end = rev2[rep.offset as usize..]
            .iter()
            .position(|&b| b == b'\n')
            .unwrap();
        let header =
            std::str::from_utf8(&rev2[rep.offset as usize..rep.offset as usize + header_end])
                .unwrap();
        assert_eq!(
            header,
            format!("DELTA 1 {} {}", base.offset, base.size)
        );
    }

    #[test]
    fn add_delete_add_folds_to_single_add() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        txn.add_file("/X").unwrap();
        txn.delete("/X").unwrap();
        txn.add_file("/X").unwrap();
        let rev = txn.commit().unwrap();
        let changed = store.paths_changed(rev).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed["/X"].kind, ChangeKind::Add);
    }

    #[test]
    fn stale_base_fails_out_of_date() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let winner = Transaction::begin(&store, 0).unwrap();
        let loser = Transaction::begin(&store, 0).unwrap();
        winner.commit().unwrap();
        assert_matches!(
            loser.commit(),
            Err(StoreError::OutOfDate {
                base: 0,
                youngest: 1
            })
        );
        // The failed commit did not disturb published state.
        assert_eq!(store.youngest_rev().unwrap(), 1);
        assert!(!temp_dir.path().join("revs/2").exists());
    }

    #[test]
    fn commit_publishes_txn_props_as_revprops() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        txn.change_txn_prop("log", Some(b"first change")).unwrap();
        let rev = txn.commit().unwrap();
        let props = store.revision_proplist(rev).unwrap();
        assert_eq!(props["log"], b"first change");
    }

    #[test]
    fn commit_copy_records_copyfrom() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        txn.add_file("/A").unwrap();
        txn.apply_text("/A", b"contents\n").unwrap();
        txn.commit().unwrap();

        let txn = Transaction::begin(&store, 1).unwrap();
        txn.copy(1, "/A", "/B").unwrap();
        let rev = txn.commit().unwrap();

        let node = store.node_at_path(rev, "/B").unwrap();
        let copyfrom = node.copyfrom.as_ref().unwrap();
        assert_eq!((copyfrom.rev, copyfrom.path.as_str()), (1, "/A"));
        assert_eq!(store.file_contents(&node).unwrap(), b"contents\n");
        // A fresh copy id was allocated and made permanent.
        assert_eq!(node.id.copy_key(), "1");
        let changed = store.paths_changed(rev).unwrap();
        assert_eq!(changed["/B"].kind, ChangeKind::Add);
        assert_eq!(changed["/B"].copyfrom.as_ref().unwrap().path, "/A");
        assert_eq!(store.read_current().unwrap().next_copy_key, "2");
    }

    #[test]
    fn copied_subtree_carries_its_copyroot() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        txn.add_dir("/src").unwrap();
        txn.add_file("/src/f").unwrap();
        txn.apply_text("/src/f", b"v1\n").unwrap();
        txn.commit().unwrap();

        let txn = Transaction::begin(&store, 1).unwrap();
        txn.copy(1, "/src", "/dst").unwrap();
        // Touching the lazily-shared child materializes it under the copy.
        txn.apply_text("/dst/f", b"v2\n").unwrap();
        let rev = txn.commit().unwrap();

        let copy_root = store.node_at_path(rev, "/dst").unwrap();
        let child = store.node_at_path(rev, "/dst/f").unwrap();
        let expected = CopySource {
            rev,
            path: "/dst".to_string(),
        };
        assert_eq!(copy_root.copyroot, Some(expected.clone()));
        assert_eq!(child.copyroot, Some(expected));
        // The untouched source subtree is not re-rooted.
        assert_eq!(store.node_at_path(rev, "/src/f").unwrap().copyroot, None);
    }

    #[test]
    fn node_props_survive_commit() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        txn.add_file("/f").unwrap();
        txn.change_node_prop("/f", "mime-type", Some(b"text/plain"))
            .unwrap();
        let rev = txn.commit().unwrap();
        let node = store.node_at_path(rev, "/f").unwrap();
        let props = store.proplist(&node).unwrap();
        assert_eq!(props["mime-type"], b"text/plain");
        assert_matches!(node.prop_rep, Some(RepPointer::Stored(_)));
    }

    #[test]
    fn long_history_round_trips_through_skip_deltas() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        txn.add_file("/data").unwrap();
        let mut expected: Vec<Vec<u8>> = Vec::new();
        let base: Vec<u8> = (b'a'..=b'z').cycle().take(2000).collect();
        let mut contents = base.clone();
        txn.apply_text("/data", &contents).unwrap();
        expected.push(contents.clone());
        txn.commit().unwrap();
        for rev in 1..9u64 {
            contents.extend_from_slice(format!("edit {rev}\n").as_bytes());
            contents[100] = b'A' + (rev as u8);
            let txn = Transaction::begin(&store, rev).unwrap();
            txn.apply_text("/data", &contents).unwrap();
            expected.push(contents.clone());
            assert_eq!(txn.commit().unwrap(), rev + 1);
        }
        // Every historical revision still expands to what was written, and
        // the skip-delta invariant bounds each chain.
        for (i, contents) in expected.iter().enumerate() {
            let rev = (i + 1) as u64;
            let node = store.node_at_path(rev, "/data").unwrap();
            assert_eq!(node.predecessor_count, i as u64);
            assert_eq!(&store.file_contents(&node).unwrap(), contents);
        }
    }

    #[test]
    fn deep_tree_commit() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        txn.add_dir("/a").unwrap();
        txn.add_dir("/a/b").unwrap();
        txn.add_file("/a/b/f").unwrap();
        txn.apply_text("/a/b/f", b"leaf\n").unwrap();
        txn.add_file("/top").unwrap();
        let rev = txn.commit().unwrap();

        let node = store.node_at_path(rev, "/a/b/f").unwrap();
        assert_eq!(store.file_contents(&node).unwrap(), b"leaf\n");
        let changed = store.paths_changed(rev).unwrap();
        assert_eq!(
            changed.keys().collect::<Vec<_>>(),
            ["/a", "/a/b", "/a/b/f", "/top"]
        );
        // All ids in the published tree are permanent.
        for path in ["/a", "/a/b", "/a/b/f", "/top"] {
            assert!(!store.node_at_path(rev, path).unwrap().id.is_txn());
        }
    }

    #[test]
    fn modify_then_delete_in_one_transaction() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        txn.add_file("/A").unwrap();
        txn.apply_text("/A", b"v1\n").unwrap();
        txn.commit().unwrap();

        let txn = Transaction::begin(&store, 1).unwrap();
        txn.apply_text("/A", b"v2\n").unwrap();
        txn.delete("/A").unwrap();
        let rev = txn.commit().unwrap();
        let changed = store.paths_changed(rev).unwrap();
        assert_eq!(changed["/A"].kind, ChangeKind::Delete);
        // The entry references the published node the deleted clone
        // superseded.
        let published = store.node_at_path(1, "/A").unwrap();
        assert_eq!(changed["/A"].id.as_ref().unwrap(), &published.id);
        assert_matches!(
            store.node_at_path(rev, "/A"),
            Err(StoreError::PathNotFound { .. })
        );
    }

    #[test]
    fn delete_in_later_revision() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let txn = Transaction::begin(&store, 0).unwrap();
        txn.add_file("/A").unwrap();
        txn.commit().unwrap();

        let txn = Transaction::begin(&store, 1).unwrap();
        txn.delete("/A").unwrap();
        let rev = txn.commit().unwrap();
        assert_matches!(
            store.node_at_path(rev, "/A"),
            Err(StoreError::PathNotFound { .. })
        );
        // The old revision still has it.
        assert!(store.node_at_path(1, "/A").is_ok());
        let changed = store.paths_changed(rev).unwrap();
        assert_eq!(changed["/A"].kind, ChangeKind::Delete);
    }
}
