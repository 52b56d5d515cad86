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

//! The store handle: repository bootstrap and the read side of the revision
//! store.

use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::io::Read as _;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use digest::Digest as _;
use md5::Md5;
use tempfile::NamedTempFile;
use thiserror::Error;
use uuid::Uuid;

use crate::changes;
use crate::changes::Change;
use crate::dir_store;
use crate::dir_store::DirEntries;
use crate::dir_store::DirEntry;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::file_util::create_or_reuse_dir;
use crate::file_util::persist_temp_file;
use crate::hash_dump;
use crate::hash_dump::Hash;
use crate::id::IdLocation;
use crate::id::NodeRevId;
use crate::layout::CurrentLine;
use crate::layout::Layout;
use crate::lock::FileLockError;
use crate::noderev;
use crate::noderev::NodeKind;
use crate::noderev::NodeRev;
use crate::noderev::RepLocation;
use crate::noderev::RepPointer;
use crate::noderev::Representation;
use crate::rep_read::RepReader;

/// The trailer line is the last line of a revision file and holds at most
/// this many bytes before its terminating newline.
pub const MAX_TRAILER_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A malformed on-disk record.
    #[error("Corrupt store data: {reason}")]
    Corrupt { reason: String },
    #[error("No store found at {0}")]
    StoreNotFound(PathBuf),
    #[error("No such revision {0}")]
    RevisionNotFound(u64),
    #[error("No such transaction {0}")]
    TransactionNotFound(String),
    #[error("Path {path} not found")]
    PathNotFound { path: String },
    #[error("Checksum mismatch: expected {expected}, actual {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    /// The commit base is no longer the youngest revision.
    #[error("Transaction out of date: based on revision {base}, youngest is {youngest}")]
    OutOfDate { base: u64, youngest: u64 },
    #[error("Ran out of unique transaction names")]
    UniqueNamesExhausted,
    #[error("{path} is not a directory")]
    NotADirectory { path: String },
    #[error("{path} is not a file")]
    NotAFile { path: String },
    #[error("Entry {path} already exists")]
    EntryExists { path: String },
    /// A copied child whose source disagrees with its parent's copy source.
    #[error("Copy of {path} is switched relative to its parent")]
    SwitchedCopy { path: String },
    #[error(transparent)]
    Io(#[from] PathError),
    #[error(transparent)]
    Lock(#[from] FileLockError),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn corrupt(reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        reason: reason.into(),
    }
}

/// Iterates the non-empty components of a canonical path like `/trunk/file`.
pub(crate) fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

pub(crate) fn parent_path(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let (parent, name) = path.rsplit_once('/')?;
    Some((if parent.is_empty() { "/" } else { parent }, name))
}

/// A handle to an on-disk store.
///
/// Readers may share a store through `&Store`; the single-slot directory
/// cache is internally synchronized. Writers are serialized by the commit
/// lock, not by this handle.
#[derive(Debug)]
pub struct Store {
    layout: Layout,
    dir_cache: Mutex<Option<(String, Arc<DirEntries>)>>,
}

impl Store {
    /// Creates a new, empty store at `path` and returns a handle to it.
    ///
    /// The new store holds revision 0: an empty root directory and no
    /// changed paths.
    pub fn init(path: &Path) -> StoreResult<Self> {
        let layout = Layout::new(path.to_path_buf());
        fs::create_dir_all(path).context(path)?;
        let current_path = layout.current_path();
        if current_path.try_exists().context(&current_path)? {
            return Err(PathError {
                path: current_path,
                source: io::Error::new(io::ErrorKind::AlreadyExists, "store already initialized"),
            }
            .into());
        }
        for dir in [layout.revs_dir(), layout.revprops_dir(), layout.txns_dir()] {
            create_or_reuse_dir(&dir).context(&dir)?;
        }
        let uuid_path = layout.uuid_path();
        fs::write(&uuid_path, format!("{}\n", Uuid::new_v4())).context(&uuid_path)?;

        let rev0_path = layout.rev_path(0);
        fs::write(&rev0_path, Self::revision_zero_bytes()).context(&rev0_path)?;
        let revprops0_path = layout.revprops_path(0);
        fs::write(&revprops0_path, hash_dump::hash_to_bytes(&Hash::new()))
            .context(&revprops0_path)?;

        let current = CurrentLine {
            youngest: 0,
            next_node_key: "1".to_string(),
            next_copy_key: "1".to_string(),
        };
        let current_path = layout.current_path();
        fs::write(&current_path, current.to_line()).context(&current_path)?;
        Ok(Self::new(layout))
    }

    fn revision_zero_bytes() -> Vec<u8> {
        let empty_dir = hash_dump::hash_to_bytes(&Hash::new());
        let mut buf = Vec::new();
        buf.extend_from_slice(b"PLAIN\n");
        buf.extend_from_slice(&empty_dir);
        buf.extend_from_slice(b"ENDREP\n");
        let root_offset = buf.len() as u64;
        let root = NodeRev {
            id: NodeRevId::new_revision("0", "0", 0, root_offset),
            kind: NodeKind::Dir,
            predecessor: None,
            predecessor_count: 0,
            data_rep: Some(RepPointer::Stored(Representation {
                location: RepLocation::Revision(0),
                offset: 0,
                size: empty_dir.len() as u64,
                expanded_size: empty_dir.len() as u64,
                md5: Md5::digest(&empty_dir).into(),
            })),
            prop_rep: None,
            created_path: "/".to_string(),
            copyfrom: None,
            copyroot: None,
        };
        noderev::write_noderev(&mut buf, &root)
            .expect("writing to an in-memory buffer should never fail");
        let changes_offset = buf.len() as u64;
        buf.extend_from_slice(format!("\n{root_offset} {changes_offset}\n").as_bytes());
        buf
    }

    /// Opens an existing store, validating its `current` and `uuid` files.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let layout = Layout::new(path.to_path_buf());
        let current_path = layout.current_path();
        let data = match fs::read_to_string(&current_path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::StoreNotFound(path.to_path_buf()));
            }
            Err(err) => {
                return Err(PathError {
                    path: current_path,
                    source: err,
                }
                .into());
            }
        };
        CurrentLine::parse(&data)?;
        let store = Self::new(layout);
        store.uuid()?;
        Ok(store)
    }

    fn new(layout: Layout) -> Self {
        Self {
            layout,
            dir_cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        self.layout.root()
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn uuid(&self) -> StoreResult<String> {
        let path = self.layout.uuid_path();
        let data = fs::read_to_string(&path).context(&path)?;
        let uuid = data
            .strip_suffix('\n')
            .filter(|uuid| uuid.len() == 36)
            .ok_or_else(|| corrupt(format!("malformed uuid file contents {data:?}")))?;
        Ok(uuid.to_string())
    }

    pub fn read_current(&self) -> StoreResult<CurrentLine> {
        let path = self.layout.current_path();
        let data = fs::read_to_string(&path).context(&path)?;
        CurrentLine::parse(&data)
    }

    pub fn youngest_rev(&self) -> StoreResult<u64> {
        Ok(self.read_current()?.youngest)
    }

    pub(crate) fn open_rev_file(&self, rev: u64) -> StoreResult<File> {
        let path = self.layout.rev_path(rev);
        match File::open(&path) {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::RevisionNotFound(rev))
            }
            Err(err) => Err(PathError { path, source: err }.into()),
        }
    }

    /// Opens the file holding a representation's bytes: a revision file, or
    /// the prototype rev file of the owning transaction.
    pub(crate) fn rep_file(
        &self,
        location: &RepLocation,
        txn_id: Option<&str>,
    ) -> StoreResult<File> {
        match location {
            RepLocation::Revision(rev) => self.open_rev_file(*rev),
            RepLocation::Staging => {
                let txn_id =
                    txn_id.ok_or_else(|| corrupt("staged representation outside a transaction"))?;
                let path = self.layout.txn_rev_path(txn_id);
                match File::open(&path) {
                    Ok(file) => Ok(file),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        Err(StoreError::TransactionNotFound(txn_id.to_string()))
                    }
                    Err(err) => Err(PathError { path, source: err }.into()),
                }
            }
        }
    }

    /// Reads the trailer of a revision file, returning the offsets of the
    /// root node-revision and of the changed-paths section.
    pub(crate) fn read_trailer(&self, rev: u64) -> StoreResult<(u64, u64)> {
        let path = self.layout.rev_path(rev);
        let mut file = self.open_rev_file(rev)?;
        let len = file.metadata().context(&path)?.len();
        let tail_len = len.min((MAX_TRAILER_LEN + 2) as u64);
        file.seek(SeekFrom::Start(len - tail_len)).context(&path)?;
        let mut tail = Vec::with_capacity(tail_len as usize);
        file.read_to_end(&mut tail).context(&path)?;
        let bad_trailer = || corrupt(format!("revision {rev} has a malformed trailer"));
        let tail = std::str::from_utf8(&tail).map_err(|_| bad_trailer())?;
        let line = tail
            .strip_suffix('\n')
            .and_then(|tail| tail.rsplit_once('\n'))
            .map(|(_, line)| line)
            .ok_or_else(bad_trailer)?;
        let (root, changed) = line.split_once(' ').ok_or_else(bad_trailer)?;
        let root_offset = root.parse().map_err(|_| bad_trailer())?;
        let changes_offset = changed.parse().map_err(|_| bad_trailer())?;
        Ok((root_offset, changes_offset))
    }

    pub(crate) fn read_noderev_in_rev(&self, rev: u64, offset: u64) -> StoreResult<NodeRev> {
        let path = self.layout.rev_path(rev);
        let mut file = self.open_rev_file(rev)?;
        file.seek(SeekFrom::Start(offset)).context(&path)?;
        noderev::read_noderev(&mut BufReader::new(file))
    }

    /// Reads the root directory node-revision of a revision.
    pub fn rev_root(&self, rev: u64) -> StoreResult<NodeRev> {
        let (root_offset, _) = self.read_trailer(rev)?;
        self.read_noderev_in_rev(rev, root_offset)
    }

    /// Dereferences a node-revision id, staged or published.
    pub fn read_noderev(&self, id: &NodeRevId) -> StoreResult<NodeRev> {
        match id.location() {
            IdLocation::Revision { rev, offset } => self.read_noderev_in_rev(*rev, *offset),
            IdLocation::Transaction { txn_id } => {
                let path = self
                    .layout
                    .txn_node_path(txn_id, id.node_key(), id.copy_key());
                let data = fs::read(&path)
                    .map_err(|_| corrupt(format!("dangling node-revision id {id}")))?;
                noderev::read_noderev(&mut data.as_slice())
            }
        }
    }

    /// Resolves `path` inside the tree of revision `rev`.
    pub fn node_at_path(&self, rev: u64, path: &str) -> StoreResult<NodeRev> {
        let mut node = self.rev_root(rev)?;
        let mut walked = String::from("/");
        for name in path_components(path) {
            if node.kind != NodeKind::Dir {
                return Err(StoreError::NotADirectory { path: walked });
            }
            let entries = self.dir_entries(&node)?;
            let entry = entries.get(name).ok_or_else(|| StoreError::PathNotFound {
                path: join_path(&walked, name),
            })?;
            node = self.read_noderev(&entry.id)?;
            walked = join_path(&walked, name);
        }
        Ok(node)
    }

    /// Streams and fully expands a file's contents, verifying the stored
    /// MD5 digest.
    pub fn file_contents(&self, noderev: &NodeRev) -> StoreResult<Vec<u8>> {
        if noderev.kind != NodeKind::File {
            return Err(StoreError::NotAFile {
                path: noderev.created_path.clone(),
            });
        }
        match &noderev.data_rep {
            None => Ok(Vec::new()),
            Some(RepPointer::Mutable) => {
                Err(corrupt("file contents cannot be a truncated mutable rep"))
            }
            Some(RepPointer::Stored(rep)) => {
                let mut reader = self.rep_reader(noderev.id.txn_id(), rep)?;
                let mut contents = Vec::new();
                reader
                    .read_to_end(&mut contents)
                    .map_err(RepReader::into_store_error)?;
                Ok(contents)
            }
        }
    }

    /// Opens a streaming, digest-verifying reader over a representation.
    pub fn rep_reader(&self, txn_id: Option<&str>, rep: &Representation) -> StoreResult<RepReader> {
        RepReader::new(self, txn_id, rep)
    }

    /// Reads a node-revision's property list.
    pub fn proplist(&self, noderev: &NodeRev) -> StoreResult<Hash> {
        match &noderev.prop_rep {
            None => Ok(Hash::new()),
            Some(RepPointer::Mutable) => {
                let id = &noderev.id;
                let txn_id = id
                    .txn_id()
                    .ok_or_else(|| corrupt("mutable props on a published node-revision"))?;
                let path = self
                    .layout
                    .txn_node_props_path(txn_id, id.node_key(), id.copy_key());
                let file = File::open(&path).context(&path)?;
                hash_dump::read_hash_incremental(&mut BufReader::new(file))
            }
            Some(RepPointer::Stored(rep)) => {
                let reader = self.rep_reader(noderev.id.txn_id(), rep)?;
                hash_dump::read_hash(&mut BufReader::new(reader))
            }
        }
    }

    /// Loads a directory's entries, consulting the single-slot cache.
    pub fn dir_entries(&self, noderev: &NodeRev) -> StoreResult<Arc<DirEntries>> {
        if noderev.kind != NodeKind::Dir {
            return Err(StoreError::NotADirectory {
                path: noderev.created_path.clone(),
            });
        }
        let cache_key = noderev.id.to_string();
        if let Some((key, entries)) = &*self.dir_cache.lock().unwrap() {
            if *key == cache_key {
                tracing::trace!(id = %cache_key, "directory cache hit");
                return Ok(entries.clone());
            }
        }
        let entries = Arc::new(self.load_dir_entries(noderev)?);
        *self.dir_cache.lock().unwrap() = Some((cache_key, entries.clone()));
        Ok(entries)
    }

    fn load_dir_entries(&self, noderev: &NodeRev) -> StoreResult<DirEntries> {
        let hash = match &noderev.data_rep {
            None => Hash::new(),
            Some(RepPointer::Mutable) => {
                let id = &noderev.id;
                let txn_id = id
                    .txn_id()
                    .ok_or_else(|| corrupt("mutable directory outside a transaction"))?;
                let path =
                    self.layout
                        .txn_node_children_path(txn_id, id.node_key(), id.copy_key());
                let file = File::open(&path).context(&path)?;
                hash_dump::read_hash_incremental(&mut BufReader::new(file))?
            }
            Some(RepPointer::Stored(rep)) => {
                let reader = self.rep_reader(noderev.id.txn_id(), rep)?;
                hash_dump::read_hash(&mut BufReader::new(reader))?
            }
        };
        dir_store::entries_from_hash(&hash)
    }

    /// Drops the directory cache. Called when a transaction directory is
    /// purged so a later transaction reusing the same name cannot observe
    /// stale entries.
    pub(crate) fn dir_cache_clear(&self) {
        *self.dir_cache.lock().unwrap() = None;
    }

    /// Applies one directory edit to the cache: mutating the cached
    /// directory keeps it coherent, mutating any other directory evicts.
    pub(crate) fn dir_cache_edit(&self, id: &NodeRevId, name: &str, entry: Option<DirEntry>) {
        let mut slot = self.dir_cache.lock().unwrap();
        match &mut *slot {
            Some((key, entries)) if *key == id.to_string() => {
                let entries = Arc::make_mut(entries);
                match entry {
                    Some(entry) => {
                        entries.insert(name.to_string(), entry);
                    }
                    None => {
                        entries.remove(name);
                    }
                }
            }
            _ => *slot = None,
        }
    }

    /// The folded changed-paths summary of a published revision.
    pub fn paths_changed(&self, rev: u64) -> StoreResult<BTreeMap<String, Change>> {
        let (_, changes_offset) = self.read_trailer(rev)?;
        let path = self.layout.rev_path(rev);
        let mut file = self.open_rev_file(rev)?;
        file.seek(SeekFrom::Start(changes_offset)).context(&path)?;
        let entries = changes::read_changes(&mut BufReader::new(file))?;
        changes::fold_changes(entries, true)
    }

    pub fn revision_proplist(&self, rev: u64) -> StoreResult<Hash> {
        let path = self.layout.revprops_path(rev);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::RevisionNotFound(rev));
            }
            Err(err) => return Err(PathError { path, source: err }.into()),
        };
        hash_dump::read_hash(&mut BufReader::new(file))
    }

    /// Sets or deletes one revision property, republishing the revprops file
    /// atomically.
    pub fn set_revision_prop(&self, rev: u64, name: &str, value: Option<&[u8]>) -> StoreResult<()> {
        let mut props = self.revision_proplist(rev)?;
        match value {
            Some(value) => {
                props.insert(name.to_string(), value.to_vec());
            }
            None => {
                props.remove(name);
            }
        }
        let dir = self.layout.revprops_dir();
        let mut temp_file = NamedTempFile::new_in(&dir).context(&dir)?;
        temp_file
            .write_all(&hash_dump::hash_to_bytes(&props))
            .context(temp_file.path())?;
        let path = self.layout.revprops_path(rev);
        persist_temp_file(temp_file, &path).context(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::tests::new_temp_dir;

    #[test]
    fn init_creates_revision_zero() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let current = store.read_current().unwrap();
        assert_eq!(current.to_line(), "0 1 1\n");
        assert_eq!(store.uuid().unwrap().len(), 36);

        let root = store.rev_root(0).unwrap();
        assert_eq!(root.kind, NodeKind::Dir);
        assert_eq!(root.created_path, "/");
        assert_eq!(root.predecessor_count, 0);
        let entries = store.dir_entries(&root).unwrap();
        assert!(entries.is_empty());
        assert!(store.paths_changed(0).unwrap().is_empty());
        assert!(store.revision_proplist(0).unwrap().is_empty());
    }

    #[test]
    fn init_refuses_an_existing_store() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        assert_matches!(Store::init(temp_dir.path()), Err(StoreError::Io(_)));
        // The existing store is untouched.
        assert_eq!(store.youngest_rev().unwrap(), 0);
        assert!(store.rev_root(0).is_ok());
    }

    #[test]
    fn open_round_trips() {
        let temp_dir = new_temp_dir();
        let uuid = {
            let store = Store::init(temp_dir.path()).unwrap();
            store.uuid().unwrap()
        };
        let store = Store::open(temp_dir.path()).unwrap();
        assert_eq!(store.uuid().unwrap(), uuid);
        assert_eq!(store.youngest_rev().unwrap(), 0);
    }

    #[test]
    fn open_missing_store_is_not_found() {
        let temp_dir = new_temp_dir();
        assert_matches!(
            Store::open(&temp_dir.path().join("nowhere")),
            Err(StoreError::StoreNotFound(_))
        );
    }

    #[test]
    fn open_rejects_corrupt_current() {
        let temp_dir = new_temp_dir();
        Store::init(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("current"), "borked\n").unwrap();
        assert_matches!(
            Store::open(temp_dir.path()),
            Err(StoreError::Corrupt { .. })
        );
    }

    #[test]
    fn missing_revision_is_not_found() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        assert_matches!(store.rev_root(9), Err(StoreError::RevisionNotFound(9)));
        assert_matches!(
            store.revision_proplist(9),
            Err(StoreError::RevisionNotFound(9))
        );
    }

    #[test]
    fn path_lookup_on_empty_root() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let root = store.node_at_path(0, "/").unwrap();
        assert_eq!(root.created_path, "/");
        assert_matches!(
            store.node_at_path(0, "/missing"),
            Err(StoreError::PathNotFound { path }) if path == "/missing"
        );
    }

    #[test]
    fn set_revision_prop_round_trips() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        store
            .set_revision_prop(0, "log", Some(b"initial import"))
            .unwrap();
        store.set_revision_prop(0, "author", Some(b"ada")).unwrap();
        let props = store.revision_proplist(0).unwrap();
        assert_eq!(props["log"], b"initial import");
        store.set_revision_prop(0, "author", None).unwrap();
        assert!(!store.revision_proplist(0).unwrap().contains_key("author"));
    }

    #[test]
    fn trailer_is_within_bounds() {
        let temp_dir = new_temp_dir();
        let store = Store::init(temp_dir.path()).unwrap();
        let (root_offset, changes_offset) = store.read_trailer(0).unwrap();
        assert!(root_offset < changes_offset);
        let len = fs::metadata(temp_dir.path().join("revs/0")).unwrap().len();
        assert!(changes_offset < len);
    }

    #[test]
    fn path_helpers() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(parent_path("/a/b"), Some(("/a", "b")));
        assert_eq!(parent_path("/a"), Some(("/", "a")));
        assert_eq!(parent_path("/"), None);
        assert_eq!(path_components("/a/b").collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(path_components("/").count(), 0);
    }
}
