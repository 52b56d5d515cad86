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

//! Writing representations into a transaction's prototype rev file.
//!
//! File contents are stored as deltas against a predecessor chosen by
//! clearing the lowest set bit of the node's predecessor count. That skip
//! pattern keeps every delta chain logarithmic in the length of the
//! history. Nodes with no predecessor delta against the empty stream.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read as _;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use digest::Digest as _;
use md5::Md5;

use crate::file_util::IoResultExt as _;
use crate::noderev::NodeRev;
use crate::noderev::RepLocation;
use crate::noderev::RepPointer;
use crate::noderev::Representation;
use crate::rep_read::RepReader;
use crate::store::Store;
use crate::store::StoreResult;
use crate::store::corrupt;
use crate::svndiff;
use crate::svndiff::WINDOW_SIZE;

/// Picks the delta base for a new representation of `noderev`: the ancestor
/// at file-revision index `count & (count - 1)`. Returns `None` when the
/// node should delta against the empty stream.
pub(crate) fn choose_delta_base(
    store: &Store,
    noderev: &NodeRev,
) -> StoreResult<Option<Representation>> {
    let count = noderev.predecessor_count;
    if count == 0 {
        return Ok(None);
    }
    let mut walk = count - (count & (count - 1));
    let mut node = noderev.clone();
    while walk > 0 {
        let pred = node.predecessor.clone().ok_or_else(|| {
            corrupt(format!(
                "predecessor chain of {} is shorter than its count",
                noderev.id
            ))
        })?;
        node = store.read_noderev(&pred)?;
        walk -= 1;
    }
    match &node.data_rep {
        Some(RepPointer::Stored(rep)) if matches!(rep.location, RepLocation::Revision(_)) => {
            Ok(Some(rep.clone()))
        }
        _ => Ok(None),
    }
}

/// Appends a PLAIN representation to a rev file being assembled and returns
/// its pointer.
pub(crate) fn write_plain_rep(
    file: &mut File,
    path: &Path,
    rev: u64,
    bytes: &[u8],
) -> StoreResult<Representation> {
    let offset = file.seek(SeekFrom::End(0)).context(path)?;
    file.write_all(b"PLAIN\n").context(path)?;
    file.write_all(bytes).context(path)?;
    file.write_all(b"ENDREP\n").context(path)?;
    Ok(Representation {
        location: RepLocation::Revision(rev),
        offset,
        size: bytes.len() as u64,
        expanded_size: bytes.len() as u64,
        md5: Md5::digest(bytes).into(),
    })
}

/// Deltifies caller-supplied bytes against a base and appends the result to
/// the transaction's prototype rev file.
///
/// The caller streams content through the [`Write`] impl and then calls
/// [`RepWriter::finish`] to obtain the finished pointer. The MD5 recorded
/// with the representation digests the expanded bytes, not the delta.
pub(crate) struct RepWriter {
    file: File,
    path: PathBuf,
    header_offset: u64,
    body_start: u64,
    source: Option<RepReader>,
    source_len: u64,
    window_index: u64,
    pending: Vec<u8>,
    digest: Md5,
    expanded: u64,
}

impl RepWriter {
    pub fn new(store: &Store, txn_id: &str, base: Option<Representation>) -> StoreResult<Self> {
        let path = store.layout().txn_rev_path(txn_id);
        let mut file = OpenOptions::new().write(true).open(&path).context(&path)?;
        let header_offset = file.seek(SeekFrom::End(0)).context(&path)?;
        match &base {
            None => {
                file.write_all(b"DELTA\n").context(&path)?;
            }
            Some(rep) => {
                let RepLocation::Revision(base_rev) = rep.location else {
                    return Err(corrupt("delta base must be a published representation"));
                };
                file.write_all(format!("DELTA {base_rev} {} {}\n", rep.offset, rep.size).as_bytes())
                    .context(&path)?;
            }
        }
        let body_start = file.stream_position().context(&path)?;
        file.write_all(svndiff::MAGIC).context(&path)?;
        let source = base
            .as_ref()
            .map(|rep| RepReader::new(store, None, rep))
            .transpose()?;
        let source_len = base.as_ref().map_or(0, |rep| rep.expanded_size);
        Ok(Self {
            file,
            path,
            header_offset,
            body_start,
            source,
            source_len,
            window_index: 0,
            pending: Vec::new(),
            digest: Md5::new(),
            expanded: 0,
        })
    }

    fn flush_window(&mut self, len: usize) -> StoreResult<()> {
        let target: Vec<u8> = self.pending.drain(..len).collect();
        let window_size = WINDOW_SIZE as u64;
        let sview_offset = (self.window_index * window_size).min(self.source_len);
        let sview_len = (self.source_len - sview_offset).min(window_size);
        let mut source_view = vec![0; sview_len as usize];
        if let Some(source) = &mut self.source {
            if sview_len > 0 {
                source
                    .read_exact(&mut source_view)
                    .map_err(RepReader::into_store_error)?;
            }
        }
        let window = svndiff::build_window(sview_offset, &source_view, &target);
        svndiff::write_window(&mut self.file, &window).context(&self.path)?;
        self.window_index += 1;
        Ok(())
    }

    pub fn finish(mut self) -> StoreResult<Representation> {
        if !self.pending.is_empty() {
            let len = self.pending.len();
            self.flush_window(len)?;
        }
        let body_end = self.file.stream_position().context(&self.path)?;
        self.file.write_all(b"ENDREP\n").context(&self.path)?;
        self.file.flush().context(&self.path)?;
        Ok(Representation {
            location: RepLocation::Staging,
            offset: self.header_offset,
            size: body_end - self.body_start,
            expanded_size: self.expanded,
            md5: self.digest.finalize().into(),
        })
    }
}

impl Write for RepWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.digest.update(buf);
        self.expanded += buf.len() as u64;
        self.pending.extend_from_slice(buf);
        while self.pending.len() >= WINDOW_SIZE {
            self.flush_window(WINDOW_SIZE).map_err(io::Error::other)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
