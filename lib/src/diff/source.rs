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

//! Chunk-paged access to diff inputs, identical prefix/suffix elision, and
//! line tokenization.
//!
//! Files are paged in 128 KiB chunks; a logical cursor moves through a file
//! without ever holding more than one chunk per datasource. Before the LCS
//! runs, all sources are scanned in lockstep to find the identical prefix
//! and suffix, which the tokenizer then skips. A line ends at `\n` or at a
//! `\r` not followed by `\n`; the prefix scan, the tokenizer, and the
//! output writers all share that rule.

use std::fs::File;
use std::io::Read as _;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use adler32::RollingAdler32;

use super::DiffError;
use super::DiffOptions;
use super::DiffResult;
use super::IgnoreSpace;
use crate::file_util::IoResultExt as _;

pub(crate) const CHUNK_SIZE: u64 = 128 * 1024;

/// Window size used when a token has to be re-streamed from disk for a
/// byte-level comparison.
const COMPARE_CHUNK_SIZE: u64 = 4096;

/// After suffix elision, this many extra identical lines are handed back to
/// the tokenizer so hunks keep enough trailing context.
const SUFFIX_LINES_TO_KEEP: usize = 50;

/// One line of a datasource: raw span plus the fingerprint of its
/// normalized form.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Token {
    pub offset: u64,
    pub raw_len: u64,
    pub norm_len: u64,
    pub adler: u32,
}

pub(crate) struct FileSource {
    path: PathBuf,
    file: File,
    size: u64,
    mtime: Option<SystemTime>,
    chunk_index: i64,
    chunk: Vec<u8>,
    /// First byte after the identical prefix.
    prefix_start: u64,
    /// First byte of the elided suffix; the tokenizer stops here.
    suffix_start: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> DiffResult<Self> {
        let file = File::open(path).context(path)?;
        let metadata = file.metadata().context(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size: metadata.len(),
            mtime: metadata.modified().ok(),
            chunk_index: -1,
            chunk: Vec::new(),
            prefix_start: 0,
            suffix_start: metadata.len(),
        })
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    fn modified_under_us(&self) -> DiffError {
        DiffError::DatasourceModified {
            path: self.path.clone(),
        }
    }

    fn load_chunk(&mut self, index: i64) -> DiffResult<()> {
        debug_assert!(index >= 0);
        let start = index as u64 * CHUNK_SIZE;
        let len = CHUNK_SIZE.min(self.size - start.min(self.size));
        self.file
            .seek(SeekFrom::Start(start))
            .context(&self.path)?;
        let mut chunk = vec![0; len as usize];
        self.file
            .read_exact(&mut chunk)
            .map_err(|_| self.modified_under_us())?;
        self.chunk = chunk;
        self.chunk_index = index;
        Ok(())
    }

    /// The byte at an absolute offset, paging chunks as needed. `None` past
    /// the end of the file.
    pub fn byte_at(&mut self, offset: u64) -> DiffResult<Option<u8>> {
        if offset >= self.size {
            return Ok(None);
        }
        let index = (offset / CHUNK_SIZE) as i64;
        if index != self.chunk_index {
            self.load_chunk(index)?;
        }
        Ok(Some(self.chunk[(offset % CHUNK_SIZE) as usize]))
    }

    /// Reads an arbitrary span, from the resident chunk when possible and
    /// from disk otherwise.
    fn read_span(&mut self, offset: u64, len: u64) -> DiffResult<Vec<u8>> {
        if offset + len > self.size {
            return Err(self.modified_under_us());
        }
        let chunk_start = self.chunk_index.max(0) as u64 * CHUNK_SIZE;
        if self.chunk_index >= 0
            && offset >= chunk_start
            && offset + len <= chunk_start + self.chunk.len() as u64
        {
            let from = (offset - chunk_start) as usize;
            return Ok(self.chunk[from..from + len as usize].to_vec());
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .context(&self.path)?;
        let mut buf = vec![0; len as usize];
        self.file
            .read_exact(&mut buf)
            .map_err(|_| self.modified_under_us())?;
        Ok(buf)
    }
}

/// Streaming normalization of token bytes under the diff options: EOL
/// canonicalization and whitespace collapsing/stripping.
pub(crate) struct Normalizer {
    ignore_space: IgnoreSpace,
    ignore_eol_style: bool,
    pending_space: bool,
    last_cr: bool,
}

impl Normalizer {
    pub fn new(options: &DiffOptions) -> Self {
        Self {
            ignore_space: options.ignore_space,
            ignore_eol_style: options.ignore_eol_style,
            pending_space: false,
            last_cr: false,
        }
    }

    pub fn push(&mut self, byte: u8, emit: &mut impl FnMut(u8)) {
        match byte {
            b'\n' | b'\r' => {
                // Whitespace runs before a line end are dropped entirely.
                self.pending_space = false;
                if self.ignore_eol_style {
                    if byte == b'\r' {
                        self.last_cr = true;
                        emit(b'\n');
                    } else if self.last_cr {
                        self.last_cr = false;
                    } else {
                        emit(b'\n');
                    }
                } else {
                    emit(byte);
                }
            }
            b' ' | b'\t' => {
                self.last_cr = false;
                match self.ignore_space {
                    IgnoreSpace::None => emit(byte),
                    IgnoreSpace::Change => self.pending_space = true,
                    IgnoreSpace::All => {}
                }
            }
            _ => {
                self.last_cr = false;
                if self.pending_space {
                    self.pending_space = false;
                    emit(b' ');
                }
                emit(byte);
            }
        }
    }
}

/// Scans all sources forward in lockstep and records, per source, the
/// position just after the last line that is identical in every source.
/// Returns the number of elided prefix lines.
///
/// `\r\n` and a bare `\r` count as the same line ending, so sources may end
/// the prefix at different byte offsets.
pub(crate) fn find_identical_prefix(sources: &mut [FileSource]) -> DiffResult<usize> {
    let mut lines = 0;
    let mut pos: Vec<u64> = vec![0; sources.len()];
    let mut boundary: Vec<u64> = vec![0; sources.len()];
    loop {
        let first = sources[0].byte_at(pos[0])?;
        let mut all_equal = true;
        for (i, source) in sources.iter_mut().enumerate().skip(1) {
            if source.byte_at(pos[i])? != first {
                all_equal = false;
                break;
            }
        }
        let Some(byte) = first else {
            if all_equal {
                // Every source ended at once; the whole input is prefix.
                boundary.copy_from_slice(&pos);
            }
            break;
        };
        if !all_equal {
            break;
        }
        for p in &mut pos {
            *p += 1;
        }
        if byte == b'\r' {
            for (i, source) in sources.iter_mut().enumerate() {
                if source.byte_at(pos[i])? == Some(b'\n') {
                    pos[i] += 1;
                }
            }
        }
        if byte == b'\r' || byte == b'\n' {
            lines += 1;
            boundary.copy_from_slice(&pos);
        }
    }
    for (source, b) in sources.iter_mut().zip(&boundary) {
        source.prefix_start = *b;
        source.suffix_start = source.size;
    }
    Ok(lines)
}

/// Scans all sources backward from their ends until a mismatch or the
/// prefix watermark, then slides forward past the partial line plus up to
/// [`SUFFIX_LINES_TO_KEEP`] lines of context, recording each source's
/// suffix start.
pub(crate) fn find_identical_suffix(sources: &mut [FileSource]) -> DiffResult<()> {
    let mut epos: Vec<u64> = sources.iter().map(|s| s.size).collect();
    loop {
        let at_watermark = sources
            .iter()
            .zip(&epos)
            .any(|(source, e)| *e == source.prefix_start);
        if at_watermark {
            break;
        }
        let first = sources[0].byte_at(epos[0] - 1)?;
        let mut all_equal = true;
        for (i, source) in sources.iter_mut().enumerate().skip(1) {
            if source.byte_at(epos[i] - 1)? != first {
                all_equal = false;
                break;
            }
        }
        if !all_equal {
            break;
        }
        for e in &mut epos {
            *e -= 1;
        }
    }
    // The suffix content is byte-identical in every source, so the forward
    // slide is the same byte delta for all of them.
    let mut cursor = epos[0];
    let mut lines_remaining = SUFFIX_LINES_TO_KEEP + 1;
    while cursor < sources[0].size && lines_remaining > 0 {
        let byte = sources[0]
            .byte_at(cursor)?
            .expect("cursor is below the file size");
        cursor += 1;
        if byte == b'\r' {
            if sources[0].byte_at(cursor)? == Some(b'\n') {
                cursor += 1;
            }
            lines_remaining -= 1;
        } else if byte == b'\n' {
            lines_remaining -= 1;
        }
    }
    let delta = cursor - epos[0];
    for (source, e) in sources.iter_mut().zip(&epos) {
        source.suffix_start = (*e + delta).min(source.size);
    }
    Ok(())
}

/// Splits the token region of a source into line tokens, fingerprinting the
/// normalized form of each.
pub(crate) fn extract_tokens(
    source: &mut FileSource,
    options: &DiffOptions,
) -> DiffResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut pos = source.prefix_start;
    while pos < source.suffix_start {
        let start = pos;
        let mut normalizer = Normalizer::new(options);
        let mut adler = RollingAdler32::new();
        let mut norm_len = 0u64;
        let mut emit = |byte: u8| {
            adler.update(byte);
            norm_len += 1;
        };
        while pos < source.suffix_start {
            let byte = source
                .byte_at(pos)?
                .ok_or_else(|| source.modified_under_us())?;
            pos += 1;
            normalizer.push(byte, &mut emit);
            if byte == b'\n' {
                break;
            }
            if byte == b'\r' && source.byte_at(pos)? != Some(b'\n') {
                break;
            }
        }
        tokens.push(Token {
            offset: start,
            raw_len: pos - start,
            norm_len,
            adler: adler.hash(),
        });
    }
    Ok(tokens)
}

fn normalized_token_bytes(
    source: &mut FileSource,
    token: &Token,
    options: &DiffOptions,
) -> DiffResult<Vec<u8>> {
    let mut out = Vec::with_capacity(token.norm_len as usize);
    let mut normalizer = Normalizer::new(options);
    let mut consumed = 0;
    while consumed < token.raw_len {
        let want = COMPARE_CHUNK_SIZE.min(token.raw_len - consumed);
        let raw = source.read_span(token.offset + consumed, want)?;
        consumed += want;
        for &byte in &raw {
            normalizer.push(byte, &mut |b| out.push(b));
        }
    }
    Ok(out)
}

/// Byte-level comparison of two tokens' normalized forms, re-streaming each
/// from disk in fixed windows. A length disagreement with the cached token
/// means the file changed under us.
pub(crate) fn tokens_equal(
    sources: &mut [FileSource],
    a: (usize, Token),
    b: (usize, Token),
    options: &DiffOptions,
) -> DiffResult<bool> {
    let (a_file, a_token) = a;
    let (b_file, b_token) = b;
    if a_token.norm_len != b_token.norm_len {
        return Ok(false);
    }
    let a_bytes = normalized_token_bytes(&mut sources[a_file], &a_token, options)?;
    if a_bytes.len() as u64 != a_token.norm_len {
        return Err(sources[a_file].modified_under_us());
    }
    let b_bytes = normalized_token_bytes(&mut sources[b_file], &b_token, options)?;
    if b_bytes.len() as u64 != b_token.norm_len {
        return Err(sources[b_file].modified_under_us());
    }
    Ok(a_bytes == b_bytes)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use test_case::test_case;

    use super::*;
    use crate::tests::new_temp_dir;

    fn write_sources(contents: &[&[u8]]) -> (tempfile::TempDir, Vec<FileSource>) {
        let temp_dir = new_temp_dir();
        let sources = contents
            .iter()
            .enumerate()
            .map(|(i, contents)| {
                let path = temp_dir.path().join(format!("f{i}"));
                fs::write(&path, contents).unwrap();
                FileSource::open(&path).unwrap()
            })
            .collect();
        (temp_dir, sources)
    }

    fn normalize(input: &[u8], options: &DiffOptions) -> Vec<u8> {
        let mut normalizer = Normalizer::new(options);
        let mut out = Vec::new();
        for &b in input {
            normalizer.push(b, &mut |b| out.push(b));
        }
        out
    }

    #[test]
    fn prefix_counts_whole_lines_only() {
        let (_dir, mut sources) = write_sources(&[b"a\nb\ncommon x\n", b"a\nb\ncommon y\n"]);
        let lines = find_identical_prefix(&mut sources).unwrap();
        assert_eq!(lines, 2);
        assert_eq!(sources[0].prefix_start, 4);
        assert_eq!(sources[1].prefix_start, 4);
    }

    #[test]
    fn prefix_handles_mixed_cr_and_crlf() {
        // The first line ends with CRLF in one file and bare CR in the
        // other; the prefix still covers it, at different offsets.
        let (_dir, mut sources) = write_sources(&[b"a\r\nX", b"a\rY"]);
        let lines = find_identical_prefix(&mut sources).unwrap();
        assert_eq!(lines, 1);
        assert_eq!(sources[0].prefix_start, 3);
        assert_eq!(sources[1].prefix_start, 2);
    }

    #[test]
    fn prefix_of_identical_files_covers_everything() {
        let (_dir, mut sources) = write_sources(&[b"same\ncontent", b"same\ncontent"]);
        find_identical_prefix(&mut sources).unwrap();
        assert_eq!(sources[0].prefix_start, 12);
        let tokens = extract_tokens(&mut sources[0], &DiffOptions::default()).unwrap();
        assert!(tokens.is_empty());
    }

    #[test]
    fn suffix_elision_keeps_context_lines() {
        let mut left = b"left\n".to_vec();
        let mut right = b"right\n".to_vec();
        // A long identical tail, longer than the 50 kept context lines.
        for i in 0..80 {
            let line = format!("tail {i}\n");
            left.extend_from_slice(line.as_bytes());
            right.extend_from_slice(line.as_bytes());
        }
        let (_dir, mut sources) = write_sources(&[&left, &right]);
        find_identical_prefix(&mut sources).unwrap();
        find_identical_suffix(&mut sources).unwrap();
        assert!(sources[0].suffix_start < left.len() as u64);
        let tokens0 = extract_tokens(&mut sources[0], &DiffOptions::default()).unwrap();
        let tokens1 = extract_tokens(&mut sources[1], &DiffOptions::default()).unwrap();
        // One differing line plus the partial-line slide and 50 kept lines.
        assert_eq!(tokens0.len(), 51);
        assert_eq!(tokens1.len(), 51);
    }

    #[test]
    fn tokens_cover_the_whole_region() {
        let (_dir, mut sources) = write_sources(&[b"one\ntwo\nthree", b"unrelated\n"]);
        find_identical_prefix(&mut sources).unwrap();
        find_identical_suffix(&mut sources).unwrap();
        let tokens = extract_tokens(&mut sources[0], &DiffOptions::default()).unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].raw_len, 4);
        assert_eq!(tokens[2].raw_len, 5);
        // The final token has no trailing newline.
        assert_eq!(tokens[2].offset, 8);
    }

    #[test]
    fn cr_only_line_endings_split_tokens() {
        let (_dir, mut sources) = write_sources(&[b"a\rb\rc", b"x\n"]);
        find_identical_prefix(&mut sources).unwrap();
        find_identical_suffix(&mut sources).unwrap();
        let tokens = extract_tokens(&mut sources[0], &DiffOptions::default()).unwrap();
        assert_eq!(tokens.len(), 3);
    }

    #[test_case(b"a b\n", b"a b\n", IgnoreSpace::None, false, true; "identical")]
    #[test_case(b"a  b\n", b"a b\n", IgnoreSpace::None, false, false; "spaces differ without option")]
    #[test_case(b"a \t b\n", b"a b\n", IgnoreSpace::Change, false, true; "collapsed run")]
    #[test_case(b"a  b\n", b"ab\n", IgnoreSpace::Change, false, false; "collapse is not removal")]
    #[test_case(b" a\tb \n", b"ab\n", IgnoreSpace::All, false, true; "all space removed")]
    #[test_case(b"line\r\n", b"line\n", IgnoreSpace::None, true, true; "crlf vs lf")]
    #[test_case(b"line\r", b"line\n", IgnoreSpace::None, true, true; "cr vs lf")]
    #[test_case(b"line\r\n", b"line\n", IgnoreSpace::None, false, false; "eols differ without option")]
    #[test_case(b"trail  \n", b"trail\n", IgnoreSpace::Change, false, true; "trailing run dropped")]
    fn normalization_classes(
        left: &[u8],
        right: &[u8],
        ignore_space: IgnoreSpace,
        ignore_eol_style: bool,
        equal: bool,
    ) {
        let options = DiffOptions {
            ignore_space,
            ignore_eol_style,
            show_c_function: false,
        };
        assert_eq!(normalize(left, &options) == normalize(right, &options), equal);
    }

    #[test]
    fn tokens_equal_re_streams_from_disk() {
        let (_dir, mut sources) = write_sources(&[b"alpha beta\ngamma\n", b"alpha  beta\nother\n"]);
        let options = DiffOptions {
            ignore_space: IgnoreSpace::Change,
            ..DiffOptions::default()
        };
        let tokens0 = extract_tokens(&mut sources[0], &options).unwrap();
        let tokens1 = extract_tokens(&mut sources[1], &options).unwrap();
        assert!(tokens_equal(&mut sources, (0, tokens0[0]), (1, tokens1[0]), &options).unwrap());
        assert!(!tokens_equal(&mut sources, (0, tokens0[1]), (1, tokens1[1]), &options).unwrap());
    }

    #[test]
    fn shrunk_file_reports_datasource_modified() {
        let temp_dir = new_temp_dir();
        let path = temp_dir.path().join("f");
        fs::write(&path, b"0123456789\n").unwrap();
        let source = FileSource::open(&path).unwrap();
        fs::write(&path, b"01\n").unwrap();
        let token = Token {
            offset: 0,
            raw_len: 11,
            norm_len: 11,
            adler: 0,
        };
        let mut sources = vec![source];
        let err = tokens_equal(
            &mut sources,
            (0, token),
            (0, token),
            &DiffOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DiffError::DatasourceModified { .. }));
    }
}
