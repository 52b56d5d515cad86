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

//! A line-oriented diff engine over 2, 3, or 4 files.
//!
//! The pipeline pages each input in chunks, elides the identical prefix and
//! suffix, tokenizes the remainder into normalized lines, interns tokens
//! into equivalence classes, and runs an LCS over the class sequences. The
//! resulting hunks and three-way regions carry absolute 0-based line
//! numbers per file; [`unified`] and [`merge`] render them.

use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use smallvec::SmallVec;
use thiserror::Error;

use crate::file_util::PathError;

mod lcs;
mod lines;
mod source;
pub mod merge;
pub mod unified;

use lcs::ChangedRange;
use source::FileSource;
use source::Token;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IgnoreSpace {
    #[default]
    None,
    /// Runs of blanks compare equal to a single blank.
    Change,
    /// Blanks are ignored entirely.
    All,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DiffOptions {
    pub ignore_space: IgnoreSpace,
    pub ignore_eol_style: bool,
    pub show_c_function: bool,
}

impl DiffOptions {
    /// Parses command-line style option words.
    pub fn parse_args<I, S>(args: I) -> DiffResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::default();
        for arg in args {
            match arg.as_ref() {
                "-u" | "--unified" => {}
                "-b" | "--ignore-space-change" => {
                    if options.ignore_space == IgnoreSpace::None {
                        options.ignore_space = IgnoreSpace::Change;
                    }
                }
                "-w" | "--ignore-all-space" => options.ignore_space = IgnoreSpace::All,
                "--ignore-eol-style" => options.ignore_eol_style = true,
                "-p" | "--show-c-function" => options.show_c_function = true,
                other => return Err(DiffError::InvalidOption(other.to_string())),
            }
        }
        Ok(options)
    }
}

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("Invalid diff option: {0}")]
    InvalidOption(String),
    #[error("{path} was modified while being diffed")]
    DatasourceModified { path: PathBuf },
    #[error(transparent)]
    Io(#[from] PathError),
    #[error("Failed to write diff output")]
    Output(#[source] std::io::Error),
}

pub type DiffResult<T> = Result<T, DiffError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HunkKind {
    Common,
    Different,
}

/// A hunk of a two-way diff in absolute 0-based line numbers. `Common`
/// hunks cover only the tokenized region; identical prefix and suffix
/// lines appear in no hunk at all.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiffHunk {
    pub kind: HunkKind,
    pub original: Range<usize>,
    pub modified: Range<usize>,
}

/// Result of a two-way file diff.
#[derive(Debug)]
pub struct FileDiff {
    pub(crate) paths: [PathBuf; 2],
    pub(crate) mtimes: [Option<SystemTime>; 2],
    pub hunks: Vec<DiffHunk>,
}

impl FileDiff {
    /// True when the inputs compared equal under the options.
    pub fn is_empty(&self) -> bool {
        self.hunks.iter().all(|hunk| hunk.kind == HunkKind::Common)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Region3Kind {
    /// All three sides agree.
    Common,
    /// Only the modified side changed.
    Modified,
    /// Only the latest side changed.
    Latest,
    /// Both sides made the same change.
    Identical,
    /// The sides made different overlapping changes.
    Conflict,
}

/// A region of a three-way diff, with per-file absolute line ranges.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Region3 {
    pub kind: Region3Kind,
    pub original: Range<usize>,
    pub modified: Range<usize>,
    pub latest: Range<usize>,
    /// Resolution text supplied by the caller for a `Conflict` region;
    /// honored by the resolved display style.
    pub resolved: Option<Vec<u8>>,
}

/// Result of a three-way (or four-way) file diff.
#[derive(Debug)]
pub struct FileDiff3 {
    pub(crate) paths: [PathBuf; 3],
    pub regions: Vec<Region3>,
}

impl FileDiff3 {
    pub fn has_conflicts(&self) -> bool {
        self.regions
            .iter()
            .any(|region| region.kind == Region3Kind::Conflict)
    }
}

fn prepare(
    paths: &[&Path],
    options: &DiffOptions,
) -> DiffResult<(Vec<FileSource>, Vec<Vec<u32>>, usize)> {
    let mut sources = paths
        .iter()
        .map(|path| FileSource::open(path))
        .collect::<DiffResult<Vec<_>>>()?;
    let prefix_lines = source::find_identical_prefix(&mut sources)?;
    source::find_identical_suffix(&mut sources)?;
    let mut tokens = Vec::with_capacity(sources.len());
    for source in &mut sources {
        tokens.push(source::extract_tokens(source, options)?);
    }
    let classes = intern_tokens(&mut sources, &tokens, options)?;
    Ok((sources, classes, prefix_lines))
}

/// Assigns every token an equivalence class id, confirming fingerprint
/// matches by re-reading raw bytes.
fn intern_tokens(
    sources: &mut [FileSource],
    tokens: &[Vec<Token>],
    options: &DiffOptions,
) -> DiffResult<Vec<Vec<u32>>> {
    let mut buckets: HashMap<(u64, u32), SmallVec<[u32; 2]>> = HashMap::new();
    let mut representatives: Vec<(usize, Token)> = Vec::new();
    let mut classes = Vec::with_capacity(tokens.len());
    for (file, file_tokens) in tokens.iter().enumerate() {
        let mut file_classes = Vec::with_capacity(file_tokens.len());
        for token in file_tokens {
            let key = (token.norm_len, token.adler);
            let mut found = None;
            if let Some(candidates) = buckets.get(&key) {
                for &class in candidates {
                    let representative = representatives[class as usize];
                    if source::tokens_equal(sources, representative, (file, *token), options)? {
                        found = Some(class);
                        break;
                    }
                }
            }
            let class = match found {
                Some(class) => class,
                None => {
                    let class = representatives.len() as u32;
                    representatives.push((file, *token));
                    buckets.entry(key).or_default().push(class);
                    class
                }
            };
            file_classes.push(class);
        }
        classes.push(file_classes);
    }
    Ok(classes)
}

fn hunks_from_changes(
    changes: &[ChangedRange],
    a_len: usize,
    b_len: usize,
    prefix_lines: usize,
) -> Vec<DiffHunk> {
    let mut hunks = Vec::new();
    let mut a_pos = 0;
    let mut b_pos = 0;
    for change in changes {
        if change.a.start > a_pos {
            let len = change.a.start - a_pos;
            hunks.push(DiffHunk {
                kind: HunkKind::Common,
                original: a_pos..a_pos + len,
                modified: b_pos..b_pos + len,
            });
        }
        hunks.push(DiffHunk {
            kind: HunkKind::Different,
            original: change.a.clone(),
            modified: change.b.clone(),
        });
        a_pos = change.a.end;
        b_pos = change.b.end;
    }
    if a_pos < a_len {
        debug_assert_eq!(a_len - a_pos, b_len - b_pos);
        hunks.push(DiffHunk {
            kind: HunkKind::Common,
            original: a_pos..a_len,
            modified: b_pos..b_len,
        });
    }
    for hunk in &mut hunks {
        hunk.original = hunk.original.start + prefix_lines..hunk.original.end + prefix_lines;
        hunk.modified = hunk.modified.start + prefix_lines..hunk.modified.end + prefix_lines;
    }
    hunks
}

/// Diffs two files.
pub fn diff_files(
    original: &Path,
    modified: &Path,
    options: &DiffOptions,
) -> DiffResult<FileDiff> {
    let (sources, classes, prefix_lines) = prepare(&[original, modified], options)?;
    let changes = lcs::diff(&classes[0], &classes[1]);
    let hunks = hunks_from_changes(&changes, classes[0].len(), classes[1].len(), prefix_lines);
    Ok(FileDiff {
        paths: [original.to_path_buf(), modified.to_path_buf()],
        mtimes: [sources[0].mtime(), sources[1].mtime()],
        hunks,
    })
}

fn joins_group(group_start: usize, group_end: usize, first: bool, range: &Range<usize>) -> bool {
    if first {
        range.start == group_start
    } else if group_start == group_end {
        range.start == group_start
    } else {
        range.start < group_end
    }
}

fn ranges_intersect(x: &Range<usize>, y: &Range<usize>) -> bool {
    if x.is_empty() && y.is_empty() {
        x.start == y.start
    } else if x.is_empty() {
        y.start <= x.start && x.start < y.end
    } else if y.is_empty() {
        x.start <= y.start && y.start < x.end
    } else {
        x.start < y.end && y.start < x.end
    }
}

/// Sweeps the two per-side diffs over the original's token space, grouping
/// overlapping changes into three-way regions.
fn diff3_regions(
    changes_om: &[ChangedRange],
    changes_ol: &[ChangedRange],
    original_len: usize,
    modified_classes: &[u32],
    latest_classes: &[u32],
) -> Vec<Region3> {
    let mut regions = Vec::new();
    let mut i = 0;
    let mut j = 0;
    let mut original_pos = 0;
    let mut modified_pos = 0;
    let mut latest_pos = 0;
    loop {
        let next_start = match (changes_om.get(i), changes_ol.get(j)) {
            (None, None) => original_len,
            (Some(c), None) => c.a.start,
            (None, Some(c)) => c.a.start,
            (Some(x), Some(y)) => x.a.start.min(y.a.start),
        };
        if original_pos < next_start {
            let len = next_start - original_pos;
            regions.push(Region3 {
                kind: Region3Kind::Common,
                original: original_pos..original_pos + len,
                modified: modified_pos..modified_pos + len,
                latest: latest_pos..latest_pos + len,
                resolved: None,
            });
            original_pos = next_start;
            modified_pos += len;
            latest_pos += len;
        }
        if i >= changes_om.len() && j >= changes_ol.len() {
            break;
        }
        let group_start = next_start;
        let mut group_end = next_start;
        let mut modified_extra = 0isize;
        let mut latest_extra = 0isize;
        let mut used_modified = false;
        let mut used_latest = false;
        let mut first = true;
        loop {
            let mut progressed = false;
            if let Some(c) = changes_om.get(i) {
                if joins_group(group_start, group_end, first, &c.a) {
                    group_end = group_end.max(c.a.end);
                    modified_extra += c.b.len() as isize - c.a.len() as isize;
                    used_modified = true;
                    first = false;
                    i += 1;
                    progressed = true;
                }
            }
            if let Some(c) = changes_ol.get(j) {
                if joins_group(group_start, group_end, first, &c.a) {
                    group_end = group_end.max(c.a.end);
                    latest_extra += c.b.len() as isize - c.a.len() as isize;
                    used_latest = true;
                    first = false;
                    j += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        let original_span = group_end - group_start;
        let modified_len = (original_span as isize + modified_extra) as usize;
        let latest_len = (original_span as isize + latest_extra) as usize;
        let modified = modified_pos..modified_pos + modified_len;
        let latest = latest_pos..latest_pos + latest_len;
        let kind = match (used_modified, used_latest) {
            (true, false) => Region3Kind::Modified,
            (false, true) => Region3Kind::Latest,
            (true, true) => {
                if modified_classes[modified.clone()] == latest_classes[latest.clone()] {
                    Region3Kind::Identical
                } else {
                    Region3Kind::Conflict
                }
            }
            (false, false) => unreachable!("a group always consumes at least one change"),
        };
        regions.push(Region3 {
            kind,
            original: group_start..group_end,
            modified: modified.clone(),
            latest: latest.clone(),
            resolved: None,
        });
        original_pos = group_end;
        modified_pos = modified.end;
        latest_pos = latest.end;
    }
    regions
}

fn shift_regions(regions: &mut [Region3], prefix_lines: usize) {
    for region in regions {
        region.original =
            region.original.start + prefix_lines..region.original.end + prefix_lines;
        region.modified =
            region.modified.start + prefix_lines..region.modified.end + prefix_lines;
        region.latest = region.latest.start + prefix_lines..region.latest.end + prefix_lines;
    }
}

fn assemble_diff3(
    paths: [PathBuf; 3],
    mut regions: Vec<Region3>,
    prefix_lines: usize,
) -> FileDiff3 {
    shift_regions(&mut regions, prefix_lines);
    if prefix_lines > 0 {
        regions.insert(
            0,
            Region3 {
                kind: Region3Kind::Common,
                original: 0..prefix_lines,
                modified: 0..prefix_lines,
                latest: 0..prefix_lines,
                resolved: None,
            },
        );
    }
    FileDiff3 { paths, regions }
}

/// Diffs three files: an original and two divergent descendants.
pub fn diff3_files(
    original: &Path,
    modified: &Path,
    latest: &Path,
    options: &DiffOptions,
) -> DiffResult<FileDiff3> {
    let (_, classes, prefix_lines) = prepare(&[original, modified, latest], options)?;
    let changes_om = lcs::diff(&classes[0], &classes[1]);
    let changes_ol = lcs::diff(&classes[0], &classes[2]);
    let regions = diff3_regions(
        &changes_om,
        &changes_ol,
        classes[0].len(),
        &classes[1],
        &classes[2],
    );
    Ok(assemble_diff3(
        [
            original.to_path_buf(),
            modified.to_path_buf(),
            latest.to_path_buf(),
        ],
        regions,
        prefix_lines,
    ))
}

/// Diffs four files. Like [`diff3_files`], except that a conflict whose
/// modified text matches the corresponding ancestor text is downgraded to
/// a latest-only change: the modification was inherited, not made.
pub fn diff4_files(
    original: &Path,
    modified: &Path,
    latest: &Path,
    ancestor: &Path,
    options: &DiffOptions,
) -> DiffResult<FileDiff3> {
    let (_, classes, prefix_lines) = prepare(&[original, modified, latest, ancestor], options)?;
    let changes_om = lcs::diff(&classes[0], &classes[1]);
    let changes_ol = lcs::diff(&classes[0], &classes[2]);
    let mut regions = diff3_regions(
        &changes_om,
        &changes_ol,
        classes[0].len(),
        &classes[1],
        &classes[2],
    );
    let changes_am = lcs::diff(&classes[3], &classes[1]);
    for region in &mut regions {
        if region.kind == Region3Kind::Conflict
            && !changes_am
                .iter()
                .any(|change| ranges_intersect(&change.b, &region.modified))
        {
            region.kind = Region3Kind::Latest;
        }
    }
    Ok(assemble_diff3(
        [
            original.to_path_buf(),
            modified.to_path_buf(),
            latest.to_path_buf(),
        ],
        regions,
        prefix_lines,
    ))
}
