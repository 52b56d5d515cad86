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

//! Three-way merge output with conflict markers.
//!
//! Non-conflicting regions merge silently; conflicts render according to
//! the selected display style, by default:
//!
//! ```text
//! <<<<<<< modified
//! their text
//! =======
//! other text
//! >>>>>>> latest
//! ```
//!
//! Marker lines use the EOL style detected in the modified file, falling
//! back to the platform EOL.

use std::io::Write;
use std::path::Path;

use super::DiffError;
use super::DiffResult;
use super::FileDiff3;
use super::Region3;
use super::Region3Kind;
use super::lines::LineCursor;
use super::lines::has_eol;

/// Context lines emitted around conflicts by
/// [`ConflictStyle::OnlyConflicts`].
const CONFLICT_CONTEXT: usize = 3;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConflictStyle {
    /// Modified and latest sides, separated by markers.
    #[default]
    ModifiedLatest,
    /// Like `ModifiedLatest`, but a caller-supplied resolution replaces the
    /// markers where one exists.
    ResolvedModifiedLatest,
    /// Modified, original, and latest sides.
    ModifiedOriginalLatest,
    /// Only the modified side, without markers.
    Modified,
    /// Only the latest side, without markers.
    Latest,
    /// Only conflicting hunks, with context and `@@` separators.
    OnlyConflicts,
}

#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    pub style: ConflictStyle,
    /// Marker labels; the file paths are used when unset.
    pub modified_label: Option<String>,
    pub original_label: Option<String>,
    pub latest_label: Option<String>,
}

/// Detects the EOL convention of a file from its first line ending.
fn detect_eol(path: &Path) -> DiffResult<&'static [u8]> {
    let mut cursor = LineCursor::open(path)?;
    if let Some(line) = cursor.next_line()? {
        if line.ends_with(b"\r\n") {
            return Ok(b"\r\n");
        }
        if line.ends_with(b"\r") {
            return Ok(b"\r");
        }
        if line.ends_with(b"\n") {
            return Ok(b"\n");
        }
    }
    Ok(if cfg!(windows) { b"\r\n" } else { b"\n" })
}

fn out_err(err: std::io::Error) -> DiffError {
    DiffError::Output(err)
}

struct MergeWriter<'a, W: Write> {
    writer: &'a mut W,
    original: LineCursor,
    modified: LineCursor,
    latest: LineCursor,
    eol: &'static [u8],
    modified_label: String,
    original_label: String,
    latest_label: String,
}

impl<W: Write> MergeWriter<'_, W> {
    fn emit(&mut self, which: Which, range: std::ops::Range<usize>) -> DiffResult<()> {
        let cursor = match which {
            Which::Original => &mut self.original,
            Which::Modified => &mut self.modified,
            Which::Latest => &mut self.latest,
        };
        cursor.skip_to(range.start)?;
        while cursor.next_index() < range.end {
            let Some(line) = cursor.next_line()? else {
                break;
            };
            self.writer.write_all(&line).map_err(out_err)?;
        }
        Ok(())
    }

    /// Like [`Self::emit`], but guarantees the output ends on a line
    /// boundary so a marker never glues onto an unterminated line.
    fn emit_section(&mut self, which: Which, range: std::ops::Range<usize>) -> DiffResult<()> {
        let cursor = match which {
            Which::Original => &mut self.original,
            Which::Modified => &mut self.modified,
            Which::Latest => &mut self.latest,
        };
        cursor.skip_to(range.start)?;
        let mut terminated = true;
        while cursor.next_index() < range.end {
            let Some(line) = cursor.next_line()? else {
                break;
            };
            terminated = has_eol(&line);
            self.writer.write_all(&line).map_err(out_err)?;
        }
        if !terminated {
            self.writer.write_all(self.eol).map_err(out_err)?;
        }
        Ok(())
    }

    fn marker(&mut self, marker: &[u8], label: Option<&str>) -> DiffResult<()> {
        self.writer.write_all(marker).map_err(out_err)?;
        if let Some(label) = label {
            self.writer.write_all(b" ").map_err(out_err)?;
            self.writer.write_all(label.as_bytes()).map_err(out_err)?;
        }
        self.writer.write_all(self.eol).map_err(out_err)?;
        Ok(())
    }

    fn emit_conflict(&mut self, region: &Region3, style: ConflictStyle) -> DiffResult<()> {
        match style {
            ConflictStyle::Modified => self.emit(Which::Modified, region.modified.clone()),
            ConflictStyle::Latest => self.emit(Which::Latest, region.latest.clone()),
            ConflictStyle::ResolvedModifiedLatest => match &region.resolved {
                Some(resolution) => {
                    self.modified.skip_to(region.modified.end)?;
                    self.writer.write_all(resolution).map_err(out_err)
                }
                // No resolution for this conflict: plain markers.
                None => self.emit_conflict(region, ConflictStyle::ModifiedLatest),
            },
            ConflictStyle::ModifiedLatest => {
                let label = self.modified_label.clone();
                self.marker(b"<<<<<<<", Some(&label))?;
                self.emit_section(Which::Modified, region.modified.clone())?;
                self.marker(b"=======", None)?;
                self.emit_section(Which::Latest, region.latest.clone())?;
                let label = self.latest_label.clone();
                self.marker(b">>>>>>>", Some(&label))
            }
            ConflictStyle::ModifiedOriginalLatest | ConflictStyle::OnlyConflicts => {
                let label = self.modified_label.clone();
                self.marker(b"<<<<<<<", Some(&label))?;
                self.emit_section(Which::Modified, region.modified.clone())?;
                let label = self.original_label.clone();
                self.marker(b"|||||||", Some(&label))?;
                self.emit_section(Which::Original, region.original.clone())?;
                self.marker(b"=======", None)?;
                self.emit_section(Which::Latest, region.latest.clone())?;
                let label = self.latest_label.clone();
                self.marker(b">>>>>>>", Some(&label))
            }
        }
    }

    fn drain_modified(&mut self) -> DiffResult<()> {
        while let Some(line) = self.modified.next_line()? {
            self.writer.write_all(&line).map_err(out_err)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Which {
    Original,
    Modified,
    Latest,
}

/// Writes the merge of a three-way diff.
pub fn write_merged<W: Write>(
    writer: &mut W,
    diff: &FileDiff3,
    options: &MergeOptions,
) -> DiffResult<()> {
    let eol = detect_eol(&diff.paths[1])?;
    let mut merge = MergeWriter {
        writer,
        original: LineCursor::open(&diff.paths[0])?,
        modified: LineCursor::open(&diff.paths[1])?,
        latest: LineCursor::open(&diff.paths[2])?,
        eol,
        modified_label: options
            .modified_label
            .clone()
            .unwrap_or_else(|| diff.paths[1].display().to_string()),
        original_label: options
            .original_label
            .clone()
            .unwrap_or_else(|| diff.paths[0].display().to_string()),
        latest_label: options
            .latest_label
            .clone()
            .unwrap_or_else(|| diff.paths[2].display().to_string()),
    };
    if options.style == ConflictStyle::OnlyConflicts {
        return write_only_conflicts(&mut merge, diff);
    }
    for region in &diff.regions {
        match region.kind {
            Region3Kind::Common | Region3Kind::Identical | Region3Kind::Modified => {
                merge.emit(Which::Modified, region.modified.clone())?;
            }
            Region3Kind::Latest => {
                merge.emit(Which::Latest, region.latest.clone())?;
                merge.modified.skip_to(region.modified.end)?;
            }
            Region3Kind::Conflict => {
                merge.emit_conflict(region, options.style)?;
                merge.modified.skip_to(region.modified.end)?;
            }
        }
    }
    merge.drain_modified()
}

fn write_only_conflicts<W: Write>(
    merge: &mut MergeWriter<'_, W>,
    diff: &FileDiff3,
) -> DiffResult<()> {
    let mut emitted_to = 0;
    for region in &diff.regions {
        if region.kind != Region3Kind::Conflict {
            continue;
        }
        let context_start = region
            .modified
            .start
            .saturating_sub(CONFLICT_CONTEXT)
            .max(emitted_to);
        if context_start > emitted_to {
            merge.writer.write_all(b"@@").map_err(out_err)?;
            merge.writer.write_all(merge.eol).map_err(out_err)?;
        }
        merge.emit(Which::Modified, context_start..region.modified.start)?;
        merge.emit_conflict(region, ConflictStyle::OnlyConflicts)?;
        merge.modified.skip_to(region.modified.end)?;
        for _ in 0..CONFLICT_CONTEXT {
            let Some(line) = merge.modified.next_line()? else {
                break;
            };
            merge.writer.write_all(&line).map_err(out_err)?;
        }
        emitted_to = merge.modified.next_index();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::super::DiffOptions;
    use super::super::diff3_files;
    use super::*;
    use crate::tests::new_temp_dir;

    fn merged_with(
        original: &str,
        modified: &str,
        latest: &str,
        options: &MergeOptions,
    ) -> String {
        let temp_dir = new_temp_dir();
        let write = |name: &str, contents: &str| -> PathBuf {
            let path = temp_dir.path().join(name);
            fs::write(&path, contents).unwrap();
            path
        };
        let original = write("original", original);
        let modified = write("modified", modified);
        let latest = write("latest", latest);
        let diff = diff3_files(&original, &modified, &latest, &DiffOptions::default()).unwrap();
        let mut out = Vec::new();
        let options = MergeOptions {
            modified_label: Some("mine".to_string()),
            original_label: Some("older".to_string()),
            latest_label: Some("theirs".to_string()),
            ..options.clone()
        };
        write_merged(&mut out, &diff, &options).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn merged(original: &str, modified: &str, latest: &str) -> String {
        merged_with(original, modified, latest, &MergeOptions::default())
    }

    #[test]
    fn non_overlapping_changes_merge_cleanly() {
        let out = merged(
            "a\nb\nc\nd\ne\n",
            "A\nb\nc\nd\ne\n",
            "a\nb\nc\nd\nE\n",
        );
        assert_eq!(out, "A\nb\nc\nd\nE\n");
    }

    #[test]
    fn unchanged_modified_yields_latest() {
        let original = "x\ny\nz\n";
        let latest = "x\nnew\nz\nmore\n";
        assert_eq!(merged(original, original, latest), latest);
    }

    #[test]
    fn unchanged_latest_yields_modified() {
        let original = "x\ny\nz\n";
        let modified = "renamed\ny\nz\n";
        assert_eq!(merged(original, modified, original), modified);
    }

    #[test]
    fn conflict_uses_default_markers() {
        let out = merged("x\n", "y\n", "z\n");
        assert_eq!(
            out,
            indoc! {"
                <<<<<<< mine
                y
                =======
                z
                >>>>>>> theirs
            "}
        );
    }

    #[test]
    fn conflict_markers_include_original_when_requested() {
        let options = MergeOptions {
            style: ConflictStyle::ModifiedOriginalLatest,
            ..MergeOptions::default()
        };
        let out = merged_with("x\n", "y\n", "z\n", &options);
        assert_eq!(
            out,
            indoc! {"
                <<<<<<< mine
                y
                ||||||| older
                x
                =======
                z
                >>>>>>> theirs
            "}
        );
    }

    #[test_case(ConflictStyle::Modified, "head\ny\ntail\n"; "modified side")]
    #[test_case(ConflictStyle::Latest, "head\nz\ntail\n"; "latest side")]
    fn single_side_styles(style: ConflictStyle, expected: &str) {
        let options = MergeOptions {
            style,
            ..MergeOptions::default()
        };
        let out = merged_with(
            "head\nx\ntail\n",
            "head\ny\ntail\n",
            "head\nz\ntail\n",
            &options,
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn resolved_style_falls_back_without_resolution() {
        let options = MergeOptions {
            style: ConflictStyle::ResolvedModifiedLatest,
            ..MergeOptions::default()
        };
        let out = merged_with("x\n", "y\n", "z\n", &options);
        assert!(out.contains("<<<<<<< mine"), "{out}");
    }

    #[test]
    fn resolved_style_uses_supplied_resolution() {
        let temp_dir = new_temp_dir();
        let write = |name: &str, contents: &str| -> PathBuf {
            let path = temp_dir.path().join(name);
            fs::write(&path, contents).unwrap();
            path
        };
        let original = write("original", "x\n");
        let modified = write("modified", "y\n");
        let latest = write("latest", "z\n");
        let mut diff =
            diff3_files(&original, &modified, &latest, &DiffOptions::default()).unwrap();
        for region in &mut diff.regions {
            if region.kind == Region3Kind::Conflict {
                region.resolved = Some(b"resolved\n".to_vec());
            }
        }
        let options = MergeOptions {
            style: ConflictStyle::ResolvedModifiedLatest,
            ..MergeOptions::default()
        };
        let mut out = Vec::new();
        write_merged(&mut out, &diff, &options).unwrap();
        assert_eq!(out, b"resolved\n");
    }

    #[test]
    fn marker_eol_matches_modified_file() {
        let out = merged("x\r\n", "y\r\n", "z\r\n");
        assert!(out.starts_with("<<<<<<< mine\r\n"), "{out:?}");
        assert!(out.contains("=======\r\n"), "{out:?}");
    }

    #[test]
    fn only_conflicts_elides_clean_regions() {
        let mut original = String::new();
        for i in 0..30 {
            original.push_str(&format!("line {i}\n"));
        }
        let modified = original.replace("line 15\n", "mine 15\n");
        let latest = original.replace("line 15\n", "theirs 15\n");
        let options = MergeOptions {
            style: ConflictStyle::OnlyConflicts,
            ..MergeOptions::default()
        };
        let out = merged_with(&original, &modified, &latest, &options);
        assert!(out.starts_with("@@\n"), "{out}");
        assert!(out.contains("line 12\nline 13\nline 14\n<<<<<<< mine\n"), "{out}");
        assert!(out.contains(">>>>>>> theirs\nline 16\nline 17\nline 18\n"), "{out}");
        assert!(!out.contains("line 0\n"), "{out}");
        assert!(!out.contains("line 25\n"), "{out}");
    }
}
