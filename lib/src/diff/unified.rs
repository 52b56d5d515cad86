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

//! Unified (two-way) diff output.
//!
//! ```text
//! --- original\tSat Mar  1 10:00:00 2025
//! +++ modified\tSat Mar  1 10:05:00 2025
//! @@ -1,3 +1,3 @@
//!  a
//! -b
//! +B
//!  c
//! ```
//!
//! Identical inputs produce no output at all. A changed final line without
//! a terminator is followed by the `\ No newline at end of file` note.

use std::io::Write;
use std::time::SystemTime;

use bstr::BString;
use chrono::DateTime;
use chrono::Local;

use super::DiffError;
use super::DiffHunk;
use super::DiffOptions;
use super::DiffResult;
use super::FileDiff;
use super::HunkKind;
use super::lines::LineCursor;
use super::lines::has_eol;

/// Lines of leading and trailing context around each hunk.
const CONTEXT: usize = 3;

/// Longest c-function annotation carried on a hunk header.
const FUNCTION_LEN: usize = 40;

fn out_err(err: std::io::Error) -> DiffError {
    DiffError::Output(err)
}

fn format_mtime(mtime: Option<SystemTime>) -> String {
    match mtime {
        Some(mtime) => DateTime::<Local>::from(mtime)
            .format("%a %b %e %H:%M:%S %Y")
            .to_string(),
        None => String::new(),
    }
}

fn is_function_line(line: &[u8]) -> bool {
    matches!(line.first(), Some(b) if b.is_ascii_alphanumeric() || *b == b'_' || *b == b'$')
}

/// The original-side cursor, additionally remembering the most recent
/// function-looking line for `-p` style hunk annotations.
struct OriginalReader {
    cursor: LineCursor,
    track_functions: bool,
    last_function: Option<BString>,
}

impl OriginalReader {
    fn next_line(&mut self) -> DiffResult<Option<BString>> {
        let line = self.cursor.next_line()?;
        if self.track_functions {
            if let Some(line) = &line {
                if is_function_line(line) {
                    self.last_function = Some(line.clone());
                }
            }
        }
        Ok(line)
    }

    fn next_index(&self) -> usize {
        self.cursor.next_index()
    }
}

fn push_line(body: &mut Vec<u8>, prefix: u8, line: &[u8]) {
    body.push(prefix);
    body.extend_from_slice(line);
    if !has_eol(line) {
        body.extend_from_slice(b"\n\\ No newline at end of file\n");
    }
}

fn format_range(start: usize, len: usize) -> String {
    // A one-line range omits its length; an empty range names the line
    // before the position.
    let display_start = if len == 0 { start } else { start + 1 };
    if len == 1 {
        format!("{display_start}")
    } else {
        format!("{display_start},{len}")
    }
}

/// Writes the diff in unified format. `labels` overrides the file names
/// shown in the `---`/`+++` header lines.
pub fn write_unified<W: Write>(
    writer: &mut W,
    diff: &FileDiff,
    options: &DiffOptions,
    labels: Option<(&str, &str)>,
) -> DiffResult<()> {
    let different: Vec<&DiffHunk> = diff
        .hunks
        .iter()
        .filter(|hunk| hunk.kind == HunkKind::Different)
        .collect();
    if different.is_empty() {
        return Ok(());
    }

    let (original_label, modified_label) = match labels {
        Some((original, modified)) => (original.to_string(), modified.to_string()),
        None => (
            diff.paths[0].display().to_string(),
            diff.paths[1].display().to_string(),
        ),
    };
    writeln!(
        writer,
        "--- {original_label}\t{}",
        format_mtime(diff.mtimes[0])
    )
    .map_err(out_err)?;
    writeln!(
        writer,
        "+++ {modified_label}\t{}",
        format_mtime(diff.mtimes[1])
    )
    .map_err(out_err)?;

    let mut groups: Vec<Vec<&DiffHunk>> = Vec::new();
    for hunk in different {
        match groups.last_mut() {
            Some(group)
                if hunk.original.start - group.last().unwrap().original.end <= 2 * CONTEXT =>
            {
                group.push(hunk);
            }
            _ => groups.push(vec![hunk]),
        }
    }

    let mut original = OriginalReader {
        cursor: LineCursor::open(&diff.paths[0])?,
        track_functions: options.show_c_function,
        last_function: None,
    };
    let mut modified = LineCursor::open(&diff.paths[1])?;

    for group in groups {
        let first = group[0];
        let display_start = first.original.start.saturating_sub(CONTEXT);
        while original.next_index() < display_start {
            if original.next_line()?.is_none() {
                break;
            }
        }
        let group_function = original.last_function.clone();

        let mut body = Vec::new();
        let mut original_count = 0;
        let mut modified_count = 0;
        for _ in display_start..first.original.start {
            let Some(line) = original.next_line()? else {
                break;
            };
            push_line(&mut body, b' ', &line);
            original_count += 1;
            modified_count += 1;
        }
        modified.skip_to(first.modified.start)?;
        for (i, hunk) in group.iter().enumerate() {
            if i > 0 {
                while original.next_index() < hunk.original.start {
                    let Some(line) = original.next_line()? else {
                        break;
                    };
                    push_line(&mut body, b' ', &line);
                    original_count += 1;
                    modified_count += 1;
                }
                modified.skip_to(hunk.modified.start)?;
            }
            while original.next_index() < hunk.original.end {
                let Some(line) = original.next_line()? else {
                    break;
                };
                push_line(&mut body, b'-', &line);
                original_count += 1;
            }
            while modified.next_index() < hunk.modified.end {
                let Some(line) = modified.next_line()? else {
                    break;
                };
                push_line(&mut body, b'+', &line);
                modified_count += 1;
            }
        }
        for _ in 0..CONTEXT {
            let Some(line) = original.next_line()? else {
                break;
            };
            push_line(&mut body, b' ', &line);
            original_count += 1;
            modified_count += 1;
        }

        let leading_context = first.original.start - display_start;
        let modified_display_start = first.modified.start - leading_context;
        write!(
            writer,
            "@@ -{} +{} @@",
            format_range(display_start, original_count),
            format_range(modified_display_start, modified_count)
        )
        .map_err(out_err)?;
        if options.show_c_function {
            if let Some(function) = &group_function {
                let mut annotation = function.to_vec();
                while has_eol(&annotation) {
                    annotation.pop();
                }
                annotation.truncate(FUNCTION_LEN);
                writer.write_all(b" ").map_err(out_err)?;
                writer.write_all(&annotation).map_err(out_err)?;
            }
        }
        writer.write_all(b"\n").map_err(out_err)?;
        writer.write_all(&body).map_err(out_err)?;
    }
    Ok(())
}
