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

//! Sequential line access for the diff output writers, using the same
//! line-ending rule as the tokenizer: a line ends at `\n` or at a `\r` not
//! followed by `\n`.

use std::fs::File;
use std::io::BufRead as _;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;

use bstr::BString;

use super::DiffResult;
use crate::file_util::IoResultExt as _;

pub(crate) struct LineCursor {
    reader: BufReader<File>,
    path: PathBuf,
    next_index: usize,
}

impl LineCursor {
    pub fn open(path: &Path) -> DiffResult<Self> {
        let file = File::open(path).context(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            next_index: 0,
        })
    }

    /// Index of the line the next [`Self::next_line`] call returns.
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// The next raw line including its terminator, or `None` at end of
    /// file.
    pub fn next_line(&mut self) -> DiffResult<Option<BString>> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let buf = self.reader.fill_buf().context(&self.path)?;
            let Some(&byte) = buf.first() else {
                break;
            };
            if line.last() == Some(&b'\r') && byte != b'\n' {
                break;
            }
            line.push(byte);
            self.reader.consume(1);
            if byte == b'\n' {
                break;
            }
        }
        if line.is_empty() {
            Ok(None)
        } else {
            self.next_index += 1;
            Ok(Some(line.into()))
        }
    }

    /// Consumes lines until the cursor sits at `index`.
    pub fn skip_to(&mut self, index: usize) -> DiffResult<()> {
        while self.next_index < index {
            if self.next_line()?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

/// Whether a raw line carries a terminator. The only line that can lack
/// one is the last line of a file.
pub(crate) fn has_eol(line: &[u8]) -> bool {
    matches!(line.last(), Some(b'\n') | Some(b'\r'))
}
