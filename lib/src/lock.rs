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

//! Advisory file-based locking used to serialize writers.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("Failed to lock {path}")]
pub struct FileLockError {
    pub path: PathBuf,
    #[source]
    pub err: io::Error,
}

/// An exclusive advisory lock backed by a lock file next to the data it
/// protects. The lock blocks until it can be acquired and is released when
/// dropped.
pub struct FileLock {
    path: PathBuf,
    _file: File,
}

impl FileLock {
    pub fn lock(path: PathBuf) -> Result<Self, FileLockError> {
        let mut options = OpenOptions::new();
        options.create_new(true);
        options.write(true);
        let mut backoff = Duration::from_millis(1);
        loop {
            match options.open(&path) {
                Ok(file) => {
                    return Ok(Self { path, _file: file });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(100));
                }
                Err(err) => {
                    return Err(FileLockError { path, err });
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(?err, path = ?self.path, "failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::new_temp_dir;

    #[test]
    fn lock_is_released_on_drop() {
        let temp_dir = new_temp_dir();
        let lock_path = temp_dir.path().join("test.lock");
        {
            let _lock = FileLock::lock(lock_path.clone()).unwrap();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
        // Reacquirable after release.
        let _lock = FileLock::lock(lock_path.clone()).unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn lock_blocks_second_locker() {
        let temp_dir = new_temp_dir();
        let lock_path = temp_dir.path().join("test.lock");
        let lock = FileLock::lock(lock_path.clone()).unwrap();
        let thread = std::thread::spawn({
            let lock_path = lock_path.clone();
            move || {
                let _lock = FileLock::lock(lock_path).unwrap();
            }
        });
        std::thread::sleep(Duration::from_millis(10));
        assert!(!thread.is_finished());
        drop(lock);
        thread.join().unwrap();
    }
}
