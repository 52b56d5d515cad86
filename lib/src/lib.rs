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

//! Stratum: a versioned, filesystem-backed object store.
//!
//! A store is an append-only sequence of immutable revisions, each a
//! complete directory tree with content-addressed file data held as chains
//! of binary deltas. Readers run in parallel against published revision
//! files; writers stage everything in a per-transaction directory and
//! publish with a single rename, serialized behind a file lock.
//!
//! The crate also carries a reusable line-oriented diff engine with
//! unified and three-way merge output, used by higher layers to compare
//! and merge the text files the store holds.

pub mod changes;
pub mod commit;
pub mod diff;
pub mod dir_store;
pub mod file_util;
pub mod hash_dump;
pub mod id;
pub mod keys;
pub mod layout;
pub mod lock;
pub mod noderev;
pub mod rep_read;
mod rep_write;
pub mod store;
pub mod svndiff;
pub mod txn;
