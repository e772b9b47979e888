// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key-value stores used for rendezvous.
//!
//! The process group only needs write-once publish and polling reads, so the
//! [`Store`] trait is intentionally small. Two implementations are provided:
//!
//! - [`MemoryStore`]: shared between ranks living in one process
//! - [`FileStore`]: one file per key under a directory visible to every rank

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use anyhow::Result;

/// Distributed key-value store shared by every rank of a group.
pub trait Store: Send + Sync {
    /// Publish `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Read the value under `key` without blocking.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns `true` if `key` holds a value.
    fn check(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}
