// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Unique-id exchange through the rendezvous store.
//!
//! The root of an exchange generates the ids and publishes them once under
//! `"<group-id>/<seq>/rank:<root>"`. Every other rank polls the same key
//! with exponential backoff. Ranks must call [`RendezvousExchange::exchange`]
//! in the same order so that their sequence numbers, and therefore keys,
//! agree.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{CommBackend, UniqueId};
use crate::config::ProcessGroupConfig;
use crate::error::{ProcessGroupError, Result};
use crate::store::Store;

/// Store key for the `seq`-th exchange rooted at `root`.
pub fn rendezvous_key(group_id: &str, seq: u64, root: usize) -> String {
    format!("{group_id}/{seq}/rank:{root}")
}

#[derive(Debug, Serialize, Deserialize)]
struct RendezvousPayload {
    ids: Vec<UniqueId>,
}

pub struct RendezvousExchange {
    store: Arc<dyn Store>,
    backend: Arc<dyn CommBackend>,
    rank: usize,
    group_id: String,
    timeout: Duration,
    retry: Duration,
    max_retry: Duration,
    next_seq: AtomicU64,
}

impl RendezvousExchange {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn CommBackend>,
        rank: usize,
        config: &ProcessGroupConfig,
    ) -> Self {
        Self {
            store,
            backend,
            rank,
            group_id: config.group_id.clone(),
            timeout: config.rendezvous_timeout(),
            retry: config.rendezvous_retry(),
            max_retry: config.rendezvous_max_retry(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Share `count` unique ids generated by `root` with every rank.
    pub fn exchange(&self, root: usize, count: usize) -> Result<Vec<UniqueId>> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let key = rendezvous_key(&self.group_id, seq, root);

        if self.rank == root {
            self.publish(&key, count)
        } else {
            self.poll(&key, count)
        }
    }

    fn publish(&self, key: &str, count: usize) -> Result<Vec<UniqueId>> {
        let taken = self
            .store
            .check(key)
            .context("failed to check rendezvous key")
            .map_err(|source| setup(key, source))?;
        if taken {
            return Err(setup(
                key,
                anyhow!("key is already published; groups sharing a store need distinct group ids"),
            ));
        }

        let ids = (0..count)
            .map(|_| self.backend.create_unique_id())
            .collect::<anyhow::Result<Vec<_>>>()
            .context("failed to generate unique ids")
            .map_err(|source| setup(key, source))?;

        let payload = RendezvousPayload { ids };
        let bytes = serde_json::to_vec(&payload).map_err(|e| setup(key, e.into()))?;
        self.store
            .set(key, &bytes)
            .context("failed to publish unique ids")
            .map_err(|source| setup(key, source))?;

        debug!(key, count, "published unique ids");
        Ok(payload.ids)
    }

    fn poll(&self, key: &str, count: usize) -> Result<Vec<UniqueId>> {
        let start = Instant::now();
        let mut interval = self.retry;
        let mut warned = false;

        loop {
            let value = self
                .store
                .get(key)
                .context("failed to read unique ids")
                .map_err(|source| setup(key, source))?;

            if let Some(bytes) = value {
                let payload: RendezvousPayload = serde_json::from_slice(&bytes)
                    .context("malformed rendezvous payload")
                    .map_err(|source| setup(key, source))?;
                if payload.ids.len() != count {
                    return Err(setup(
                        key,
                        anyhow!("expected {count} unique ids, found {}", payload.ids.len()),
                    ));
                }
                debug!(key, count, elapsed = ?start.elapsed(), "received unique ids");
                return Ok(payload.ids);
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(ProcessGroupError::RendezvousTimeout {
                    key: key.to_string(),
                    elapsed,
                });
            }
            if !warned && interval >= self.max_retry {
                warn!(key, rank = self.rank, elapsed = ?elapsed, "still waiting for unique ids");
                warned = true;
            }

            std::thread::sleep(interval.min(self.timeout - elapsed));
            interval = (interval * 2).min(self.max_retry);
        }
    }
}

fn setup(key: &str, source: anyhow::Error) -> ProcessGroupError {
    ProcessGroupError::Setup {
        key: key.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::loopback::{LoopbackBackend, LoopbackFabric};
    use crate::store::MemoryStore;
    use std::thread;

    fn exchange_for(store: &MemoryStore, rank: usize, timeout_ms: u64) -> RendezvousExchange {
        let backend = Arc::new(LoopbackBackend::new(LoopbackFabric::new(), 1).unwrap());
        let config = ProcessGroupConfig {
            rendezvous_timeout_ms: timeout_ms,
            rendezvous_retry_ms: 1,
            rendezvous_max_retry_ms: 4,
            ..Default::default()
        };
        RendezvousExchange::new(Arc::new(store.clone()), backend, rank, &config)
    }

    #[test]
    fn test_key_format() {
        assert_eq!(rendezvous_key("pg", 3, 0), "pg/3/rank:0");
    }

    #[test]
    fn test_root_ids_reach_every_rank() {
        let store = MemoryStore::new();
        let readers: Vec<_> = (1..4)
            .map(|rank| {
                let ex = exchange_for(&store, rank, 5_000);
                thread::spawn(move || ex.exchange(0, 2).unwrap())
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        let root_ids = exchange_for(&store, 0, 5_000).exchange(0, 2).unwrap();
        assert_eq!(root_ids.len(), 2);
        assert_ne!(root_ids[0], root_ids[1]);

        for reader in readers {
            assert_eq!(reader.join().unwrap(), root_ids);
        }
        assert!(store.check("pg/0/rank:0").unwrap());
    }

    #[test]
    fn test_sequence_numbers_advance() {
        let store = MemoryStore::new();
        let root = exchange_for(&store, 0, 100);
        root.exchange(0, 1).unwrap();
        root.exchange(0, 1).unwrap();
        assert!(store.check("pg/0/rank:0").unwrap());
        assert!(store.check("pg/1/rank:0").unwrap());
    }

    #[test]
    fn test_timeout_when_root_never_publishes() {
        let store = MemoryStore::new();
        let err = exchange_for(&store, 1, 30).exchange(0, 1).unwrap_err();
        assert!(matches!(err, ProcessGroupError::RendezvousTimeout { .. }));
        assert_eq!(err.kind(), ErrorKind::Setup);
        assert!(err.to_string().contains("pg/0/rank:0"));
    }

    #[test]
    fn test_id_count_mismatch_is_setup_error() {
        let store = MemoryStore::new();
        exchange_for(&store, 0, 100).exchange(0, 1).unwrap();
        let err = exchange_for(&store, 1, 100).exchange(0, 2).unwrap_err();
        assert!(matches!(err, ProcessGroupError::Setup { .. }));
        assert!(err.to_string().contains("expected 2 unique ids"));
    }

    #[test]
    fn test_root_refuses_to_overwrite_published_ids() {
        let store = MemoryStore::new();
        let first = exchange_for(&store, 0, 100).exchange(0, 1).unwrap();

        let err = exchange_for(&store, 0, 100).exchange(0, 1).unwrap_err();
        assert!(matches!(err, ProcessGroupError::Setup { .. }));
        assert!(err.to_string().contains("already published"));

        let reader = exchange_for(&store, 1, 100).exchange(0, 1).unwrap();
        assert_eq!(reader, first);
    }

    #[test]
    fn test_malformed_payload_is_setup_error() {
        let store = MemoryStore::new();
        store.set("pg/0/rank:0", b"not json").unwrap();
        let err = exchange_for(&store, 1, 100).exchange(0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Setup);
    }
}
