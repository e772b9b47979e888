// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Helpers for running every rank of a loopback group on its own thread.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dynamo_process_group::loopback::{LoopbackBackend, LoopbackFabric};
use dynamo_process_group::{
    CommBackend, FailurePolicy, MemoryStore, ProcessGroup, ProcessGroupConfig, Store,
};

/// Configuration that returns fatal errors instead of aborting the test
/// binary, with timeouts short enough for a hung test to fail quickly.
pub fn test_config() -> ProcessGroupConfig {
    ProcessGroupConfig {
        failure_policy: FailurePolicy::Propagate,
        rendezvous_timeout_ms: 10_000,
        rendezvous_retry_ms: 1,
        rendezvous_max_retry_ms: 20,
        wait_timeout_ms: 10_000,
        wait_poll_interval_us: 50,
        ..ProcessGroupConfig::default()
    }
}

/// One rank's handles.
pub struct RankCtx {
    pub rank: usize,
    pub pg: ProcessGroup,
    pub backend: Arc<LoopbackBackend>,
}

/// Run `body` on `size` rank threads sharing one fabric and one store and
/// return each rank's result in rank order.
pub fn run_group<T, F>(size: usize, devices: usize, body: F) -> Vec<T>
where
    T: Send,
    F: Fn(RankCtx) -> T + Sync,
{
    run_group_with(size, devices, test_config(), Arc::new(MemoryStore::new()), body)
}

pub fn run_group_with<T, F>(
    size: usize,
    devices: usize,
    config: ProcessGroupConfig,
    store: Arc<dyn Store>,
    body: F,
) -> Vec<T>
where
    T: Send,
    F: Fn(RankCtx) -> T + Sync,
{
    run_group_on(&test_fabric(), size, devices, config, store, body)
}

pub fn test_fabric() -> LoopbackFabric {
    LoopbackFabric::with_timeout(Duration::from_secs(10))
}

/// Like [`run_group_with`], on a caller-provided fabric so that several
/// groups can share it.
pub fn run_group_on<T, F>(
    fabric: &LoopbackFabric,
    size: usize,
    devices: usize,
    config: ProcessGroupConfig,
    store: Arc<dyn Store>,
    body: F,
) -> Vec<T>
where
    T: Send,
    F: Fn(RankCtx) -> T + Sync,
{
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let (fabric, store, config, body) =
                    (fabric.clone(), Arc::clone(&store), config.clone(), &body);
                scope.spawn(move || {
                    let backend = Arc::new(LoopbackBackend::new(fabric, devices).unwrap());
                    let dyn_backend: Arc<dyn CommBackend> = backend.clone();
                    let pg = ProcessGroup::with_config(store, rank, size, dyn_backend, config)
                        .unwrap();
                    body(RankCtx { rank, pg, backend })
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    })
}
