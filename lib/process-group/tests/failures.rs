// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use common::{run_group, run_group_on, test_config, test_fabric, RankCtx};
use dynamo_process_group::loopback::{LoopbackBackend, LoopbackFabric};
use dynamo_process_group::{
    AllReduceOptions, BroadcastOptions, CommBackend, Communicator, DType, DeviceContext,
    DeviceEvent, DeviceId, DeviceStream, ErrorKind, MemoryStore, ProcessGroup, ProcessGroupConfig,
    ProcessGroupError, ProcessGroupOps, ScatterOptions, Store, Tensor, UniqueId,
};

const DEV0: DeviceId = DeviceId(0);

fn single_rank(devices: usize) -> (ProcessGroup, Arc<LoopbackBackend>) {
    let backend = Arc::new(LoopbackBackend::new(LoopbackFabric::new(), devices).unwrap());
    let pg = ProcessGroup::with_config(
        Arc::new(MemoryStore::new()),
        0,
        1,
        backend.clone(),
        test_config(),
    )
    .unwrap();
    (pg, backend)
}

fn assert_invalid<T: std::fmt::Debug>(result: Result<T, ProcessGroupError>, needle: &str) {
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument, "{err}");
    assert!(err.to_string().contains(needle), "`{err}` does not mention `{needle}`");
}

#[test]
fn test_construction_rejects_bad_rank_and_size() {
    let backend = Arc::new(LoopbackBackend::new(LoopbackFabric::new(), 1).unwrap());
    let store = Arc::new(MemoryStore::new());
    assert_invalid(ProcessGroup::new(store.clone(), 0, 0, backend.clone(), "a"), "size");
    assert_invalid(ProcessGroup::new(store.clone(), 2, 2, backend.clone(), "a"), "rank 2");

    let mut config = test_config();
    config.rendezvous_retry_ms = 5_000;
    assert_invalid(
        ProcessGroup::with_config(store, 0, 1, backend, config),
        "configuration",
    );
}

#[test]
fn test_invalid_arguments_enqueue_nothing() {
    let (pg, _backend) = single_rank(2);
    let t0 = Tensor::zeros(DeviceId(0), DType::F32, 4);
    let t1 = Tensor::zeros(DeviceId(1), DType::F32, 4);
    let opts = AllReduceOptions::default();

    assert_invalid(pg.all_reduce(&[], &opts), "empty");
    assert_invalid(pg.all_reduce(&[t0.clone(), t0.clone()], &opts), "more than one tensor");
    assert_invalid(
        pg.all_reduce(&[t0.clone(), t1.clone(), t0.clone()], &opts),
        "local devices",
    );
    assert_invalid(
        pg.all_reduce(&[Tensor::zeros(DeviceId(5), DType::F32, 1)], &opts),
        "dev:5",
    );
    assert_invalid(
        pg.broadcast(&[t0.clone()], &BroadcastOptions { source_rank: 1 }),
        "source rank 1",
    );
    assert_invalid(pg.all_gather(&[t0.clone()], &[t1.clone()]), "paired with");
    assert_invalid(
        pg.all_gather(&[t0.clone()], &[Tensor::zeros(DeviceId(0), DType::I32, 4)]),
        "output is",
    );
    assert_invalid(
        pg.all_gather(&[t0.clone()], &[Tensor::zeros(DeviceId(0), DType::F32, 3)]),
        "expected 4",
    );
    assert_invalid(
        pg.scatter(&[t0.clone()], &[t0.clone()], &ScatterOptions { root_rank: 3 }),
        "root rank 3",
    );
    assert_invalid(pg.send(&[t0.clone(), t1.clone()], 0), "exactly one tensor");
    assert_invalid(pg.send(&[t0.clone()], 4), "peer rank 4");
    assert_invalid(pg.recv(&[t0.clone()], 0), "this rank");

    assert_eq!(pg.communicator_sets(), 0);
    assert!(pg.used_devices().is_empty());
}

#[test]
fn test_all_to_all_requires_divisible_inputs() {
    run_group(2, 1, |ctx| {
        let input = Tensor::zeros(DEV0, DType::F32, 5);
        let output = Tensor::zeros(DEV0, DType::F32, 5);
        assert_invalid(ctx.pg.all_to_all(&[input], &[output]), "cannot be split");
    });
}

#[test]
fn test_rendezvous_times_out_without_root() {
    let backend = Arc::new(LoopbackBackend::new(LoopbackFabric::new(), 1).unwrap());
    let mut config = test_config();
    config.rendezvous_timeout_ms = 50;

    // rank 0 never shows up to publish the ids
    let pg = ProcessGroup::with_config(Arc::new(MemoryStore::new()), 1, 2, backend, config)
        .unwrap();
    let t = Tensor::zeros(DEV0, DType::F32, 1);
    let err = pg
        .all_reduce(&[t], &AllReduceOptions::default())
        .unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(err.kind(), ErrorKind::Setup);
    match err {
        ProcessGroupError::RendezvousTimeout { key, elapsed } => {
            assert_eq!(key, "pg/0/rank:0");
            assert!(elapsed >= Duration::from_millis(50));
        }
        other => panic!("expected a rendezvous timeout, got {other:?}"),
    }
}

#[test]
fn test_groups_sharing_a_store_need_distinct_ids() {
    let fabric = test_fabric();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let config_for = |group_id: &str| ProcessGroupConfig {
        group_id: group_id.to_string(),
        ..test_config()
    };
    let all_reduce = |ctx: RankCtx| {
        let t = Tensor::from_vec(DEV0, vec![2.0f32]);
        ctx.pg
            .all_reduce(&[t.clone()], &AllReduceOptions::default())?
            .synchronize()?;
        Ok::<_, ProcessGroupError>(t.to_vec::<f32>().unwrap())
    };

    for group_id in ["a", "b"] {
        let results = run_group_on(&fabric, 2, 1, config_for(group_id), store.clone(), all_reduce);
        for result in results {
            assert_eq!(result.unwrap(), vec![4.0]);
        }
    }
    assert_eq!(fabric.clique_count(), 2);

    // a second group named "a" finds the first group's ids already published
    let results = run_group_on(&fabric, 2, 1, config_for("a"), store, all_reduce);
    for result in &results {
        let err = result.as_ref().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Setup, "{err}");
    }
    let root_err = results[0].as_ref().unwrap_err().to_string();
    assert!(root_err.contains("already published"), "{root_err}");
}

#[test]
fn test_failed_compute_work_surfaces_as_backend_error() {
    let (pg, backend) = single_rank(1);
    backend
        .compute_stream(DEV0)
        .unwrap()
        .launch(|| Err(anyhow!("kernel fault")))
        .unwrap();

    let t = Tensor::zeros(DEV0, DType::F32, 2);
    let task = pg.all_reduce(&[t], &AllReduceOptions::default()).unwrap();
    let err = task.wait(Duration::from_secs(10)).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Backend);
    assert!(err.is_fatal());
    assert!(err.to_string().contains("all_reduce"));
    assert!(err.to_string().contains("kernel fault"));
}

/// Forwards to a loopback backend and counts communicator joins.
struct CountingBackend {
    inner: LoopbackBackend,
    inits: AtomicUsize,
    groups: AtomicUsize,
}

impl CommBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "COUNTING"
    }

    fn device_count(&self) -> usize {
        self.inner.device_count()
    }

    fn create_unique_id(&self) -> Result<UniqueId> {
        self.inner.create_unique_id()
    }

    fn init_communicator(
        &self,
        device: DeviceId,
        id: &UniqueId,
        nranks: usize,
        rank: usize,
    ) -> Result<Arc<dyn Communicator>> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.inner.init_communicator(device, id, nranks, rank)
    }

    fn create_context(&self, device: DeviceId) -> Result<Arc<dyn DeviceContext>> {
        self.inner.create_context(device)
    }

    fn default_stream(&self, device: DeviceId) -> Result<Arc<dyn DeviceStream>> {
        self.inner.default_stream(device)
    }

    fn create_event(&self, device: DeviceId) -> Result<Arc<dyn DeviceEvent>> {
        self.inner.create_event(device)
    }

    fn synchronize_device(&self, device: DeviceId) -> Result<()> {
        self.inner.synchronize_device(device)
    }

    fn group_start(&self) -> Result<()> {
        self.groups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_communicators_are_created_once_per_device_set() {
    let fabric = LoopbackFabric::new();
    let store = Arc::new(MemoryStore::new());

    let counts: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let (fabric, store) = (fabric.clone(), store.clone());
                scope.spawn(move || {
                    let backend = Arc::new(CountingBackend {
                        inner: LoopbackBackend::new(fabric, 2).unwrap(),
                        inits: AtomicUsize::new(0),
                        groups: AtomicUsize::new(0),
                    });
                    let pg =
                        ProcessGroup::with_config(store, rank, 2, backend.clone(), test_config())
                            .unwrap();
                    assert_eq!(pg.backend_name(), "COUNTING");

                    let single = Tensor::from_vec(DEV0, vec![1.0f32]);
                    for _ in 0..3 {
                        pg.all_reduce(&[single.clone()], &AllReduceOptions::default())
                            .unwrap()
                            .synchronize()
                            .unwrap();
                    }
                    assert_eq!(backend.inits.load(Ordering::SeqCst), 1);
                    assert_eq!(pg.communicator_sets(), 1);

                    let pair = [
                        Tensor::from_vec(DeviceId(0), vec![1.0f32]),
                        Tensor::from_vec(DeviceId(1), vec![1.0f32]),
                    ];
                    pg.all_reduce(&pair, &AllReduceOptions::default())
                        .unwrap()
                        .synchronize()
                        .unwrap();
                    assert_eq!(pg.communicator_sets(), 2);
                    assert_eq!(single.to_vec::<f32>().unwrap(), vec![8.0]);

                    (
                        backend.inits.load(Ordering::SeqCst),
                        backend.groups.load(Ordering::SeqCst),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // one join for {dev0}, two for {dev0, dev1}; each set creation and each
    // of the four dispatches opens one group
    for (inits, groups) in counts {
        assert_eq!(inits, 3);
        assert_eq!(groups, 2 + 4);
    }
    assert_eq!(fabric.clique_count(), 3);
}

/// Joins every communicator on device 0 whatever device was asked for.
struct MisplacedBackend(LoopbackBackend);

impl CommBackend for MisplacedBackend {
    fn name(&self) -> &'static str {
        "MISPLACED"
    }

    fn device_count(&self) -> usize {
        self.0.device_count()
    }

    fn create_unique_id(&self) -> Result<UniqueId> {
        self.0.create_unique_id()
    }

    fn init_communicator(
        &self,
        _device: DeviceId,
        id: &UniqueId,
        nranks: usize,
        rank: usize,
    ) -> Result<Arc<dyn Communicator>> {
        self.0.init_communicator(DEV0, id, nranks, rank)
    }

    fn create_context(&self, device: DeviceId) -> Result<Arc<dyn DeviceContext>> {
        self.0.create_context(device)
    }

    fn default_stream(&self, device: DeviceId) -> Result<Arc<dyn DeviceStream>> {
        self.0.default_stream(device)
    }

    fn create_event(&self, device: DeviceId) -> Result<Arc<dyn DeviceEvent>> {
        self.0.create_event(device)
    }

    fn synchronize_device(&self, device: DeviceId) -> Result<()> {
        self.0.synchronize_device(device)
    }
}

#[test]
fn test_communicator_on_wrong_device_is_setup_error() {
    let backend = Arc::new(MisplacedBackend(
        LoopbackBackend::new(LoopbackFabric::new(), 2).unwrap(),
    ));
    let pg = ProcessGroup::with_config(Arc::new(MemoryStore::new()), 0, 1, backend, test_config())
        .unwrap();

    let t = Tensor::zeros(DeviceId(1), DType::F32, 2);
    let err = pg
        .all_reduce(&[t], &AllReduceOptions::default())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Setup, "{err}");
    assert!(err.is_fatal());
    assert!(format!("{err:#}").contains("expected rank 0 of 1 on dev:1"), "{err:#}");
    assert_eq!(pg.communicator_sets(), 0);
}
