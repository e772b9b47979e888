// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::debug;
use validator::Validate;

use crate::backend::CommBackend;
use crate::config::ProcessGroupConfig;
use crate::device::DeviceId;
use crate::dispatch::{Dispatcher, P2pTag};
use crate::error::{ProcessGroupError, Result};
use crate::options::{
    AllReduceOptions, BarrierOptions, BroadcastOptions, CommType, ReduceOp, ReduceOptions,
    ScatterOptions,
};
use crate::registry::CommRegistry;
use crate::rendezvous::RendezvousExchange;
use crate::store::Store;
use crate::task::{Task, TaskSettings};
use crate::tensor::{DType, Tensor};

/// Collective and point-to-point operations over a fixed group of ranks.
///
/// Every method enqueues work and returns a [`Task`] without waiting for
/// the communication to finish. Collectives must be issued in the same
/// order on every rank, with one tensor per participating local device.
pub trait ProcessGroupOps: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn backend_name(&self) -> &'static str;

    /// Reduce `tensors` in place across all ranks.
    fn all_reduce(&self, tensors: &[Tensor], opts: &AllReduceOptions) -> Result<Arc<Task>>;

    /// Copy the source rank's `tensors` into every other rank's `tensors`.
    fn broadcast(&self, tensors: &[Tensor], opts: &BroadcastOptions) -> Result<Arc<Task>>;

    /// Synchronize all ranks. Waiting on the returned task also
    /// synchronizes the participating devices.
    fn barrier(&self, opts: &BarrierOptions) -> Result<Arc<Task>>;

    fn send(&self, tensors: &[Tensor], dst_rank: usize) -> Result<Arc<Task>>;

    fn recv(&self, tensors: &[Tensor], src_rank: usize) -> Result<Arc<Task>>;

    /// `outputs[i]` receives every rank's `inputs[i]` concatenated in rank
    /// order.
    fn all_gather(&self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<Arc<Task>>;

    /// Chunk `p` of each input goes to rank `p`; chunk `p` of each output
    /// comes from rank `p`.
    fn all_to_all(&self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<Arc<Task>>;

    /// Reduce `tensors` into the root rank's `tensors`. Other ranks' tensors
    /// are left unchanged.
    fn reduce(&self, tensors: &[Tensor], opts: &ReduceOptions) -> Result<Arc<Task>>;

    /// The root sends chunk `p` of its inputs to rank `p`; every rank
    /// receives its chunk into `outputs`.
    fn scatter(
        &self,
        inputs: &[Tensor],
        outputs: &[Tensor],
        opts: &ScatterOptions,
    ) -> Result<Arc<Task>>;
}

pub struct ProcessGroup {
    rank: usize,
    size: usize,
    config: ProcessGroupConfig,
    dispatcher: Dispatcher,
}

impl ProcessGroup {
    /// Create a group with default configuration.
    ///
    /// `group_id` prefixes every rendezvous key. All ranks of a group pass
    /// the same id, and groups sharing a store must use distinct ids.
    pub fn new(
        store: Arc<dyn Store>,
        rank: usize,
        size: usize,
        backend: Arc<dyn CommBackend>,
        group_id: impl Into<String>,
    ) -> Result<Self> {
        let config = ProcessGroupConfig {
            group_id: group_id.into(),
            ..ProcessGroupConfig::default()
        };
        Self::with_config(store, rank, size, backend, config)
    }

    pub fn with_config(
        store: Arc<dyn Store>,
        rank: usize,
        size: usize,
        backend: Arc<dyn CommBackend>,
        config: ProcessGroupConfig,
    ) -> Result<Self> {
        if size == 0 {
            return Err(ProcessGroupError::invalid("group size must be positive"));
        }
        if rank >= size {
            return Err(ProcessGroupError::invalid(format!(
                "rank {rank} is out of range for group size {size}"
            )));
        }
        config
            .validate()
            .map_err(|e| ProcessGroupError::invalid(format!("invalid configuration: {e}")))?;

        let rendezvous = RendezvousExchange::new(store, Arc::clone(&backend), rank, &config);
        let registry = CommRegistry::new(Arc::clone(&backend), rendezvous, rank, size);
        let settings = TaskSettings {
            wait_timeout: config.wait_timeout(),
            poll_interval: config.wait_poll_interval(),
            policy: config.failure_policy,
        };
        debug!(
            rank,
            size,
            backend = backend.name(),
            group_id = %config.group_id,
            "process group created"
        );

        Ok(Self {
            rank,
            size,
            dispatcher: Dispatcher::new(backend, registry, rank, size, settings),
            config,
        })
    }

    pub fn config(&self) -> &ProcessGroupConfig {
        &self.config
    }

    /// Devices that have taken part in an operation, in ascending order.
    pub fn used_devices(&self) -> Vec<DeviceId> {
        self.dispatcher.registry().used_devices()
    }

    /// Number of device sets with bootstrapped communicators.
    pub fn communicator_sets(&self) -> usize {
        self.dispatcher.registry().len()
    }

    fn check_pairs(
        &self,
        comm_type: CommType,
        inputs: &[Tensor],
        outputs: &[Tensor],
        expected_out: impl Fn(usize) -> Option<usize>,
    ) -> Result<()> {
        for (input, output) in inputs.iter().zip(outputs) {
            if input.dtype() != output.dtype() {
                return Err(ProcessGroupError::invalid(format!(
                    "{comm_type} input is {:?} but output is {:?}",
                    input.dtype(),
                    output.dtype()
                )));
            }
            match expected_out(input.numel()) {
                Some(numel) if numel == output.numel() => {}
                Some(numel) => {
                    return Err(ProcessGroupError::invalid(format!(
                        "{comm_type} output on {} holds {} elements, expected {numel}",
                        output.device(),
                        output.numel()
                    )));
                }
                None => {
                    return Err(ProcessGroupError::invalid(format!(
                        "{comm_type} input of {} elements cannot be split across {} ranks",
                        input.numel(),
                        self.size
                    )));
                }
            }
        }
        Ok(())
    }

    fn barrier_devices(&self, opts: &BarrierOptions) -> Vec<DeviceId> {
        if !opts.device_ids.is_empty() {
            return opts.device_ids.clone();
        }
        let used = self.used_devices();
        if !used.is_empty() {
            return used;
        }
        let device_count = self.dispatcher.backend().device_count().max(1);
        vec![DeviceId((self.rank % device_count) as u32)]
    }
}

impl ProcessGroupOps for ProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn backend_name(&self) -> &'static str {
        self.dispatcher.backend().name()
    }

    fn all_reduce(&self, tensors: &[Tensor], opts: &AllReduceOptions) -> Result<Arc<Task>> {
        let reduce_op = opts.reduce_op;
        self.dispatcher.collective(
            tensors,
            tensors,
            CommType::AllReduce,
            |input, output, comm, stream| comm.all_reduce(input, output, reduce_op, stream),
        )
    }

    fn broadcast(&self, tensors: &[Tensor], opts: &BroadcastOptions) -> Result<Arc<Task>> {
        opts.validate(self.size)?;
        let root = opts.source_rank;
        self.dispatcher.collective(
            tensors,
            tensors,
            CommType::Broadcast,
            |input, output, comm, stream| comm.broadcast(input, output, root, stream),
        )
    }

    fn barrier(&self, opts: &BarrierOptions) -> Result<Arc<Task>> {
        let tensors: Vec<_> = self
            .barrier_devices(opts)
            .into_iter()
            .map(|device| Tensor::zeros(device, DType::F32, 1))
            .collect();
        self.dispatcher
            .barrier(&tensors, |input, output, comm, stream| {
                comm.all_reduce(input, output, ReduceOp::Sum, stream)
            })
    }

    fn send(&self, tensors: &[Tensor], dst_rank: usize) -> Result<Arc<Task>> {
        self.dispatcher.point_to_point(
            tensors,
            dst_rank,
            CommType::Send,
            |tensor, comm, stream, tag| comm.send(tensor, dst_rank, tag, stream),
        )
    }

    fn recv(&self, tensors: &[Tensor], src_rank: usize) -> Result<Arc<Task>> {
        self.dispatcher.point_to_point(
            tensors,
            src_rank,
            CommType::Recv,
            |tensor, comm, stream, tag| comm.recv(tensor, src_rank, tag, stream),
        )
    }

    fn all_gather(&self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<Arc<Task>> {
        let size = self.size;
        self.check_pairs(CommType::AllGather, inputs, outputs, |n| Some(n * size))?;
        self.dispatcher.collective(
            inputs,
            outputs,
            CommType::AllGather,
            |input, output, comm, stream| comm.all_gather(input, output, stream),
        )
    }

    fn all_to_all(&self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<Arc<Task>> {
        let (rank, size) = (self.rank, self.size);
        self.check_pairs(CommType::AllToAll, inputs, outputs, |n| {
            (n % size == 0).then_some(n)
        })?;
        self.dispatcher.collective(
            inputs,
            outputs,
            CommType::AllToAll,
            |input, output, comm, stream| {
                let sends = input.chunks(size)?;
                let recvs = output.chunks(size)?;
                for (peer, (send, recv)) in sends.iter().zip(&recvs).enumerate() {
                    comm.send(send, peer, P2pTag::new(rank, peer, true), stream)?;
                    comm.recv(recv, peer, P2pTag::new(rank, peer, false), stream)?;
                }
                Ok(())
            },
        )
    }

    fn reduce(&self, tensors: &[Tensor], opts: &ReduceOptions) -> Result<Arc<Task>> {
        opts.validate(self.size)?;
        let (reduce_op, root) = (opts.reduce_op, opts.root_rank);
        self.dispatcher.collective(
            tensors,
            tensors,
            CommType::Reduce,
            |input, output, comm, stream| comm.reduce(input, output, reduce_op, root, stream),
        )
    }

    fn scatter(
        &self,
        inputs: &[Tensor],
        outputs: &[Tensor],
        opts: &ScatterOptions,
    ) -> Result<Arc<Task>> {
        opts.validate(self.size)?;
        let (rank, size, root) = (self.rank, self.size, opts.root_rank);
        self.check_pairs(CommType::Scatter, inputs, outputs, |n| {
            (n % size == 0).then_some(n / size)
        })?;
        self.dispatcher.collective(
            inputs,
            outputs,
            CommType::Scatter,
            |input, output, comm, stream| {
                if rank == root {
                    for (peer, chunk) in input.chunks(size)?.iter().enumerate() {
                        comm.send(chunk, peer, P2pTag::new(rank, peer, true), stream)?;
                    }
                }
                comm.recv(output, root, P2pTag::new(rank, root, false), stream)
            },
        )
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("backend", &self.backend_name())
            .field("group_id", &self.config.group_id)
            .finish()
    }
}
