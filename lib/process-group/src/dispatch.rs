// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Turns a tensor-level call into per-device work on the backend.
//!
//! Every dispatch follows the same sequence:
//!
//! 1. validate the tensors (nothing is enqueued on failure)
//! 2. resolve the device set's communicators through the registry
//! 3. make each communication stream wait for the device's default stream
//! 4. enqueue the operation on every device inside one backend group
//! 5. record a completion event per device and hand back a [`Task`]

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{CommBackend, Communicator, DeviceContext, DeviceEvent, DeviceStream};
use crate::device::DeviceSetKey;
use crate::error::{FailurePolicy, ProcessGroupError, Result};
use crate::options::{check_rank, CommType};
use crate::registry::{CommEntry, CommRegistry};
use crate::task::{Task, TaskParts, TaskSettings};
use crate::tensor::Tensor;

/// Directional tag that pairs a send with the matching receive.
///
/// Both sides derive the same tag from the two rank numbers: the sender
/// calls `P2pTag::new(me, peer, true)`, the receiver
/// `P2pTag::new(me, peer, false)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct P2pTag {
    /// Sending rank.
    pub src: usize,
    /// Receiving rank.
    pub dst: usize,
}

impl P2pTag {
    pub fn new(local_rank: usize, peer_rank: usize, is_send: bool) -> Self {
        if is_send {
            Self {
                src: local_rank,
                dst: peer_rank,
            }
        } else {
            Self {
                src: peer_rank,
                dst: local_rank,
            }
        }
    }
}

pub(crate) struct Dispatcher {
    backend: Arc<dyn CommBackend>,
    registry: CommRegistry,
    rank: usize,
    size: usize,
    settings: TaskSettings,
}

impl Dispatcher {
    pub(crate) fn new(
        backend: Arc<dyn CommBackend>,
        registry: CommRegistry,
        rank: usize,
        size: usize,
        settings: TaskSettings,
    ) -> Self {
        Self {
            backend,
            registry,
            rank,
            size,
            settings,
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn CommBackend> {
        &self.backend
    }

    pub(crate) fn registry(&self) -> &CommRegistry {
        &self.registry
    }

    fn policy(&self) -> FailurePolicy {
        self.settings.policy
    }

    /// Dispatch a collective. `op` runs once per device with that device's
    /// input, output, communicator and communication stream.
    pub(crate) fn collective<F>(
        &self,
        inputs: &[Tensor],
        outputs: &[Tensor],
        comm_type: CommType,
        op: F,
    ) -> Result<Arc<Task>>
    where
        F: FnMut(&Tensor, &Tensor, &Arc<dyn Communicator>, &Arc<dyn DeviceStream>) -> anyhow::Result<()>,
    {
        self.launch(inputs, outputs, comm_type, false, op)
    }

    /// Dispatch a barrier. The returned task synchronizes its devices once
    /// the collective completes.
    pub(crate) fn barrier<F>(&self, tensors: &[Tensor], op: F) -> Result<Arc<Task>>
    where
        F: FnMut(&Tensor, &Tensor, &Arc<dyn Communicator>, &Arc<dyn DeviceStream>) -> anyhow::Result<()>,
    {
        self.launch(tensors, tensors, CommType::Barrier, true, op)
    }

    /// Dispatch a send or receive with exactly one tensor.
    pub(crate) fn point_to_point<F>(
        &self,
        tensors: &[Tensor],
        peer: usize,
        comm_type: CommType,
        mut op: F,
    ) -> Result<Arc<Task>>
    where
        F: FnMut(&Tensor, &Arc<dyn Communicator>, &Arc<dyn DeviceStream>, P2pTag) -> anyhow::Result<()>,
    {
        if tensors.len() != 1 {
            return Err(ProcessGroupError::invalid(format!(
                "{comm_type} takes exactly one tensor, got {}",
                tensors.len()
            )));
        }
        check_rank("peer rank", peer, self.size)?;
        if peer == self.rank {
            return Err(ProcessGroupError::invalid(format!(
                "{comm_type} peer {peer} is this rank"
            )));
        }

        let tag = P2pTag::new(self.rank, peer, comm_type == CommType::Send);
        self.launch(tensors, tensors, comm_type, false, |tensor, _, comm, stream| {
            op(tensor, comm, stream, tag)
        })
    }

    fn launch<F>(
        &self,
        inputs: &[Tensor],
        outputs: &[Tensor],
        comm_type: CommType,
        barrier: bool,
        mut op: F,
    ) -> Result<Arc<Task>>
    where
        F: FnMut(&Tensor, &Tensor, &Arc<dyn Communicator>, &Arc<dyn DeviceStream>) -> anyhow::Result<()>,
    {
        let key = self.validate(inputs, outputs)?;
        let entry = self
            .registry
            .get_or_create(&key)
            .map_err(|err| self.policy().escalate(err))?;

        debug!(
            rank = self.rank,
            op = %comm_type,
            devices = %key,
            "dispatching"
        );

        self.enqueue(&entry, inputs, outputs, &mut op)
            .and_then(|()| self.record(&entry, inputs, outputs, comm_type, barrier))
            .map_err(|err| {
                self.policy()
                    .escalate(ProcessGroupError::backend(comm_type, err))
            })
    }

    fn enqueue<F>(
        &self,
        entry: &CommEntry,
        inputs: &[Tensor],
        outputs: &[Tensor],
        op: &mut F,
    ) -> anyhow::Result<()>
    where
        F: FnMut(&Tensor, &Tensor, &Arc<dyn Communicator>, &Arc<dyn DeviceStream>) -> anyhow::Result<()>,
    {
        // order the communication streams after application work
        for input in inputs {
            let device = input.device();
            let (context, event) = lookup(entry, input)?;
            let default_stream = self.backend.default_stream(device)?;
            default_stream.record_event(event)?;
            context.stream().wait_event(event)?;
        }

        self.backend.group_start()?;
        let enqueued = inputs.iter().zip(outputs).try_for_each(|(input, output)| {
            let (context, _) = lookup(entry, input)?;
            let comm = entry
                .communicator(input.device())
                .with_context(|| format!("no communicator for {}", input.device()))?;
            context.activate()?;
            op(input, output, comm, &context.stream())
        });
        let closed = self.backend.group_end();
        enqueued?;
        closed
    }

    fn record(
        &self,
        entry: &CommEntry,
        inputs: &[Tensor],
        outputs: &[Tensor],
        comm_type: CommType,
        barrier: bool,
    ) -> anyhow::Result<Arc<Task>> {
        let mut devices = Vec::with_capacity(inputs.len());
        let mut events = Vec::with_capacity(inputs.len());
        let mut default_streams = Vec::with_capacity(inputs.len());

        for input in inputs {
            let device = input.device();
            let (context, _) = lookup(entry, input)?;
            let event = self.backend.create_event(device)?;
            context.stream().record_event(&event)?;

            devices.push(device);
            events.push(event);
            default_streams.push(self.backend.default_stream(device)?);
        }

        let parts = TaskParts {
            comm_type,
            rank: self.rank,
            devices,
            events,
            default_streams,
            outputs: outputs.to_vec(),
            barrier,
        };
        Ok(Arc::new(Task::new(
            parts,
            Arc::clone(&self.backend),
            self.settings,
        )))
    }

    fn validate(&self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<DeviceSetKey> {
        if inputs.is_empty() {
            return Err(ProcessGroupError::invalid("tensor list is empty"));
        }
        if inputs.len() != outputs.len() {
            return Err(ProcessGroupError::invalid(format!(
                "{} inputs but {} outputs",
                inputs.len(),
                outputs.len()
            )));
        }

        let device_count = self.backend.device_count();
        if inputs.len() > device_count {
            return Err(ProcessGroupError::invalid(format!(
                "{} tensors for {device_count} local devices",
                inputs.len()
            )));
        }

        let mut seen = HashSet::with_capacity(inputs.len());
        for (input, output) in inputs.iter().zip(outputs) {
            let device = input.device();
            if device.index() >= device_count {
                return Err(ProcessGroupError::invalid(format!(
                    "{device} is not one of the {device_count} local devices"
                )));
            }
            if !seen.insert(device) {
                return Err(ProcessGroupError::invalid(format!(
                    "more than one tensor on {device}"
                )));
            }
            if output.device() != device {
                return Err(ProcessGroupError::invalid(format!(
                    "input on {device} paired with output on {}",
                    output.device()
                )));
            }
        }

        let devices: Vec<_> = inputs.iter().map(Tensor::device).collect();
        Ok(DeviceSetKey::new(&devices))
    }
}

fn lookup<'a>(
    entry: &'a CommEntry,
    tensor: &Tensor,
) -> anyhow::Result<(&'a Arc<dyn DeviceContext>, &'a Arc<dyn DeviceEvent>)> {
    let device = tensor.device();
    let context = entry
        .context(device)
        .with_context(|| format!("no context for {device} in [{}]", entry.key()))?;
    let event = entry
        .event(device)
        .with_context(|| format!("no event for {device} in [{}]", entry.key()))?;
    Ok((context, event))
}
