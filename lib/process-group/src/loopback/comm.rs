// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Result};
use tracing::trace;

use super::clique::Clique;
use super::stream::LoopbackStream;
use crate::backend::{Communicator, DeviceStream};
use crate::device::DeviceId;
use crate::dispatch::P2pTag;
use crate::options::ReduceOp;
use crate::tensor::{Tensor, TensorData};

/// One rank's membership in a [`Clique`].
pub(crate) struct LoopbackComm {
    device: DeviceId,
    rank: usize,
    clique: Arc<Clique>,
    next_seq: AtomicU64,
    timeout: Option<Duration>,
}

impl LoopbackComm {
    pub(crate) fn new(
        device: DeviceId,
        rank: usize,
        clique: Arc<Clique>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            device,
            rank,
            clique,
            next_seq: AtomicU64::new(0),
            timeout,
        }
    }

    fn stream<'a>(&self, stream: &'a Arc<dyn DeviceStream>) -> Result<&'a LoopbackStream> {
        ensure!(
            stream.device() == self.device,
            "stream on {} used with communicator on {}",
            stream.device(),
            self.device
        );
        stream
            .as_any()
            .downcast_ref::<LoopbackStream>()
            .ok_or_else(|| anyhow!("stream does not belong to the loopback backend"))
    }

    fn check_rank(&self, what: &str, rank: usize) -> Result<()> {
        ensure!(
            rank < self.clique.nranks(),
            "{what} {rank} out of range for {} ranks",
            self.clique.nranks()
        );
        Ok(())
    }

    /// Enqueue one collective round. `finish` receives every rank's input
    /// in rank order and runs on the stream thread.
    fn round<F>(&self, input: &Tensor, stream: &Arc<dyn DeviceStream>, finish: F) -> Result<()>
    where
        F: FnOnce(Vec<TensorData>) -> Result<()> + Send + 'static,
    {
        let stream = self.stream(stream)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let clique = Arc::clone(&self.clique);
        let (rank, timeout) = (self.rank, self.timeout);
        let input = input.clone();
        trace!(device = %self.device, rank, seq, "enqueue collective round");

        stream.launch(move || {
            let inputs = clique.exchange(seq, rank, input.read(), timeout)?;
            finish(inputs)
        })
    }
}

impl Communicator for LoopbackComm {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn nranks(&self) -> usize {
        self.clique.nranks()
    }

    fn all_reduce(
        &self,
        input: &Tensor,
        output: &Tensor,
        op: ReduceOp,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()> {
        ensure!(input.numel() == output.numel(), "all_reduce size mismatch");
        let output = output.clone();
        self.round(input, stream, move |inputs| {
            output.write(&reduce_all(inputs, op)?)
        })
    }

    fn broadcast(
        &self,
        input: &Tensor,
        output: &Tensor,
        root: usize,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()> {
        self.check_rank("root", root)?;
        ensure!(input.numel() == output.numel(), "broadcast size mismatch");
        let output = output.clone();
        self.round(input, stream, move |mut inputs| {
            output.write(&inputs.swap_remove(root))
        })
    }

    fn reduce(
        &self,
        input: &Tensor,
        output: &Tensor,
        op: ReduceOp,
        root: usize,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()> {
        self.check_rank("root", root)?;
        ensure!(input.numel() == output.numel(), "reduce size mismatch");
        let output = output.clone();
        let is_root = self.rank == root;
        self.round(input, stream, move |inputs| {
            if is_root {
                output.write(&reduce_all(inputs, op)?)?;
            }
            Ok(())
        })
    }

    fn all_gather(
        &self,
        input: &Tensor,
        output: &Tensor,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()> {
        ensure!(
            output.numel() == input.numel() * self.clique.nranks(),
            "all_gather output holds {} elements, expected {}",
            output.numel(),
            input.numel() * self.clique.nranks()
        );
        let output = output.clone();
        self.round(input, stream, move |inputs| {
            output.write(&TensorData::concat(&inputs)?)
        })
    }

    fn send(
        &self,
        tensor: &Tensor,
        peer: usize,
        tag: P2pTag,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()> {
        self.check_rank("peer", peer)?;
        let stream = self.stream(stream)?;
        let clique = Arc::clone(&self.clique);
        let tensor = tensor.clone();
        stream.launch(move || {
            clique.post(tag, tensor.read());
            Ok(())
        })
    }

    fn recv(
        &self,
        tensor: &Tensor,
        peer: usize,
        tag: P2pTag,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()> {
        self.check_rank("peer", peer)?;
        let stream = self.stream(stream)?;
        let clique = Arc::clone(&self.clique);
        let tensor = tensor.clone();
        let timeout = self.timeout;
        stream.launch(move || {
            let payload = clique.take(tag, timeout)?;
            tensor.write(&payload)
        })
    }
}

/// Fold inputs left to right so every rank computes bit-identical results.
fn reduce_all(inputs: Vec<TensorData>, op: ReduceOp) -> Result<TensorData> {
    let mut inputs = inputs.into_iter();
    let mut acc = inputs
        .next()
        .ok_or_else(|| anyhow!("collective round without inputs"))?;
    for input in inputs {
        acc.reduce_with(&input, op)?;
    }
    Ok(acc)
}
