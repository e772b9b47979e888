// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runs one collective repeatedly on an in-process loopback group and
//! checks the result on every rank.
//!
//! ```text
//! DYN_LOG=debug pg-loopback --world-size 4 --devices 2 --op all-to-all --iters 10
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use dynamo_process_group::loopback::{LoopbackBackend, LoopbackFabric};
use dynamo_process_group::{
    logging, AllReduceOptions, BarrierOptions, BroadcastOptions, DType, DeviceId, MemoryStore,
    ProcessGroup, ProcessGroupConfig, ProcessGroupOps, Tensor, TensorData,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Op {
    AllReduce,
    Broadcast,
    AllGather,
    AllToAll,
    Barrier,
}

#[derive(Parser)]
struct Args {
    /// Number of ranks, one thread each
    #[clap(long, default_value_t = 2)]
    world_size: usize,

    /// Devices per rank
    #[clap(long, default_value_t = 1)]
    devices: usize,

    /// Collective to run
    #[clap(long, value_enum, default_value_t = Op::AllReduce)]
    op: Op,

    /// Amount of iterations
    #[clap(long, default_value_t = 10)]
    iters: usize,

    /// Elements per device tensor
    #[clap(long, default_value_t = 1024)]
    numel: usize,

    /// Fail fabric joins and transfers that take longer than this
    #[clap(long, default_value_t = 60_000)]
    timeout_ms: u64,
}

fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();
    ensure!(args.world_size > 0, "--world-size must be positive");
    ensure!(args.devices > 0, "--devices must be positive");
    if matches!(args.op, Op::AllToAll) {
        ensure!(
            args.numel % args.world_size == 0,
            "--numel must be divisible by --world-size for all-to-all"
        );
    }

    let config = ProcessGroupConfig::from_env()?;
    let fabric = LoopbackFabric::with_timeout(Duration::from_millis(args.timeout_ms));
    let store = Arc::new(MemoryStore::new());

    let start = Instant::now();
    std::thread::scope(|scope| -> Result<()> {
        let ranks: Vec<_> = (0..args.world_size)
            .map(|rank| {
                let (fabric, store, config) = (fabric.clone(), Arc::clone(&store), config.clone());
                let args = &args;
                std::thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || -> Result<Duration> {
                        let backend = Arc::new(LoopbackBackend::new(fabric, args.devices)?);
                        let pg =
                            ProcessGroup::with_config(store, rank, args.world_size, backend, config)?;
                        run_rank(&pg, args)
                    })
            })
            .collect::<std::io::Result<_>>()?;

        for (rank, handle) in ranks.into_iter().enumerate() {
            let busy = match handle.join() {
                Ok(result) => result.with_context(|| format!("rank {rank} failed"))?,
                Err(_) => bail!("rank {rank} panicked"),
            };
            info!(rank, ?busy, "rank finished");
        }
        Ok(())
    })?;

    info!(
        op = ?args.op,
        world_size = args.world_size,
        devices = args.devices,
        iters = args.iters,
        elapsed = ?start.elapsed(),
        "all ranks verified"
    );
    Ok(())
}

fn run_rank(pg: &ProcessGroup, args: &Args) -> Result<Duration> {
    let (rank, size) = (pg.rank(), pg.size());
    let devices: Vec<_> = (0..args.devices as u32).map(DeviceId).collect();
    let mut busy = Duration::ZERO;

    for iter in 0..args.iters {
        let (inputs, outputs) = prepare(args.op, &devices, rank, size, args.numel);
        let start = Instant::now();
        let task = match args.op {
            Op::AllReduce => pg.all_reduce(&inputs, &AllReduceOptions::default())?,
            Op::Broadcast => pg.broadcast(&inputs, &BroadcastOptions { source_rank: 0 })?,
            Op::AllGather => pg.all_gather(&inputs, &outputs)?,
            Op::AllToAll => pg.all_to_all(&inputs, &outputs)?,
            Op::Barrier => pg.barrier(&BarrierOptions::default())?,
        };
        task.synchronize()?;
        busy += start.elapsed();

        verify(args.op, &inputs, &outputs, rank, size)
            .with_context(|| format!("iteration {iter} produced a wrong result"))?;
    }
    Ok(busy)
}

fn prepare(
    op: Op,
    devices: &[DeviceId],
    rank: usize,
    size: usize,
    numel: usize,
) -> (Vec<Tensor>, Vec<Tensor>) {
    let mut inputs = Vec::with_capacity(devices.len());
    let mut outputs = Vec::with_capacity(devices.len());
    for &device in devices {
        let (input, output) = match op {
            Op::AllReduce | Op::Barrier => {
                (Tensor::from_vec(device, vec![(rank + 1) as f32; numel]), None)
            }
            Op::Broadcast => {
                let value = if rank == 0 { 42.0 } else { 0.0 };
                (Tensor::from_vec(device, vec![value; numel]), None)
            }
            Op::AllGather => (
                Tensor::from_vec(device, vec![rank as f32; numel]),
                Some(Tensor::zeros(device, DType::F32, numel * size)),
            ),
            Op::AllToAll => {
                let chunk = numel / size;
                let values = (0..numel).map(|i| (rank * size + i / chunk) as f32).collect();
                (
                    Tensor::from_vec(device, values),
                    Some(Tensor::zeros(device, DType::F32, numel)),
                )
            }
        };
        outputs.push(output.unwrap_or_else(|| input.clone()));
        inputs.push(input);
    }
    (inputs, outputs)
}

fn verify(op: Op, inputs: &[Tensor], outputs: &[Tensor], rank: usize, size: usize) -> Result<()> {
    for (input, output) in inputs.iter().zip(outputs) {
        let numel = input.numel();
        let expected: Vec<f32> = match op {
            Op::Barrier => continue,
            Op::AllReduce => vec![(size * (size + 1) / 2) as f32; numel],
            Op::Broadcast => vec![42.0; numel],
            Op::AllGather => (0..numel * size).map(|i| (i / numel) as f32).collect(),
            Op::AllToAll => {
                let chunk = numel / size;
                (0..numel).map(|i| ((i / chunk) * size + rank) as f32).collect()
            }
        };
        let actual = output.read();
        ensure!(
            actual == TensorData::F32(expected),
            "{op:?} on {} disagrees with the expected result",
            output.device()
        );
    }
    Ok(())
}
