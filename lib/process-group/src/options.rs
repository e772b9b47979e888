// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Operation kinds and per-operation option records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::{ProcessGroupError, Result};

/// The kind of communication a [`Task`](crate::Task) tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommType {
    Broadcast,
    AllReduce,
    AllGather,
    AllToAll,
    Reduce,
    Scatter,
    Send,
    Recv,
    Barrier,
}

impl fmt::Display for CommType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommType::Broadcast => "broadcast",
            CommType::AllReduce => "all_reduce",
            CommType::AllGather => "all_gather",
            CommType::AllToAll => "all_to_all",
            CommType::Reduce => "reduce",
            CommType::Scatter => "scatter",
            CommType::Send => "send",
            CommType::Recv => "recv",
            CommType::Barrier => "barrier",
        };
        f.write_str(name)
    }
}

/// Element-wise reduction operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    #[default]
    Sum,
    Min,
    Max,
    Product,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllReduceOptions {
    pub reduce_op: ReduceOp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    /// Rank whose tensors are copied to every other rank.
    pub source_rank: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarrierOptions {
    /// Devices to synchronise. Empty means every device the group has used,
    /// or `rank % device_count` if the group has not communicated yet.
    pub device_ids: Vec<DeviceId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceOptions {
    pub reduce_op: ReduceOp,
    /// Rank that receives the reduced result.
    pub root_rank: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScatterOptions {
    /// Rank whose input is partitioned across the group.
    pub root_rank: usize,
}

pub(crate) fn check_rank(what: &str, rank: usize, size: usize) -> Result<()> {
    if rank >= size {
        return Err(ProcessGroupError::invalid(format!(
            "{what} {rank} is out of range for group size {size}"
        )));
    }
    Ok(())
}

impl BroadcastOptions {
    pub(crate) fn validate(&self, size: usize) -> Result<()> {
        check_rank("source rank", self.source_rank, size)
    }
}

impl ReduceOptions {
    pub(crate) fn validate(&self, size: usize) -> Result<()> {
        check_rank("root rank", self.root_rank, size)
    }
}

impl ScatterOptions {
    pub(crate) fn validate(&self, size: usize) -> Result<()> {
        check_rank("root rank", self.root_rank, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_rank_validation() {
        assert!(BroadcastOptions { source_rank: 3 }.validate(4).is_ok());
        let err = BroadcastOptions { source_rank: 4 }.validate(4).unwrap_err();
        assert!(err.to_string().contains("source rank 4"));

        let opts = ReduceOptions {
            reduce_op: ReduceOp::Max,
            root_rank: 7,
        };
        assert!(opts.validate(2).is_err());
        assert!(ScatterOptions { root_rank: 1 }.validate(2).is_ok());
    }

    #[test]
    fn test_comm_type_display() {
        assert_eq!(CommType::AllReduce.to_string(), "all_reduce");
        assert_eq!(CommType::Recv.to_string(), "recv");
    }
}
