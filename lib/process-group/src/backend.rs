// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device and communication backend interfaces.
//!
//! A process group drives exactly one [`CommBackend`]. The backend owns the
//! device runtime (streams, events, contexts) and creates [`Communicator`]s
//! from a [`UniqueId`] shared between ranks through the rendezvous store.
//!
//! # Communicator Construction
//!
//! Communicators are created collectively: the root of a rendezvous calls
//! [`CommBackend::create_unique_id`], the id travels to every rank through
//! the [`Store`](crate::Store), and then every rank calls
//! [`CommBackend::init_communicator`] with the same id. Implementations may
//! block inside `init_communicator` until all `nranks` participants arrive.
//!
//! # Stream Semantics
//!
//! Work enqueued on a [`DeviceStream`] executes in issue order. Enqueue calls
//! return immediately; completion is observed through [`DeviceEvent`]s. An
//! event that was never recorded reports complete, and recording it again
//! re-arms it.
//!
//! Backend methods return [`anyhow::Result`]; the process group maps failures
//! to typed errors at its boundary.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::dispatch::P2pTag;
use crate::options::ReduceOp;
use crate::tensor::Tensor;

/// Opaque bootstrap token shared by every rank that joins one communicator.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueId(Vec<u8>);

impl UniqueId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueId(")?;
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 8 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

/// A device event used to observe and order stream work.
pub trait DeviceEvent: Send + Sync {
    /// Non-blocking completion check.
    ///
    /// Returns an error if work preceding the recorded point failed.
    fn query(&self) -> Result<bool>;

    /// Block until the recorded point has executed.
    fn synchronize(&self) -> Result<()>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// An in-order queue of device work.
pub trait DeviceStream: Send + Sync {
    fn device(&self) -> DeviceId;

    /// Record `event` at the current tail of the stream.
    fn record_event(&self, event: &Arc<dyn DeviceEvent>) -> Result<()>;

    /// Make later work on this stream wait for `event`. Never blocks the host.
    fn wait_event(&self, event: &Arc<dyn DeviceEvent>) -> Result<()>;

    /// Block until all enqueued work has executed.
    fn synchronize(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Per-device execution context holding the dedicated communication stream.
pub trait DeviceContext: Send + Sync {
    fn device(&self) -> DeviceId;

    fn stream(&self) -> Arc<dyn DeviceStream>;

    /// Bind the device to the calling thread.
    fn activate(&self) -> Result<()>;
}

/// A communicator bound to one device and one group of ranks.
///
/// Every method enqueues work on `stream` and returns without waiting for
/// it. Collectives must be issued in the same order by every rank.
pub trait Communicator: Send + Sync {
    fn device(&self) -> DeviceId;

    /// This participant's rank within the communicator.
    fn rank(&self) -> usize;

    fn nranks(&self) -> usize;

    fn all_reduce(
        &self,
        input: &Tensor,
        output: &Tensor,
        op: ReduceOp,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()>;

    fn broadcast(
        &self,
        input: &Tensor,
        output: &Tensor,
        root: usize,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()>;

    /// Reduce into `output` on `root`. Other ranks leave `output` untouched.
    fn reduce(
        &self,
        input: &Tensor,
        output: &Tensor,
        op: ReduceOp,
        root: usize,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()>;

    /// Concatenate every rank's `input` into `output` in rank order.
    fn all_gather(
        &self,
        input: &Tensor,
        output: &Tensor,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()>;

    fn send(
        &self,
        tensor: &Tensor,
        peer: usize,
        tag: P2pTag,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()>;

    fn recv(
        &self,
        tensor: &Tensor,
        peer: usize,
        tag: P2pTag,
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()>;
}

/// The device runtime plus communication library a process group drives.
pub trait CommBackend: Send + Sync {
    /// Fixed backend name.
    fn name(&self) -> &'static str;

    /// Number of devices visible to this process.
    fn device_count(&self) -> usize;

    fn create_unique_id(&self) -> Result<UniqueId>;

    /// Join the communicator identified by `id` as `rank` of `nranks`.
    ///
    /// This is a collective call and may block until every participant has
    /// called it with the same id.
    fn init_communicator(
        &self,
        device: DeviceId,
        id: &UniqueId,
        nranks: usize,
        rank: usize,
    ) -> Result<Arc<dyn Communicator>>;

    fn create_context(&self, device: DeviceId) -> Result<Arc<dyn DeviceContext>>;

    /// The stream application compute runs on for `device`.
    fn default_stream(&self, device: DeviceId) -> Result<Arc<dyn DeviceStream>>;

    fn create_event(&self, device: DeviceId) -> Result<Arc<dyn DeviceEvent>>;

    /// Block until all work on `device` has executed.
    fn synchronize_device(&self, device: DeviceId) -> Result<()>;

    /// Open a group of communication calls that are issued together.
    fn group_start(&self) -> Result<()> {
        Ok(())
    }

    fn group_end(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_roundtrips_through_json() {
        let id = UniqueId::from_bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_string(&id).unwrap();
        let back: UniqueId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
        assert_eq!(format!("{id:?}"), "UniqueId(deadbeef)");
    }

    #[test]
    fn test_unique_id_debug_truncates() {
        let id = UniqueId::from_bytes(vec![0u8; 16]);
        assert_eq!(format!("{id:?}"), "UniqueId(0000000000000000..)");
    }
}
