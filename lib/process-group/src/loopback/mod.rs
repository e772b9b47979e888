// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process reference backend.
//!
//! Every rank of a group lives in the same process and shares one
//! [`LoopbackFabric`]. Devices are simulated: each stream is a worker thread
//! executing host closures in issue order, and events are generation
//! counters guarded by a condition variable.
//!
//! ```text
//! rank 0 ── LoopbackBackend ──┐
//! rank 1 ── LoopbackBackend ──┼── LoopbackFabric ── UniqueId → Clique
//! rank N ── LoopbackBackend ──┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let fabric = LoopbackFabric::new();
//! let store = MemoryStore::new();
//!
//! // one thread per rank
//! let backend = Arc::new(LoopbackBackend::new(fabric.clone(), 1)?);
//! let pg = ProcessGroup::new(Arc::new(store.clone()), rank, world_size, backend, "pg")?;
//! ```

mod clique;
mod comm;
mod event;
mod stream;

pub use event::{EventPoison, LoopbackEvent};
pub use stream::LoopbackStream;

use std::cell::Cell;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use self::clique::Clique;
use self::comm::LoopbackComm;
use crate::backend::{
    CommBackend, Communicator, DeviceContext, DeviceEvent, DeviceStream, UniqueId,
};
use crate::device::DeviceId;

/// Name reported by [`LoopbackBackend`].
pub const LOOPBACK_BACKEND_NAME: &str = "LOOPBACK";

thread_local! {
    static ACTIVE_DEVICE: Cell<Option<DeviceId>> = const { Cell::new(None) };
}

/// Device bound to the calling thread by the last context activation.
pub fn active_device() -> Option<DeviceId> {
    ACTIVE_DEVICE.with(Cell::get)
}

/// Rendezvous point for every loopback communicator in the process.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    cliques: Arc<DashMap<UniqueId, Arc<Clique>>>,
    timeout: Option<Duration>,
}

impl LoopbackFabric {
    /// A fabric on which joins and transfers wait indefinitely.
    pub fn new() -> Self {
        Self::default()
    }

    /// A fabric on which joins and transfers fail after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Number of communicator groups created on this fabric.
    pub fn clique_count(&self) -> usize {
        self.cliques.len()
    }

    fn clique(&self, id: &UniqueId, nranks: usize) -> Result<Arc<Clique>> {
        let clique = self
            .cliques
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Clique::new(nranks)))
            .clone();
        ensure!(
            clique.nranks() == nranks,
            "communicator {id:?} has {} ranks, joined with {nranks}",
            clique.nranks()
        );
        Ok(clique)
    }
}

/// One rank's view of the loopback devices.
pub struct LoopbackBackend {
    fabric: LoopbackFabric,
    default_streams: Vec<Arc<LoopbackStream>>,
    side_streams: Mutex<Vec<Vec<Weak<LoopbackStream>>>>,
}

impl LoopbackBackend {
    pub fn new(fabric: LoopbackFabric, num_devices: usize) -> Result<Self> {
        ensure!(num_devices > 0, "loopback backend needs at least one device");
        let default_streams = (0..num_devices as u32)
            .map(|ordinal| {
                LoopbackStream::spawn(DeviceId(ordinal), format!("loopback-dev{ordinal}-default"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            fabric,
            default_streams,
            side_streams: Mutex::new(vec![Vec::new(); num_devices]),
        })
    }

    /// The concrete default stream, for launching application work.
    pub fn compute_stream(&self, device: DeviceId) -> Result<Arc<LoopbackStream>> {
        self.default_streams
            .get(device.index())
            .cloned()
            .with_context(|| format!("{device} is not a loopback device"))
    }

    fn check_device(&self, device: DeviceId) -> Result<()> {
        ensure!(
            device.index() < self.default_streams.len(),
            "{device} is not a loopback device ({} devices)",
            self.default_streams.len()
        );
        Ok(())
    }
}

impl CommBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        LOOPBACK_BACKEND_NAME
    }

    fn device_count(&self) -> usize {
        self.default_streams.len()
    }

    fn create_unique_id(&self) -> Result<UniqueId> {
        Ok(UniqueId::from_bytes(Uuid::new_v4().as_bytes().to_vec()))
    }

    fn init_communicator(
        &self,
        device: DeviceId,
        id: &UniqueId,
        nranks: usize,
        rank: usize,
    ) -> Result<Arc<dyn Communicator>> {
        self.check_device(device)?;
        let clique = self.fabric.clique(id, nranks)?;
        clique
            .join(rank, self.fabric.timeout)
            .with_context(|| format!("failed to join communicator {id:?} on {device}"))?;
        debug!(%device, rank, nranks, ?id, "loopback communicator joined");

        Ok(Arc::new(LoopbackComm::new(
            device,
            rank,
            clique,
            self.fabric.timeout,
        )))
    }

    fn create_context(&self, device: DeviceId) -> Result<Arc<dyn DeviceContext>> {
        self.check_device(device)?;
        let mut side_streams = self.side_streams.lock();
        let streams = &mut side_streams[device.index()];
        streams.retain(|s| s.strong_count() > 0);

        let name = format!("loopback-dev{}-comm{}", device.0, streams.len());
        let stream = LoopbackStream::spawn(device, name)?;
        streams.push(Arc::downgrade(&stream));

        Ok(Arc::new(LoopbackContext { device, stream }))
    }

    fn default_stream(&self, device: DeviceId) -> Result<Arc<dyn DeviceStream>> {
        Ok(self.compute_stream(device)?)
    }

    fn create_event(&self, device: DeviceId) -> Result<Arc<dyn DeviceEvent>> {
        self.check_device(device)?;
        Ok(LoopbackEvent::new(device))
    }

    fn synchronize_device(&self, device: DeviceId) -> Result<()> {
        let live = {
            let side_streams = self.side_streams.lock();
            side_streams
                .get(device.index())
                .map(|streams| streams.iter().filter_map(Weak::upgrade).collect::<Vec<_>>())
                .unwrap_or_default()
        };
        for stream in live {
            stream.synchronize()?;
        }
        self.compute_stream(device)?.synchronize()
    }
}

struct LoopbackContext {
    device: DeviceId,
    stream: Arc<LoopbackStream>,
}

impl DeviceContext for LoopbackContext {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn stream(&self) -> Arc<dyn DeviceStream> {
        self.stream.clone()
    }

    fn activate(&self) -> Result<()> {
        ACTIVE_DEVICE.with(|active| active.set(Some(self.device)));
        Ok(())
    }
}
