// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lazily created, cached communicators per device set.
//!
//! The first operation on a device set bootstraps one communicator per
//! device. Bootstrap is collective: every rank must issue its first
//! operation on the same device set in the same order. Device slot `i` of a
//! key forms its own group across ranks, with the group rank as the
//! communicator rank.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context};
use parking_lot::Mutex;
use tracing::info;

use crate::backend::{CommBackend, Communicator, DeviceContext, DeviceEvent};
use crate::device::{DeviceId, DeviceSetKey};
use crate::error::{ProcessGroupError, Result};
use crate::rendezvous::RendezvousExchange;

/// Rank that generates unique ids for every bootstrap.
const BOOTSTRAP_ROOT: usize = 0;

/// Communicators and per-device resources for one device set.
///
/// Vectors are in key order; look devices up with the accessors rather than
/// by call position.
pub struct CommEntry {
    key: DeviceSetKey,
    comms: Vec<Arc<dyn Communicator>>,
    contexts: Vec<Arc<dyn DeviceContext>>,
    events: Vec<Arc<dyn DeviceEvent>>,
}

impl CommEntry {
    pub fn key(&self) -> &DeviceSetKey {
        &self.key
    }

    pub fn communicator(&self, device: DeviceId) -> Option<&Arc<dyn Communicator>> {
        self.key.slot(device).map(|slot| &self.comms[slot])
    }

    pub fn context(&self, device: DeviceId) -> Option<&Arc<dyn DeviceContext>> {
        self.key.slot(device).map(|slot| &self.contexts[slot])
    }

    /// Cached event used to order the communication stream after the
    /// default stream.
    pub fn event(&self, device: DeviceId) -> Option<&Arc<dyn DeviceEvent>> {
        self.key.slot(device).map(|slot| &self.events[slot])
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<DeviceSetKey, Arc<CommEntry>>,
    used: BTreeSet<DeviceId>,
}

pub struct CommRegistry {
    backend: Arc<dyn CommBackend>,
    rendezvous: RendezvousExchange,
    rank: usize,
    size: usize,
    state: Mutex<RegistryState>,
}

impl CommRegistry {
    pub fn new(
        backend: Arc<dyn CommBackend>,
        rendezvous: RendezvousExchange,
        rank: usize,
        size: usize,
    ) -> Self {
        Self {
            backend,
            rendezvous,
            rank,
            size,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Return the entry for `key`, bootstrapping it on first use.
    ///
    /// At most one bootstrap runs per key; concurrent callers for the same
    /// key wait for it and share the result.
    pub fn get_or_create(&self, key: &DeviceSetKey) -> Result<Arc<CommEntry>> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(key) {
            return Ok(Arc::clone(entry));
        }

        let entry = Arc::new(self.create(key)?);
        state.entries.insert(key.clone(), Arc::clone(&entry));
        state.used.extend(key.devices().iter().copied());
        Ok(entry)
    }

    fn create(&self, key: &DeviceSetKey) -> Result<CommEntry> {
        let start = Instant::now();
        let ids = self.rendezvous.exchange(BOOTSTRAP_ROOT, key.len())?;
        let setup = |source: anyhow::Error| ProcessGroupError::Setup {
            key: key.to_string(),
            source,
        };

        self.backend.group_start().map_err(setup)?;
        let comms = key
            .devices()
            .iter()
            .zip(&ids)
            .map(|(&device, id)| {
                let comm = self
                    .backend
                    .init_communicator(device, id, self.size, self.rank)
                    .with_context(|| format!("failed to create communicator on {device}"))?;
                ensure!(
                    comm.device() == device
                        && comm.rank() == self.rank
                        && comm.nranks() == self.size,
                    "communicator reports rank {} of {} on {}, expected rank {} of {} on {device}",
                    comm.rank(),
                    comm.nranks(),
                    comm.device(),
                    self.rank,
                    self.size
                );
                Ok(comm)
            })
            .collect::<anyhow::Result<Vec<_>>>();
        // close the group even when a member failed
        let closed = self.backend.group_end();
        let comms = comms.map_err(setup)?;
        closed.map_err(setup)?;

        let mut contexts = Vec::with_capacity(key.len());
        let mut events = Vec::with_capacity(key.len());
        for &device in key.devices() {
            contexts.push(self.backend.create_context(device).map_err(setup)?);
            events.push(self.backend.create_event(device).map_err(setup)?);
        }

        info!(
            rank = self.rank,
            size = self.size,
            devices = %key,
            backend = self.backend.name(),
            elapsed = ?start.elapsed(),
            "created communicators"
        );

        Ok(CommEntry {
            key: key.clone(),
            comms,
            contexts,
            events,
        })
    }

    /// Every device that has taken part in an operation, in ascending order.
    pub fn used_devices(&self) -> Vec<DeviceId> {
        self.state.lock().used.iter().copied().collect()
    }

    /// Number of cached device sets.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
