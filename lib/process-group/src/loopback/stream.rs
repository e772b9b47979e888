// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-order work queues backed by a dedicated worker thread.
//!
//! Once a job fails the stream is poisoned: later work is skipped and every
//! event signalled afterwards carries the failure. Waiting on a poisoned
//! event poisons the waiting stream as well.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::{error, trace};

use super::event::{Generation, LoopbackEvent};
use crate::backend::{DeviceEvent, DeviceStream};
use crate::device::DeviceId;

type Work = Box<dyn FnOnce() -> Result<()> + Send>;

enum Job {
    Work(Work),
    Signal(Arc<LoopbackEvent>, Generation),
    Wait(Arc<LoopbackEvent>, Generation),
    Flush(flume::Sender<()>),
}

pub struct LoopbackStream {
    device: DeviceId,
    name: String,
    tx: flume::Sender<Job>,
    poison: Arc<Mutex<Option<Arc<str>>>>,
}

impl LoopbackStream {
    /// Spawn the worker thread for a new stream.
    ///
    /// The thread exits once every handle to the stream is dropped and the
    /// queue has drained.
    pub fn spawn(device: DeviceId, name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let (tx, rx) = flume::unbounded();
        let poison = Arc::new(Mutex::new(None));

        let worker_poison = Arc::clone(&poison);
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_stream(rx, worker_poison))
            .with_context(|| format!("failed to spawn stream worker {name}"))?;

        Ok(Arc::new(Self {
            device,
            name,
            tx,
            poison,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue host work that runs in stream order.
    pub fn launch<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.submit(Job::Work(Box::new(work)))
    }

    /// The failure that poisoned this stream, if any.
    pub fn error(&self) -> Option<String> {
        self.poison.lock().as_ref().map(|reason| reason.to_string())
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| anyhow!("stream worker {} has exited", self.name))
    }

    fn downcast(event: &Arc<dyn DeviceEvent>) -> Result<Arc<LoopbackEvent>> {
        Arc::clone(event)
            .into_any()
            .downcast::<LoopbackEvent>()
            .map_err(|_| anyhow!("event does not belong to the loopback backend"))
    }
}

fn run_stream(rx: flume::Receiver<Job>, poison: Arc<Mutex<Option<Arc<str>>>>) {
    for job in rx.iter() {
        match job {
            Job::Work(work) => {
                if poison.lock().is_some() {
                    continue;
                }
                let failure = match catch_unwind(AssertUnwindSafe(work)) {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("{e:#}")),
                    Err(_) => Some("stream work panicked".to_string()),
                };
                if let Some(reason) = failure {
                    error!(%reason, "stream work failed");
                    *poison.lock() = Some(reason.into());
                }
            }
            Job::Signal(event, generation) => {
                event.signal(generation, poison.lock().clone());
            }
            Job::Wait(event, generation) => {
                trace!(generation, "stream waiting on event");
                if let Some(reason) = event.wait_for(generation) {
                    let mut poison = poison.lock();
                    if poison.is_none() {
                        *poison = Some(format!("dependency failed: {reason}").into());
                    }
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

impl DeviceStream for LoopbackStream {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn record_event(&self, event: &Arc<dyn DeviceEvent>) -> Result<()> {
        let event = Self::downcast(event)?;
        let generation = event.arm();
        self.submit(Job::Signal(event, generation))
    }

    fn wait_event(&self, event: &Arc<dyn DeviceEvent>) -> Result<()> {
        let event = Self::downcast(event)?;
        let generation = event.current();
        if generation == 0 {
            return Ok(());
        }
        self.submit(Job::Wait(event, generation))
    }

    fn synchronize(&self) -> Result<()> {
        let (tx, rx) = flume::bounded(1);
        self.submit(Job::Flush(tx))?;
        rx.recv()
            .map_err(|_| anyhow!("stream worker {} has exited", self.name))?;
        match self.error() {
            Some(reason) => Err(anyhow!("stream {} failed: {reason}", self.name)),
            None => Ok(()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for LoopbackStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackStream")
            .field("device", &self.device)
            .field("name", &self.name)
            .finish()
    }
}
