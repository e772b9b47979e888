// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous handle for an enqueued communication.
//!
//! A [`Task`] owns one completion event per device, recorded on the
//! communication stream right after the operation was enqueued, and keeps
//! the output tensors alive until it is dropped.
//!
//! # Waiting
//!
//! - [`Task::is_completed`] never blocks.
//! - [`Task::synchronize_streams`] orders later work on the default streams
//!   after the communication without blocking the host.
//! - [`Task::wait`] blocks until completion or timeout. A timed-out task is
//!   still valid and can be waited on again.
//! - [`Task::synchronize`] waits with the configured default timeout and
//!   then synchronizes the devices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{CommBackend, DeviceEvent, DeviceStream};
use crate::device::DeviceId;
use crate::error::{FailurePolicy, ProcessGroupError, Result};
use crate::options::CommType;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Completed,
}

/// Outcome of [`Task::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Completed,
    TimedOut,
}

/// Wait behavior shared by every task of a group.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskSettings {
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub policy: FailurePolicy,
}

pub(crate) struct TaskParts {
    pub comm_type: CommType,
    pub rank: usize,
    pub devices: Vec<DeviceId>,
    pub events: Vec<Arc<dyn DeviceEvent>>,
    pub default_streams: Vec<Arc<dyn DeviceStream>>,
    pub outputs: Vec<Tensor>,
    pub barrier: bool,
}

pub struct Task {
    parts: TaskParts,
    backend: Arc<dyn CommBackend>,
    settings: TaskSettings,
    completed: AtomicBool,
    /// Set once a barrier's devices have been synchronized successfully.
    devices_synced: Mutex<bool>,
}

impl Task {
    pub(crate) fn new(
        parts: TaskParts,
        backend: Arc<dyn CommBackend>,
        settings: TaskSettings,
    ) -> Self {
        Self {
            parts,
            backend,
            settings,
            completed: AtomicBool::new(false),
            devices_synced: Mutex::new(false),
        }
    }

    pub fn comm_type(&self) -> CommType {
        self.parts.comm_type
    }

    pub fn rank(&self) -> usize {
        self.parts.rank
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.parts.devices
    }

    /// Output tensors, kept alive for the lifetime of the task.
    pub fn outputs(&self) -> &[Tensor] {
        &self.parts.outputs
    }

    pub fn is_barrier(&self) -> bool {
        self.parts.barrier
    }

    pub fn state(&self) -> TaskState {
        if self.completed.load(Ordering::Acquire) {
            TaskState::Completed
        } else {
            TaskState::Pending
        }
    }

    /// Returns `true` once every device's completion event has fired.
    pub fn is_completed(&self) -> Result<bool> {
        if self.completed.load(Ordering::Acquire) {
            return Ok(true);
        }
        for event in &self.parts.events {
            if !event.query().map_err(|e| self.fail(e))? {
                return Ok(false);
            }
        }
        self.completed.store(true, Ordering::Release);
        Ok(true)
    }

    /// Make each device's default stream wait for the communication.
    pub fn synchronize_streams(&self) -> Result<()> {
        for (stream, event) in self.parts.default_streams.iter().zip(&self.parts.events) {
            stream.wait_event(event).map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    /// Block until the task completes or `timeout` elapses.
    ///
    /// A timeout too large to represent as a deadline waits without one.
    pub fn wait(&self, timeout: Duration) -> Result<WaitStatus> {
        let deadline = Instant::now().checked_add(timeout);
        while !self.is_completed()? {
            let mut pause = self.settings.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    debug!(
                        rank = self.parts.rank,
                        op = %self.parts.comm_type,
                        ?timeout,
                        "wait timed out"
                    );
                    return Ok(WaitStatus::TimedOut);
                }
                pause = pause.min(deadline - now);
            }
            std::thread::sleep(pause);
        }

        if self.parts.barrier {
            // concurrent waiters block here until the first sync finishes
            let mut synced = self.devices_synced.lock();
            if !*synced {
                self.synchronize_devices()?;
                *synced = true;
            }
        }
        Ok(WaitStatus::Completed)
    }

    /// [`wait`](Self::wait) with the configured default timeout.
    pub fn wait_default(&self) -> Result<WaitStatus> {
        self.wait(self.settings.wait_timeout)
    }

    /// Wait with the default timeout, then synchronize every device.
    pub fn synchronize(&self) -> Result<()> {
        match self.wait_default()? {
            WaitStatus::Completed => {
                for event in &self.parts.events {
                    event.synchronize().map_err(|e| self.fail(e))?;
                }
                self.synchronize_devices()
            }
            WaitStatus::TimedOut => Err(ProcessGroupError::Timeout {
                comm_type: self.parts.comm_type,
                timeout: self.settings.wait_timeout,
            }),
        }
    }

    fn synchronize_devices(&self) -> Result<()> {
        for &device in &self.parts.devices {
            self.backend
                .synchronize_device(device)
                .map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    fn fail(&self, err: anyhow::Error) -> ProcessGroupError {
        self.settings
            .policy
            .escalate(ProcessGroupError::backend(self.parts.comm_type, err))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("comm_type", &self.parts.comm_type)
            .field("rank", &self.parts.rank)
            .field("devices", &self.parts.devices)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackBackend, LoopbackFabric};
    use crate::tensor::DType;

    fn settings() -> TaskSettings {
        TaskSettings {
            wait_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(1),
            policy: FailurePolicy::Propagate,
        }
    }

    fn gated_task(barrier: bool) -> (Task, flume::Sender<()>) {
        let backend = Arc::new(LoopbackBackend::new(LoopbackFabric::new(), 1).unwrap());
        gated_task_on(backend, barrier)
    }

    /// A task whose only event fires when `gate` is released.
    fn gated_task_on(backend: Arc<LoopbackBackend>, barrier: bool) -> (Task, flume::Sender<()>) {
        let device = DeviceId(0);
        let stream = backend.compute_stream(device).unwrap();
        let (gate, released) = flume::bounded::<()>(1);
        stream
            .launch(move || {
                released.recv()?;
                Ok(())
            })
            .unwrap();

        let event = backend.create_event(device).unwrap();
        stream.record_event(&event).unwrap();
        let default_stream = backend.default_stream(device).unwrap();

        let parts = TaskParts {
            comm_type: CommType::AllReduce,
            rank: 0,
            devices: vec![device],
            events: vec![event],
            default_streams: vec![default_stream],
            outputs: vec![Tensor::zeros(device, DType::F32, 4)],
            barrier,
        };
        (Task::new(parts, backend, settings()), gate)
    }

    #[test]
    fn test_wait_times_out_then_completes() {
        let (task, gate) = gated_task(false);
        assert!(!task.is_completed().unwrap());
        let start = Instant::now();
        assert_eq!(task.wait(Duration::from_millis(5)).unwrap(), WaitStatus::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(5), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
        assert_eq!(task.state(), TaskState::Pending);

        gate.send(()).unwrap();
        assert_eq!(task.wait(Duration::from_secs(5)).unwrap(), WaitStatus::Completed);
        assert_eq!(task.state(), TaskState::Completed);
        assert!(task.is_completed().unwrap());
    }

    #[test]
    fn test_synchronize_maps_timeout() {
        let (task, gate) = gated_task(true);
        let err = task.synchronize().unwrap_err();
        assert!(matches!(
            err,
            ProcessGroupError::Timeout {
                comm_type: CommType::AllReduce,
                ..
            }
        ));

        gate.send(()).unwrap();
        task.synchronize().unwrap();
        assert!(task.is_barrier());
    }

    #[test]
    fn test_wait_with_unbounded_timeout() {
        let (task, gate) = gated_task(false);
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            gate.send(()).unwrap();
        });
        assert_eq!(task.wait(Duration::MAX).unwrap(), WaitStatus::Completed);
        release.join().unwrap();
    }

    #[test]
    fn test_concurrent_barrier_waiters_see_synchronized_devices() {
        let backend = Arc::new(LoopbackBackend::new(LoopbackFabric::new(), 1).unwrap());
        let (task, gate) = gated_task_on(backend.clone(), true);

        // work queued after the barrier event that only a device sync waits for
        let drained = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&drained);
        backend
            .compute_stream(DeviceId(0))
            .unwrap()
            .launch(move || {
                std::thread::sleep(Duration::from_millis(100));
                flag.store(true, Ordering::Release);
                Ok(())
            })
            .unwrap();
        gate.send(()).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    assert_eq!(task.wait(Duration::from_secs(5)).unwrap(), WaitStatus::Completed);
                    assert!(drained.load(Ordering::Acquire));
                });
            }
        });
    }

    #[test]
    fn test_failed_barrier_sync_is_retried() {
        let backend = Arc::new(LoopbackBackend::new(LoopbackFabric::new(), 1).unwrap());
        let (task, gate) = gated_task_on(backend.clone(), true);
        backend
            .compute_stream(DeviceId(0))
            .unwrap()
            .launch(|| Err(anyhow::anyhow!("device lost")))
            .unwrap();
        gate.send(()).unwrap();

        for _ in 0..2 {
            let err = task.wait(Duration::from_secs(5)).unwrap_err();
            assert!(err.is_fatal());
            assert!(err.to_string().contains("device lost"), "{err}");
        }
        assert!(task.is_completed().unwrap());
    }

    #[test]
    fn test_outputs_outlive_caller_handles() {
        let (task, gate) = gated_task(false);
        assert_eq!(task.outputs()[0].storage_refs(), 1);
        assert_eq!(task.outputs()[0].numel(), 4);
        drop(gate);
    }
}
