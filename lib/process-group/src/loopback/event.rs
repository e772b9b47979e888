// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Re-recordable stream events.
//!
//! Each `record` bumps the event's generation and enqueues a signal for that
//! generation on the stream. The event is complete once the most recently
//! recorded generation has been signalled. An event that was never recorded
//! is complete.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Condvar, Mutex};

use crate::backend::DeviceEvent;
use crate::device::DeviceId;

pub(crate) type Generation = u64;

/// Describes work that failed before a signalled point.
#[derive(Clone, Debug)]
pub struct EventPoison {
    device: DeviceId,
    reason: Arc<str>,
}

impl EventPoison {
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for EventPoison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event on {} poisoned: {}", self.device, self.reason)
    }
}

impl std::error::Error for EventPoison {}

#[derive(Default)]
struct EventState {
    recorded: Generation,
    signaled: Generation,
    poison: Option<Arc<str>>,
}

pub struct LoopbackEvent {
    device: DeviceId,
    state: Mutex<EventState>,
    cv: Condvar,
}

impl LoopbackEvent {
    pub fn new(device: DeviceId) -> Arc<Self> {
        Arc::new(Self {
            device,
            state: Mutex::new(EventState::default()),
            cv: Condvar::new(),
        })
    }

    /// Arm a new generation. Called when the event is recorded on a stream.
    pub(crate) fn arm(&self) -> Generation {
        let mut state = self.state.lock();
        state.recorded += 1;
        state.poison = None;
        state.recorded
    }

    /// The generation a stream wait issued now would wait for.
    pub(crate) fn current(&self) -> Generation {
        self.state.lock().recorded
    }

    /// Mark `generation` as executed, carrying the stream's error if any.
    pub(crate) fn signal(&self, generation: Generation, poison: Option<Arc<str>>) {
        let mut state = self.state.lock();
        if generation > state.signaled {
            state.signaled = generation;
        }
        if poison.is_some() && generation == state.recorded {
            state.poison = poison;
        }
        self.cv.notify_all();
    }

    /// Block until `generation` executed. Returns the poison reason, if any.
    pub(crate) fn wait_for(&self, generation: Generation) -> Option<Arc<str>> {
        let mut state = self.state.lock();
        while state.signaled < generation {
            self.cv.wait(&mut state);
        }
        state.poison.clone()
    }

    fn poison_error(&self, reason: Arc<str>) -> anyhow::Error {
        anyhow::Error::new(EventPoison {
            device: self.device,
            reason,
        })
    }
}

impl DeviceEvent for LoopbackEvent {
    fn query(&self) -> Result<bool> {
        let state = self.state.lock();
        if state.signaled < state.recorded {
            return Ok(false);
        }
        match &state.poison {
            Some(reason) => Err(self.poison_error(reason.clone())),
            None => Ok(true),
        }
    }

    fn synchronize(&self) -> Result<()> {
        let generation = self.current();
        match self.wait_for(generation) {
            Some(reason) => Err(self.poison_error(reason)),
            None => Ok(()),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for LoopbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackEvent")
            .field("device", &self.device)
            .field("recorded", &state.recorded)
            .field("signaled", &state.signaled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecorded_event_is_complete() {
        let event = LoopbackEvent::new(DeviceId(0));
        assert!(event.query().unwrap());
        event.synchronize().unwrap();
    }

    #[test]
    fn test_rearm_then_signal() {
        let event = LoopbackEvent::new(DeviceId(0));
        let first = event.arm();
        let second = event.arm();
        assert!(!event.query().unwrap());

        event.signal(first, None);
        assert!(!event.query().unwrap());
        event.signal(second, None);
        assert!(event.query().unwrap());
    }

    #[test]
    fn test_poison_surfaces_on_query() {
        let event = LoopbackEvent::new(DeviceId(2));
        let generation = event.arm();
        event.signal(generation, Some("kernel fault".into()));

        let err = event.query().unwrap_err();
        let poison = err.downcast_ref::<EventPoison>().unwrap();
        assert_eq!(poison.reason(), "kernel fault");
        assert!(event.synchronize().is_err());

        // re-recording clears the poison until the stream reports again
        let generation = event.arm();
        event.signal(generation, None);
        assert!(event.query().unwrap());
    }
}
