// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device identifiers and canonical device-set keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordinal of an accelerator visible to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for DeviceId {
    fn from(ordinal: u32) -> Self {
        Self(ordinal)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{}", self.0)
    }
}

/// Canonical identifier of a set of local devices.
///
/// Devices are sorted and de-duplicated, so every enumeration order of the
/// same set produces the same key. Communicators cached under a key are
/// stored in key order; use [`DeviceSetKey::slot`] to find a device's
/// position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceSetKey(Vec<DeviceId>);

impl DeviceSetKey {
    pub fn new(devices: &[DeviceId]) -> Self {
        let mut ids = devices.to_vec();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }

    /// Devices in canonical order.
    pub fn devices(&self) -> &[DeviceId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Position of `device` within the key, if it belongs to the set.
    pub fn slot(&self, device: DeviceId) -> Option<usize> {
        self.0.binary_search(&device).ok()
    }
}

impl fmt::Display for DeviceSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, device) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", device.0)?;
        }
        Ok(())
    }
}
