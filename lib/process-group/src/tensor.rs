// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device buffers passed to collective operations.
//!
//! A [`Tensor`] is a flat view (`offset`, `numel`) over shared, typed storage
//! that belongs to one device. Cloning a tensor clones the reference, not
//! the data, so a [`Task`](crate::Task) can keep outputs alive after the
//! caller drops its own handle.

use std::fmt;
use std::ops::{Add, Mul, Range};
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::options::ReduceOp;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }
}

/// Owned, typed element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

macro_rules! each_dtype {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            TensorData::F32($v) => $body,
            TensorData::F64($v) => $body,
            TensorData::I32($v) => $body,
            TensorData::I64($v) => $body,
        }
    };
}

macro_rules! zip_dtype {
    ($lhs:expr, $rhs:expr, ($a:ident, $b:ident) => $body:expr) => {
        match ($lhs, $rhs) {
            (TensorData::F32($a), TensorData::F32($b)) => $body,
            (TensorData::F64($a), TensorData::F64($b)) => $body,
            (TensorData::I32($a), TensorData::I32($b)) => $body,
            (TensorData::I64($a), TensorData::I64($b)) => $body,
            (lhs, rhs) => bail!("dtype mismatch: {:?} vs {:?}", lhs.dtype(), rhs.dtype()),
        }
    };
}

impl TensorData {
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(vec![0.0; len]),
            DType::F64 => TensorData::F64(vec![0.0; len]),
            DType::I32 => TensorData::I32(vec![0; len]),
            DType::I64 => TensorData::I64(vec![0; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        each_dtype!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out a sub-range.
    pub fn range(&self, range: Range<usize>) -> Result<TensorData> {
        ensure!(
            range.start <= range.end && range.end <= self.len(),
            "range {range:?} out of bounds for {} elements",
            self.len()
        );
        Ok(match self {
            TensorData::F32(v) => TensorData::F32(v[range].to_vec()),
            TensorData::F64(v) => TensorData::F64(v[range].to_vec()),
            TensorData::I32(v) => TensorData::I32(v[range].to_vec()),
            TensorData::I64(v) => TensorData::I64(v[range].to_vec()),
        })
    }

    /// Overwrite `src.len()` elements starting at `offset`.
    pub fn copy_from(&mut self, offset: usize, src: &TensorData) -> Result<()> {
        let len = self.len();
        ensure!(
            offset + src.len() <= len,
            "write of {} elements at offset {offset} exceeds {len} elements",
            src.len()
        );
        zip_dtype!(self, src, (dst, src) => {
            dst[offset..offset + src.len()].copy_from_slice(src);
            Ok(())
        })
    }

    /// Element-wise `self = op(self, other)`.
    pub fn reduce_with(&mut self, other: &TensorData, op: ReduceOp) -> Result<()> {
        ensure!(
            self.len() == other.len(),
            "reduction length mismatch: {} vs {}",
            self.len(),
            other.len()
        );
        zip_dtype!(self, other, (acc, rhs) => {
            reduce_slice(acc, rhs, op);
            Ok(())
        })
    }

    /// Concatenate parts of one dtype in order.
    pub fn concat(parts: &[TensorData]) -> Result<TensorData> {
        let Some(first) = parts.first() else {
            bail!("cannot concatenate zero parts");
        };
        let total = parts.iter().map(TensorData::len).sum();
        let mut out = TensorData::zeros(first.dtype(), total);
        let mut offset = 0;
        for part in parts {
            out.copy_from(offset, part)?;
            offset += part.len();
        }
        Ok(out)
    }
}

fn reduce_slice<T>(acc: &mut [T], rhs: &[T], op: ReduceOp)
where
    T: Copy + PartialOrd + Add<Output = T> + Mul<Output = T>,
{
    for (a, &b) in acc.iter_mut().zip(rhs) {
        *a = match op {
            ReduceOp::Sum => *a + b,
            ReduceOp::Product => *a * b,
            ReduceOp::Min => {
                if b < *a {
                    b
                } else {
                    *a
                }
            }
            ReduceOp::Max => {
                if b > *a {
                    b
                } else {
                    *a
                }
            }
        };
    }
}

/// Rust element types that can back a tensor.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn into_data(values: Vec<Self>) -> TensorData;

    fn as_slice(data: &TensorData) -> Option<&[Self]>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn into_data(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }

            fn as_slice(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f32, F32);
impl_element!(f64, F64);
impl_element!(i32, I32);
impl_element!(i64, I64);

/// A flat view over shared storage on one device.
#[derive(Clone)]
pub struct Tensor {
    device: DeviceId,
    dtype: DType,
    offset: usize,
    numel: usize,
    storage: Arc<RwLock<TensorData>>,
}

impl Tensor {
    pub fn from_vec<T: Element>(device: DeviceId, values: Vec<T>) -> Self {
        let numel = values.len();
        Self {
            device,
            dtype: T::DTYPE,
            offset: 0,
            numel,
            storage: Arc::new(RwLock::new(T::into_data(values))),
        }
    }

    pub fn zeros(device: DeviceId, dtype: DType, numel: usize) -> Self {
        Self {
            device,
            dtype,
            offset: 0,
            numel,
            storage: Arc::new(RwLock::new(TensorData::zeros(dtype, numel))),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn size_in_bytes(&self) -> usize {
        self.numel * self.dtype.size_in_bytes()
    }

    /// A view of `len` elements starting `offset` elements into this view.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Tensor> {
        ensure!(
            offset + len <= self.numel,
            "slice [{offset}, {}) out of bounds for {} elements",
            offset + len,
            self.numel
        );
        Ok(Self {
            device: self.device,
            dtype: self.dtype,
            offset: self.offset + offset,
            numel: len,
            storage: Arc::clone(&self.storage),
        })
    }

    /// Split into `parts` equally sized consecutive views.
    pub fn chunks(&self, parts: usize) -> Result<Vec<Tensor>> {
        ensure!(
            parts > 0 && self.numel % parts == 0,
            "{} elements cannot be split into {parts} equal chunks",
            self.numel
        );
        let len = self.numel / parts;
        (0..parts).map(|i| self.slice(i * len, len)).collect()
    }

    /// Snapshot the viewed elements.
    pub fn read(&self) -> TensorData {
        let storage = self.storage.read();
        each_dtype!(&*storage, v => {
            let view = v[self.offset..self.offset + self.numel].to_vec();
            Element::into_data(view)
        })
    }

    /// Overwrite the viewed elements.
    pub fn write(&self, data: &TensorData) -> Result<()> {
        ensure!(
            data.len() == self.numel,
            "write of {} elements into a view of {}",
            data.len(),
            self.numel
        );
        self.storage.write().copy_from(self.offset, data)
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let storage = self.storage.read();
        match T::as_slice(&storage) {
            Some(values) => Ok(values[self.offset..self.offset + self.numel].to_vec()),
            None => bail!("tensor holds {:?}, not {:?}", self.dtype, T::DTYPE),
        }
    }

    /// Number of live references to the underlying storage.
    pub fn storage_refs(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("offset", &self.offset)
            .field("numel", &self.numel)
            .finish()
    }
}
