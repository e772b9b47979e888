// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process groups for collective and point-to-point communication.
//!
//! A [`ProcessGroup`] lets a fixed set of ranks, each owning one or more
//! accelerator devices, exchange tensors through a [`CommBackend`]. Calls
//! return an [`Arc<Task>`](Task) as soon as the work is enqueued on the
//! devices' communication streams.
//!
//! # Architecture
//!
//! ```text
//! ProcessGroup::all_reduce ─► Dispatcher ─► CommRegistry ─► RendezvousExchange ─► Store
//!                                │               └────────► CommBackend::init_communicator
//!                                └─► per-device enqueue ─► Task (events per device)
//! ```
//!
//! Communicators are created lazily, once per distinct set of local devices,
//! and cached for the lifetime of the group. Creation is collective: the
//! first operation on a device set must be issued by every rank.
//!
//! # Example
//!
//! ```rust,ignore
//! use dynamo_process_group::{
//!     AllReduceOptions, DeviceId, MemoryStore, ProcessGroup, ProcessGroupOps, Tensor,
//!     loopback::{LoopbackBackend, LoopbackFabric},
//! };
//!
//! let fabric = LoopbackFabric::new();
//! let store = Arc::new(MemoryStore::new());
//!
//! // on each rank's thread
//! let backend = Arc::new(LoopbackBackend::new(fabric.clone(), 1)?);
//! let pg = ProcessGroup::new(store.clone(), rank, world_size, backend, "train")?;
//! let t = Tensor::from_vec(DeviceId(0), vec![rank as f32 + 1.0; 8]);
//! pg.all_reduce(&[t.clone()], &AllReduceOptions::default())?.synchronize()?;
//! ```

pub mod backend;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod loopback;
pub mod options;
pub mod registry;
pub mod rendezvous;
pub mod store;
pub mod task;
pub mod tensor;

mod process_group;

pub use backend::{CommBackend, Communicator, DeviceContext, DeviceEvent, DeviceStream, UniqueId};
pub use config::{ConfigError, ProcessGroupConfig};
pub use device::{DeviceId, DeviceSetKey};
pub use dispatch::P2pTag;
pub use error::{ErrorKind, FailurePolicy, ProcessGroupError, Result};
pub use options::{
    AllReduceOptions, BarrierOptions, BroadcastOptions, CommType, ReduceOp, ReduceOptions,
    ScatterOptions,
};
pub use process_group::{ProcessGroup, ProcessGroupOps};
pub use store::{FileStore, MemoryStore, Store};
pub use task::{Task, TaskState, WaitStatus};
pub use tensor::{DType, Element, Tensor, TensorData};
