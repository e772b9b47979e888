// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process group error types.
//!
//! Errors fall into four classes (see [`ErrorKind`]):
//!
//! - **Setup**: rendezvous timeouts and communicator creation failures. A
//!   partially bootstrapped group cannot continue because peers may already
//!   be blocked inside the collective join.
//! - **Argument**: bad buffers or options, detected before anything is
//!   enqueued. Recoverable.
//! - **Timeout**: a task did not complete within the requested window. The
//!   task stays valid and may be waited on again.
//! - **Backend**: a device-level enqueue or execution failure. Collective
//!   state across ranks cannot be repaired locally.
//!
//! Setup and backend errors are fatal; what happens to them is decided by
//! [`FailurePolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::options::CommType;

/// Result type alias for process group operations.
pub type Result<T> = std::result::Result<T, ProcessGroupError>;

/// Error class of a [`ProcessGroupError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Setup,
    Argument,
    Timeout,
    Backend,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessGroupError {
    #[error("rendezvous timed out after {elapsed:?} waiting for key `{key}`")]
    RendezvousTimeout { key: String, elapsed: Duration },

    #[error("communicator setup failed for `{key}`: {source:#}")]
    Setup {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{comm_type} did not complete within {timeout:?}")]
    Timeout {
        comm_type: CommType,
        timeout: Duration,
    },

    #[error("backend failure during {comm_type}: {source:#}")]
    Backend {
        comm_type: CommType,
        #[source]
        source: anyhow::Error,
    },
}

impl ProcessGroupError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn backend(comm_type: CommType, source: anyhow::Error) -> Self {
        Self::Backend { comm_type, source }
    }

    /// The error class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RendezvousTimeout { .. } | Self::Setup { .. } => ErrorKind::Setup,
            Self::InvalidArgument(_) => ErrorKind::Argument,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Backend { .. } => ErrorKind::Backend,
        }
    }

    /// Returns `true` for errors that leave the group unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Setup | ErrorKind::Backend)
    }
}

/// What the process group does with fatal errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the error and abort the process.
    #[default]
    Abort,

    /// Return the error to the caller. The group must not be used afterwards.
    Propagate,
}

impl FailurePolicy {
    /// Route an error through the policy.
    ///
    /// Non-fatal errors are always returned. Fatal errors abort the process
    /// under [`FailurePolicy::Abort`].
    pub(crate) fn escalate(self, err: ProcessGroupError) -> ProcessGroupError {
        if err.is_fatal() {
            tracing::error!(error = %err, kind = ?err.kind(), "fatal process group error");
            if self == FailurePolicy::Abort {
                std::process::abort();
            }
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = ProcessGroupError::invalid("bad");
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert!(!err.is_fatal());

        let err = ProcessGroupError::RendezvousTimeout {
            key: "pg/0/rank:0".to_string(),
            elapsed: Duration::from_millis(5),
        };
        assert_eq!(err.kind(), ErrorKind::Setup);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("pg/0/rank:0"));

        let err = ProcessGroupError::Timeout {
            comm_type: CommType::AllReduce,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!err.is_fatal());

        let err = ProcessGroupError::backend(CommType::Send, anyhow::anyhow!("stream fault"));
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("stream fault"));
    }

    #[test]
    fn test_propagate_policy_returns_fatal_errors() {
        let err = FailurePolicy::Propagate.escalate(ProcessGroupError::Setup {
            key: "0".to_string(),
            source: anyhow::anyhow!("init failed"),
        });
        assert_eq!(err.kind(), ErrorKind::Setup);
    }

    #[test]
    fn test_abort_policy_passes_recoverable_errors_through() {
        let err = FailurePolicy::Abort.escalate(ProcessGroupError::invalid("empty tensor list"));
        assert_eq!(err.kind(), ErrorKind::Argument);
    }
}
