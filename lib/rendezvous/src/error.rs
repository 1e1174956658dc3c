// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{net::SocketAddr, time::Duration};

use crate::{codec::FrameError, registry::ConnectionId};

/// Crate-wide result alias.
pub type Result<T, E = RendezvousError> = std::result::Result<T, E>;

/// Errors surfaced by the coordinator and its peers.
#[derive(thiserror::Error, Debug)]
pub enum RendezvousError {
    /// A frame could not be encoded or decoded.
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    /// A peer broke the request/reply protocol.
    #[error("protocol violation on connection {connection}: {reason}")]
    ProtocolViolation {
        /// Offending connection.
        connection: ConnectionId,
        /// What went wrong.
        reason: String,
    },

    /// Not every expected peer joined before the deadline.
    #[error("only {joined} of {expected} connections joined within {timeout:?}")]
    JoinTimeout {
        /// Master plus the expected number of containers.
        expected: usize,
        /// Connections that had joined when the deadline passed.
        joined: usize,
        /// How long we waited.
        timeout: Duration,
    },

    /// The connection closed before the operation could complete.
    #[error("connection {0} lost")]
    ConnectionLost(ConnectionId),

    /// The container has been suspended and accepts no further requests.
    #[error("container {0} is suspended")]
    Suspended(ConnectionId),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying bind error.
        #[source]
        source: std::io::Error,
    },

    /// `start` was called more than once.
    #[error("server already started")]
    AlreadyStarted,

    /// Invalid or unreadable configuration.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RendezvousError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn protocol_violation(connection: ConnectionId, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            connection,
            reason: reason.into(),
        }
    }
}
