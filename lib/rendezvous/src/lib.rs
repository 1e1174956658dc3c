// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! Master/container rendezvous over length-framed TCP.
//!
//! A coordinator process starts a [`ContainerServer`] and publishes the address it
//! bound. The first peer to connect is the *master*, every later peer is a
//! *container*. Once the master and the expected number of containers have
//! joined, the coordinator drives each container through its
//! [`ContainerDelegate`]: one request at a time, with the reply delivered to a
//! per-request [`ReplyHandler`] and to an optional server-wide
//! [`ContainerReplyListener`].
//!
//! # Wire format
//!
//! Every frame is a 4-byte big-endian length followed by the payload, where the
//! length counts itself: `len(payload) + 4`. See [`codec`].
//!
//! # Shutdown
//!
//! [`ContainerServer::stop`] either waits for in-flight replies (graceful) or closes
//! every container at once (forced). Losing the master always forces a full teardown.

pub mod barrier;
pub mod client;
pub mod codec;
pub mod config;
mod delegate;
mod error;
pub mod logging;
pub mod net;
mod reactor;
mod registry;
mod replies;
mod server;
mod shutdown;

pub use barrier::JoinBarrier;
pub use client::ContainerClient;
pub use codec::{FrameCodec, FrameError};
pub use config::ServerConfig;
pub use delegate::{ContainerDelegate, ReplyFuture};
pub use error::{RendezvousError, Result};
pub use registry::{ConnectionId, Role};
pub use replies::{ContainerReplyListener, ReplyHandler};
pub use server::{ContainerServer, ContainerServerBuilder, DisconnectHook};
