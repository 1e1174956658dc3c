// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Handle to a single connected container.

use bytes::Bytes;
use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};
use tokio::sync::oneshot;

use crate::{
    error::{RendezvousError, Result},
    registry::{Connection, ConnectionId},
    replies::{ReplyHandler, ReplyMap},
};

/// Client-facing handle for one container connection.
///
/// Cheap to clone; every clone refers to the same connection. Requests are
/// sent with [`process`](Self::process), which pairs the outgoing frame with a
/// handler for the next frame the container sends back.
#[derive(Clone)]
pub struct ContainerDelegate {
    inner: Arc<DelegateInner>,
}

struct DelegateInner {
    connection: Arc<Connection>,
    replies: Arc<ReplyMap>,
    suspended: AtomicBool,
}

impl ContainerDelegate {
    pub(crate) fn new(connection: Arc<Connection>, replies: Arc<ReplyMap>) -> Self {
        Self {
            inner: Arc::new(DelegateInner {
                connection,
                replies,
                suspended: AtomicBool::new(false),
            }),
        }
    }

    /// Connection this delegate fronts.
    pub fn id(&self) -> ConnectionId {
        self.inner.connection.id()
    }

    /// Remote address of the container.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.connection.peer_addr()
    }

    /// Send `request` and invoke `handler` with the container's next reply.
    ///
    /// Fails with [`RendezvousError::ProtocolViolation`] if a reply is already
    /// pending, [`RendezvousError::Suspended`] after [`suspend`](Self::suspend),
    /// and [`RendezvousError::ConnectionLost`] once the connection is gone.
    /// On failure the handler is never invoked.
    pub fn process<H>(&self, request: impl Into<Bytes>, handler: H) -> Result<()>
    where
        H: ReplyHandler,
    {
        let id = self.id();
        if self.is_suspended() {
            return Err(RendezvousError::Suspended(id));
        }

        self.inner.replies.register(id, Box::new(handler))?;
        if let Err(e) = self.inner.connection.enqueue(request.into()) {
            self.inner.replies.abandon(id);
            return Err(e);
        }
        Ok(())
    }

    /// Send `request` and return a future resolving to the reply.
    ///
    /// The returned [`ReplyFuture`] can be awaited or, outside a runtime,
    /// waited on with [`ReplyFuture::blocking_recv`].
    pub fn exchange(&self, request: impl Into<Bytes>) -> Result<ReplyFuture> {
        let (tx, rx) = oneshot::channel();
        self.process(request, move |reply: Bytes| {
            let _ = tx.send(reply);
        })?;
        Ok(ReplyFuture { id: self.id(), rx })
    }

    /// Stop accepting new requests. A request already in flight still completes.
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::Release);
    }

    /// Whether [`suspend`](Self::suspend) has been called.
    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Acquire)
    }

    /// `true` when no reply is outstanding.
    pub fn available(&self) -> bool {
        !self.inner.replies.is_pending(self.id())
    }

    /// Whether the underlying connection is still open.
    pub fn is_open(&self) -> bool {
        self.inner.connection.is_open()
    }

    pub(crate) fn close(&self) {
        self.inner.connection.close();
    }
}

impl fmt::Debug for ContainerDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerDelegate")
            .field("id", &self.id())
            .field("peer_addr", &self.peer_addr())
            .field("suspended", &self.is_suspended())
            .field("available", &self.available())
            .finish()
    }
}

/// Reply to a request sent with [`ContainerDelegate::exchange`].
///
/// Resolves to [`RendezvousError::ConnectionLost`] if the connection closes
/// before the container replies.
#[derive(Debug)]
pub struct ReplyFuture {
    id: ConnectionId,
    rx: oneshot::Receiver<Bytes>,
}

impl ReplyFuture {
    /// Block the current thread until the reply arrives.
    ///
    /// Panics if called from within an async execution context, like
    /// [`oneshot::Receiver::blocking_recv`].
    pub fn blocking_recv(self) -> Result<Bytes> {
        let id = self.id;
        self.rx
            .blocking_recv()
            .map_err(|_| RendezvousError::ConnectionLost(id))
    }
}

impl Future for ReplyFuture {
    type Output = Result<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| RendezvousError::ConnectionLost(id)))
    }
}
