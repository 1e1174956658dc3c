// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Container server facade.
//!
//! [`ContainerServer`] owns the listening socket and the reactor thread. Its
//! API is blocking so it can be driven from an ordinary launcher thread:
//!
//! ```no_run
//! use std::time::Duration;
//! use rendezvous::ContainerServer;
//!
//! # fn main() -> rendezvous::Result<()> {
//! let server = ContainerServer::builder().expected_containers(4).build()?;
//! let addr = server.start()?;
//! // hand `addr` to the master and container processes
//! server.ensure_all_clients(Duration::from_secs(300))?;
//! for delegate in server.container_delegates() {
//!     delegate.process("work", |reply: bytes::Bytes| println!("{} bytes back", reply.len()))?;
//! }
//! server.stop(false);
//! # Ok(())
//! # }
//! ```

use parking_lot::{Mutex, RwLock};
use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    thread::JoinHandle,
    time::Duration,
};
use tracing::{info, warn};

use crate::{
    barrier::JoinBarrier,
    codec::DEFAULT_MAX_FRAME_SIZE,
    config::ServerConfig,
    delegate::ContainerDelegate,
    error::{RendezvousError, Result},
    net, reactor,
    registry::{ConnectionId, Registry, Role},
    replies::{ContainerReplyListener, ReplyMap},
    shutdown::ShutdownState,
};

/// Hook run on the reactor thread after a master disconnect has torn the server down.
pub type DisconnectHook = Arc<dyn Fn() + Send + Sync>;

/// State shared between the facade, the reactor thread and every delegate.
pub(crate) struct ServerState {
    pub(crate) registry: Registry,
    pub(crate) replies: Arc<ReplyMap>,
    pub(crate) barrier: JoinBarrier,
    pub(crate) shutdown: ShutdownState,
    pub(crate) reply_listener: RwLock<Option<Arc<dyn ContainerReplyListener>>>,
    pub(crate) on_disconnect: Option<DisconnectHook>,
    pub(crate) expected: usize,
    pub(crate) finite: bool,
    pub(crate) drain_poll_interval: Duration,
    pub(crate) max_frame_size: usize,
}

impl ServerState {
    pub(crate) fn reply_listener(&self) -> Option<Arc<dyn ContainerReplyListener>> {
        self.reply_listener.read().clone()
    }
}

/// Rendezvous server for one master and a fixed number of containers.
pub struct ContainerServer {
    state: Arc<ServerState>,
    bind_addr: SocketAddr,
    listener: Mutex<Option<std::net::TcpListener>>,
    local_addr: OnceLock<SocketAddr>,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerServer {
    /// Create a new builder for ContainerServer
    pub fn builder() -> ContainerServerBuilder {
        ContainerServerBuilder::new()
    }

    /// Bind the listening socket and start the reactor thread.
    ///
    /// Returns the address actually bound, which is what containers must dial.
    pub fn start(&self) -> Result<SocketAddr> {
        if !self.state.shutdown.claim() {
            return Err(RendezvousError::AlreadyStarted);
        }

        match self.spawn_reactor() {
            Ok(addr) => {
                info!(
                    "Container server bound to {}, expecting {} containers",
                    addr, self.state.expected
                );
                Ok(addr)
            }
            Err(e) => {
                // Nothing will ever run, so nobody should wait for it
                self.state.shutdown.mark_terminated();
                Err(e)
            }
        }
    }

    fn spawn_reactor(&self) -> Result<SocketAddr> {
        let listener = match self.listener.lock().take() {
            Some(listener) => listener,
            None => std::net::TcpListener::bind(self.bind_addr).map_err(|source| {
                RendezvousError::Bind {
                    addr: self.bind_addr,
                    source,
                }
            })?,
        };
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let state = self.state.clone();
        let handle = std::thread::Builder::new()
            .name(reactor::THREAD_NAME.to_string())
            .spawn(move || reactor::run(runtime, listener, state))?;

        *self.reactor.lock() = Some(handle);
        let _ = self.local_addr.set(local_addr);
        Ok(local_addr)
    }

    /// Stop the server.
    ///
    /// A graceful stop (`force == false`) suspends every container and waits for
    /// in-flight replies before tearing down; a forced stop closes every container
    /// immediately and abandons pending replies. Blocks until the reactor thread has
    /// exited, unless called from the reactor thread itself.
    pub fn stop(&self, force: bool) {
        if self.state.shutdown.claim() {
            // Never started; there is no reactor to wait for.
            self.state.shutdown.mark_terminated();
        }
        self.state.shutdown(force);
        self.join_reactor();
    }

    fn join_reactor(&self) {
        if self.state.shutdown.on_reactor_thread() {
            return;
        }
        let handle = self.reactor.lock().take();
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    warn!("Reactor thread panicked");
                }
            }
            // A concurrent stop owns the handle, or the reactor never started.
            None => self.state.shutdown.wait_terminated(),
        }
    }

    /// Wait until the master and every expected container have connected.
    ///
    /// Returns `false` on timeout, or if the server was stopped before everyone joined.
    pub fn await_all_clients(&self, timeout: Duration) -> bool {
        self.state.barrier.wait(timeout)
    }

    /// Like [`await_all_clients`](Self::await_all_clients), but reports a failed
    /// join as [`RendezvousError::JoinTimeout`].
    pub fn ensure_all_clients(&self, timeout: Duration) -> Result<()> {
        if self.await_all_clients(timeout) {
            return Ok(());
        }
        let expected = self.state.expected + 1;
        Err(RendezvousError::JoinTimeout {
            expected,
            joined: self.state.barrier.arrived(),
            timeout,
        })
    }

    /// Snapshot of the currently connected containers.
    pub fn container_delegates(&self) -> Vec<ContainerDelegate> {
        self.state.registry.snapshot()
    }

    /// Register an observer invoked for every container reply, replacing any previous one.
    pub fn register_reply_listener(&self, listener: Arc<dyn ContainerReplyListener>) {
        *self.state.reply_listener.write() = Some(listener);
    }

    /// Connection id of the master, once it has connected.
    pub fn master_id(&self) -> Option<ConnectionId> {
        self.state.registry.master().map(|master| master.id())
    }

    /// Role of the connection with `id`. Disconnected containers are [`Role::Unclassified`].
    pub fn role_of(&self, id: ConnectionId) -> Role {
        self.state.registry.role_of(id)
    }

    /// Number of containers currently connected.
    pub fn live_containers(&self) -> usize {
        self.state.registry.container_count()
    }

    /// `true` while exactly the expected number of containers is connected.
    pub fn is_running(&self) -> bool {
        !self.state.shutdown.is_torn_down() && self.live_containers() == self.state.expected
    }

    /// Block until the reactor thread has terminated.
    pub fn await_shutdown(&self) {
        self.state.shutdown.wait_terminated();
    }

    /// Address returned by [`start`](Self::start), once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Number of containers this server waits for.
    pub fn expected_containers(&self) -> usize {
        self.state.expected
    }
}

impl Drop for ContainerServer {
    fn drop(&mut self) {
        if self.reactor.lock().is_some() && !self.state.shutdown.is_torn_down() {
            warn!("Container server dropped while running; forcing shutdown");
            self.stop(true);
        }
    }
}

impl std::fmt::Debug for ContainerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerServer")
            .field("bind_addr", &self.bind_addr)
            .field("local_addr", &self.local_addr())
            .field("expected", &self.state.expected)
            .field("live_containers", &self.live_containers())
            .finish()
    }
}

/// Builder for ContainerServer
pub struct ContainerServerBuilder {
    bind_addr: Option<SocketAddr>,
    listener: Option<std::net::TcpListener>,
    expected_containers: Option<usize>,
    finite: bool,
    on_disconnect: Option<DisconnectHook>,
    drain_poll_interval: Duration,
    max_frame_size: usize,
}

impl ContainerServerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            bind_addr: None,
            listener: None,
            expected_containers: None,
            finite: false,
            on_disconnect: None,
            drain_poll_interval: Duration::from_millis(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Builder preloaded from a [`ServerConfig`].
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new()
            .bind_addr(config.bind_addr()?)
            .expected_containers(config.expected_containers)
            .finite(config.finite)
            .drain_poll_interval(config.drain_poll_interval())
            .max_frame_size(config.max_frame_size))
    }

    /// Set the bind address. Defaults to the local IP with an OS-assigned port.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Use a pre-bound TcpListener
    ///
    /// This is useful for tests where you want to bind to port 0 and avoid port races.
    pub fn listener(mut self, listener: Option<std::net::TcpListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Number of containers expected after the master. Required, must be > 0.
    pub fn expected_containers(mut self, count: usize) -> Self {
        self.expected_containers = Some(count);
        self
    }

    /// Close each container after its first reply.
    pub fn finite(mut self, finite: bool) -> Self {
        self.finite = finite;
        self
    }

    /// Extra task run after a master disconnect has torn the server down.
    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    /// Poll interval of the graceful drain loop.
    pub fn drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Largest accepted frame, length field included.
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Build the server. Nothing is bound until [`ContainerServer::start`].
    pub fn build(self) -> Result<ContainerServer> {
        let expected = self
            .expected_containers
            .ok_or_else(|| RendezvousError::config("expected_containers is required"))?;
        if expected == 0 {
            return Err(RendezvousError::config(
                "expected_containers must be greater than zero",
            ));
        }

        let bind_addr = match (&self.listener, self.bind_addr) {
            (_, Some(addr)) => addr,
            (Some(listener), None) => listener.local_addr()?,
            (None, None) => net::default_bind_addr(),
        };

        let state = ServerState {
            registry: Registry::new(),
            replies: Arc::new(ReplyMap::new()),
            barrier: JoinBarrier::new(expected + 1),
            shutdown: ShutdownState::new(),
            reply_listener: RwLock::new(None),
            on_disconnect: self.on_disconnect,
            expected,
            finite: self.finite,
            drain_poll_interval: self.drain_poll_interval,
            max_frame_size: self.max_frame_size,
        };

        Ok(ContainerServer {
            state: Arc::new(state),
            bind_addr,
            listener: Mutex::new(self.listener),
            local_addr: OnceLock::new(),
            reactor: Mutex::new(None),
        })
    }
}

impl Default for ContainerServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
