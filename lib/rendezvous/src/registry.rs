// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection registry.
//!
//! The first accepted connection becomes the master; every later one is a
//! container and gets a [`ContainerDelegate`]. Only containers live in the
//! delegate table; the master is held separately so it can be closed on teardown.

use bytes::Bytes;
use dashmap::DashMap;
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{delegate::ContainerDelegate, error::RendezvousError};

/// Identity of an accepted connection, unique for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Role a connection plays in the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Not (or no longer) known to the registry.
    Unclassified,
    /// The first connection; its loss tears the server down.
    Master,
    /// Any later connection, fronted by a [`ContainerDelegate`].
    Worker,
}

/// Write side and lifecycle of one accepted socket.
///
/// Frames are queued on `outbound` and written by the connection's task on the
/// reactor, so callers on any thread can enqueue without touching the socket.
pub(crate) struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    role: Role,
    outbound: mpsc::UnboundedSender<Bytes>,
    close: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        role: Role,
        outbound: mpsc::UnboundedSender<Bytes>,
        close: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer_addr,
            role,
            outbound,
            close,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    /// Queue a payload for the writer. Fails once the connection task has exited.
    pub(crate) fn enqueue(&self, payload: Bytes) -> Result<(), RendezvousError> {
        if self.close.is_cancelled() {
            return Err(RendezvousError::ConnectionLost(self.id));
        }
        self.outbound
            .send(payload)
            .map_err(|_| RendezvousError::ConnectionLost(self.id))
    }

    pub(crate) fn close(&self) {
        self.close.cancel();
    }

    pub(crate) fn close_token(&self) -> &CancellationToken {
        &self.close
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.close.is_cancelled() && !self.outbound.is_closed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("role", &self.role)
            .field("open", &self.is_open())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: AtomicU64,
    master: OnceLock<Arc<Connection>>,
    containers: DashMap<ConnectionId, ContainerDelegate>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Role the next admitted connection would get.
    pub(crate) fn classify(&self) -> Role {
        if self.master.get().is_none() {
            Role::Master
        } else {
            Role::Worker
        }
    }

    /// Claim the master slot. Returns `false` if a master was already set.
    pub(crate) fn set_master(&self, connection: Arc<Connection>) -> bool {
        self.master.set(connection).is_ok()
    }

    pub(crate) fn master(&self) -> Option<&Arc<Connection>> {
        self.master.get()
    }

    pub(crate) fn insert_container(&self, delegate: ContainerDelegate) {
        self.containers.insert(delegate.id(), delegate);
    }

    pub(crate) fn remove_container(&self, id: ConnectionId) -> Option<ContainerDelegate> {
        self.containers.remove(&id).map(|(_, delegate)| delegate)
    }

    pub(crate) fn clear_containers(&self) {
        self.containers.clear();
    }

    pub(crate) fn container_count(&self) -> usize {
        self.containers.len()
    }

    /// Point-in-time copy of the live containers, ordered by connection id.
    pub(crate) fn snapshot(&self) -> Vec<ContainerDelegate> {
        let mut delegates: Vec<_> = self
            .containers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        delegates.sort_by_key(|delegate| delegate.id());
        delegates
    }

    pub(crate) fn role_of(&self, id: ConnectionId) -> Role {
        if self.master.get().is_some_and(|master| master.id() == id) {
            Role::Master
        } else if self.containers.contains_key(&id) {
            Role::Worker
        } else {
            Role::Unclassified
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::replies::ReplyMap;

    pub(crate) fn test_connection(
        id: u64,
        role: Role,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            ConnectionId::new(id),
            "127.0.0.1:4000".parse().unwrap(),
            role,
            tx,
            CancellationToken::new(),
        );
        (Arc::new(connection), rx)
    }

    #[test]
    fn test_first_admission_is_master() {
        let registry = Registry::new();
        assert_eq!(registry.classify(), Role::Master);

        let (master, _rx) = test_connection(0, Role::Master);
        assert!(registry.set_master(master.clone()));
        assert_eq!(registry.classify(), Role::Worker);

        let (other, _rx) = test_connection(1, Role::Master);
        assert!(!registry.set_master(other));
        assert_eq!(registry.master().unwrap().id(), master.id());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = Registry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_roles_and_snapshot() {
        let registry = Registry::new();
        let replies = Arc::new(ReplyMap::new());

        let (master, _m) = test_connection(0, Role::Master);
        registry.set_master(master);

        let mut receivers = Vec::new();
        for id in [3, 1, 2] {
            let (conn, rx) = test_connection(id, Role::Worker);
            registry.insert_container(ContainerDelegate::new(conn, replies.clone()));
            receivers.push(rx);
        }

        assert_eq!(registry.container_count(), 3);
        let ids: Vec<_> = registry.snapshot().iter().map(|d| d.id().as_u64()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        assert_eq!(registry.role_of(ConnectionId::new(0)), Role::Master);
        assert_eq!(registry.role_of(ConnectionId::new(2)), Role::Worker);
        assert_eq!(registry.role_of(ConnectionId::new(9)), Role::Unclassified);

        assert!(registry.remove_container(ConnectionId::new(2)).is_some());
        assert!(registry.remove_container(ConnectionId::new(2)).is_none());
        assert_eq!(registry.role_of(ConnectionId::new(2)), Role::Unclassified);

        registry.clear_containers();
        assert_eq!(registry.container_count(), 0);
    }

    #[test]
    fn test_enqueue_after_close_fails() {
        let (conn, mut rx) = test_connection(5, Role::Worker);
        conn.enqueue(Bytes::from_static(b"a")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "a");

        conn.close();
        assert!(!conn.is_open());
        assert!(matches!(
            conn.enqueue(Bytes::from_static(b"b")),
            Err(RendezvousError::ConnectionLost(id)) if id == ConnectionId::new(5)
        ));
    }

    #[test]
    fn test_enqueue_after_receiver_dropped_fails() {
        let (conn, rx) = test_connection(6, Role::Worker);
        drop(rx);
        assert!(!conn.is_open());
        assert!(conn.enqueue(Bytes::new()).is_err());
    }
}
