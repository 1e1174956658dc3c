// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reply correlation.
//!
//! A container answers requests strictly in order and one at a time, so the
//! pending handler is keyed by connection alone. Registering a second handler
//! before the first reply arrives is a protocol violation.

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;

use crate::{error::RendezvousError, registry::ConnectionId};

/// One-shot callback invoked with the next reply from a container.
pub trait ReplyHandler: Send + 'static {
    /// Consume the handler with the reply payload.
    fn on_reply(self: Box<Self>, reply: Bytes);
}

impl<F> ReplyHandler for F
where
    F: FnOnce(Bytes) + Send + 'static,
{
    fn on_reply(self: Box<Self>, reply: Bytes) {
        (*self)(reply)
    }
}

/// Observer notified of every reply from any container, after the per-request handler.
pub trait ContainerReplyListener: Send + Sync {
    /// Called once per reply.
    fn on_reply(&self, reply: &Bytes);
}

impl<F> ContainerReplyListener for F
where
    F: Fn(&Bytes) + Send + Sync,
{
    fn on_reply(&self, reply: &Bytes) {
        self(reply)
    }
}

/// At most one pending [`ReplyHandler`] per connection.
///
/// Handlers are only `Send`; the mutex makes the map shareable across threads.
#[derive(Default)]
pub(crate) struct ReplyMap {
    pending: DashMap<ConnectionId, Mutex<Box<dyn ReplyHandler>>>,
}

impl ReplyMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `id`, rejecting it if one is already pending.
    pub(crate) fn register(
        &self,
        id: ConnectionId,
        handler: Box<dyn ReplyHandler>,
    ) -> Result<(), RendezvousError> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(RendezvousError::protocol_violation(
                id,
                "a reply is already pending for this container",
            )),
            Entry::Vacant(slot) => {
                slot.insert(Mutex::new(handler));
                Ok(())
            }
        }
    }

    /// Remove and return the pending handler for `id`.
    pub(crate) fn take(&self, id: ConnectionId) -> Option<Box<dyn ReplyHandler>> {
        self.pending
            .remove(&id)
            .map(|(_, handler)| handler.into_inner())
    }

    /// Drop the pending handler for `id` without invoking it. Returns whether one was pending.
    pub(crate) fn abandon(&self, id: ConnectionId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub(crate) fn is_pending(&self, id: ConnectionId) -> bool {
        self.pending.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn test_register_then_take() {
        let map = ReplyMap::new();
        let id = ConnectionId::new(1);
        let (tx, rx) = std::sync::mpsc::channel();

        map.register(id, Box::new(move |reply: Bytes| tx.send(reply).unwrap()))
            .unwrap();
        assert!(map.is_pending(id));

        map.take(id).unwrap().on_reply(Bytes::from_static(b"done"));
        assert_eq!(rx.recv().unwrap(), "done");
        assert!(!map.is_pending(id));
        assert!(map.take(id).is_none());
    }

    #[test]
    fn test_second_register_is_protocol_violation() {
        let map = ReplyMap::new();
        let id = ConnectionId::new(7);
        let calls = Arc::new(AtomicUsize::new(0));

        let first = calls.clone();
        map.register(id, Box::new(move |_: Bytes| {
            first.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        let second = calls.clone();
        let result = map.register(id, Box::new(move |_: Bytes| {
            second.fetch_add(100, Ordering::SeqCst);
        }));
        assert!(matches!(
            result,
            Err(RendezvousError::ProtocolViolation { connection, .. }) if connection == id
        ));

        // The first handler is still the one that fires
        map.take(id).unwrap().on_reply(Bytes::new());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_are_per_connection() {
        let map = ReplyMap::new();
        map.register(ConnectionId::new(1), Box::new(|_: Bytes| {}))
            .unwrap();
        map.register(ConnectionId::new(2), Box::new(|_: Bytes| {}))
            .unwrap();
        assert_eq!(map.len(), 2);

        assert!(map.abandon(ConnectionId::new(1)));
        assert!(!map.abandon(ConnectionId::new(1)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_closure_listener() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let listener: Arc<dyn ContainerReplyListener> = Arc::new(move |reply: &Bytes| {
            counter.fetch_add(reply.len(), Ordering::SeqCst);
        });
        listener.on_reply(&Bytes::from_static(b"four"));
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }
}
