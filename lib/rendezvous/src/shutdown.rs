// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shutdown coordination.
//!
//! **Phases**:
//! 1. **Drain**: every container is suspended; a graceful stop waits for
//!    in-flight replies, a forced stop closes each container immediately.
//! 2. **Teardown**: the registry is cleared, the master connection is closed and
//!    the teardown token is cancelled, which stops the accept loop and every
//!    connection task.
//! 3. **Release**: the join barrier is drained so nobody keeps waiting for peers
//!    that will never arrive.
//!
//! Shutdown is idempotent and never fails.

use std::{
    sync::{
        OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{barrier::JoinBarrier, server::ServerState};

/// Lifecycle flags shared between the server facade and the reactor thread.
pub(crate) struct ShutdownState {
    claimed: AtomicBool,
    teardown_token: CancellationToken,
    terminated: JoinBarrier,
    reactor_thread: OnceLock<ThreadId>,
}

impl ShutdownState {
    pub(crate) fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            teardown_token: CancellationToken::new(),
            terminated: JoinBarrier::new(1),
            reactor_thread: OnceLock::new(),
        }
    }

    /// Claim the single start of the server. Returns `false` if it was already claimed,
    /// either by a previous start or by a stop that happened first.
    pub(crate) fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// Cancel this to stop the accept loop and all connection tasks.
    pub(crate) fn teardown_token(&self) -> &CancellationToken {
        &self.teardown_token
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.teardown_token.is_cancelled()
    }

    /// Mark the reactor as finished and wake [`wait_terminated`](Self::wait_terminated).
    pub(crate) fn mark_terminated(&self) {
        self.terminated.count_down();
    }

    pub(crate) fn wait_terminated(&self) {
        self.terminated.wait_forever();
    }

    #[cfg(test)]
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.is_released()
    }

    pub(crate) fn register_reactor_thread(&self) {
        let _ = self.reactor_thread.set(thread::current().id());
    }

    pub(crate) fn on_reactor_thread(&self) -> bool {
        self.reactor_thread
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }
}

impl ServerState {
    /// Drain the containers, tear everything down and release the join barrier.
    pub(crate) fn shutdown(&self, force: bool) {
        let force = if !force && self.shutdown.on_reactor_thread() {
            warn!("Graceful stop requested from the reactor thread; forcing shutdown");
            true
        } else {
            force
        };

        info!(force, "Stopping container server");
        self.drain_containers(force);

        self.registry.clear_containers();
        if let Some(master) = self.registry.master() {
            debug!(peer = %master.peer_addr(), "Closing master connection");
            master.close();
        }
        self.shutdown.teardown_token().cancel();
        self.barrier.drain();
    }

    fn drain_containers(&self, force: bool) {
        let mut remaining = self.registry.snapshot();

        while !remaining.is_empty() {
            remaining.retain(|delegate| {
                delegate.suspend();
                if force {
                    delegate.close();
                    false
                } else {
                    delegate.is_open() && !delegate.available()
                }
            });

            if !remaining.is_empty() {
                trace!(
                    "Waiting for remaining {} containers to finish",
                    remaining.len()
                );
                thread::sleep(self.drain_poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[test]
    fn test_claim_once() {
        let state = ShutdownState::new();
        assert!(state.claim());
        assert!(!state.claim());
    }

    #[test]
    fn test_teardown_token_cancels_children() {
        let state = ShutdownState::new();
        let child = state.teardown_token().child_token();
        assert!(!state.is_torn_down());

        state.teardown_token().cancel();
        assert!(state.is_torn_down());
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_reactor_thread_detection() {
        let state = Arc::new(ShutdownState::new());
        assert!(!state.on_reactor_thread());

        let reactor = {
            let state = state.clone();
            thread::spawn(move || {
                state.register_reactor_thread();
                state.on_reactor_thread()
            })
        };
        assert!(reactor.join().unwrap());
        assert!(!state.on_reactor_thread());
    }

    #[test]
    fn test_wait_terminated() {
        let state = Arc::new(ShutdownState::new());
        let waiter = {
            let state = state.clone();
            thread::spawn(move || state.wait_terminated())
        };
        thread::sleep(Duration::from_millis(10));
        state.mark_terminated();
        waiter.join().unwrap();
    }
}
