// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Countdown latch used to wait for the master and every container to connect.
//!
//! The barrier starts at `expected + 1` and is decremented once per accepted
//! connection. Shutdown drains it to zero so that blocked waiters wake up; a
//! drained barrier reports `false` to its waiters since not everyone joined.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct State {
    remaining: usize,
    arrived: usize,
    drained: bool,
}

/// Thread-safe countdown latch.
#[derive(Debug)]
pub struct JoinBarrier {
    state: Mutex<State>,
    released: Condvar,
}

impl JoinBarrier {
    /// Create a barrier that releases after `count` calls to [`count_down`](Self::count_down).
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(State {
                remaining: count,
                arrived: 0,
                drained: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Arrivals still outstanding.
    pub fn count(&self) -> usize {
        self.state.lock().remaining
    }

    /// Arrivals recorded by [`count_down`](Self::count_down). Unaffected by [`drain`](Self::drain).
    pub fn arrived(&self) -> usize {
        self.state.lock().arrived
    }

    /// `true` once the count has reached zero, by arrivals or by [`drain`](Self::drain).
    pub fn is_released(&self) -> bool {
        self.count() == 0
    }

    /// Record one arrival. Saturates at zero.
    pub fn count_down(&self) {
        let mut state = self.state.lock();
        if state.remaining == 0 {
            return;
        }
        state.remaining -= 1;
        state.arrived += 1;
        if state.remaining == 0 {
            self.released.notify_all();
        }
    }

    /// Force the count to zero and wake all waiters.
    ///
    /// Waiters observe `false` if arrivals were still outstanding at the time of the drain.
    pub fn drain(&self) {
        let mut state = self.state.lock();
        if state.remaining > 0 {
            state.drained = true;
            state.remaining = 0;
        }
        self.released.notify_all();
    }

    /// Block until the count reaches zero or `timeout` elapses.
    ///
    /// Returns `true` only if every arrival was recorded. A timeout too large to
    /// represent as a deadline waits without one.
    pub fn wait(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait_forever();
        };
        let mut state = self.state.lock();
        while state.remaining > 0 {
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return state.remaining == 0 && !state.drained;
            }
        }
        !state.drained
    }

    /// Block until the count reaches zero.
    pub fn wait_forever(&self) -> bool {
        let mut state = self.state.lock();
        while state.remaining > 0 {
            self.released.wait(&mut state);
        }
        !state.drained
    }
}
