// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the rendezvous integration tests.

#![allow(dead_code)]

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use rendezvous::{ContainerClient, ContainerServer, ContainerServerBuilder};
use tokio::time::{Instant, sleep, timeout};

/// Upper bound for any single wait in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A started server bound to loopback.
pub struct TestServer {
    pub server: Arc<ContainerServer>,
    pub addr: SocketAddr,
}

impl TestServer {
    pub fn start(expected: usize) -> Self {
        Self::start_with(ContainerServer::builder().expected_containers(expected))
    }

    pub fn start_finite(expected: usize) -> Self {
        Self::start_with(
            ContainerServer::builder()
                .expected_containers(expected)
                .finite(true),
        )
    }

    pub fn start_with(builder: ContainerServerBuilder) -> Self {
        let server = builder
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .drain_poll_interval(Duration::from_millis(5))
            .build()
            .unwrap();
        let addr = server.start().unwrap();
        Self {
            server: Arc::new(server),
            addr,
        }
    }

    /// Connect the master and wait until the server has classified it.
    pub async fn connect_master(&self) -> ContainerClient {
        let client = ContainerClient::connect(self.addr).await.unwrap();
        let server = self.server.clone();
        assert!(wait_until(move || server.master_id().is_some()).await);
        client
    }

    /// Connect one container and wait until its delegate exists.
    pub async fn connect_container(&self) -> ContainerClient {
        let before = self.server.live_containers();
        let client = ContainerClient::connect(self.addr).await.unwrap();
        let server = self.server.clone();
        assert!(wait_until(move || server.live_containers() > before).await);
        client
    }

    /// Connect the master followed by `count` containers, in that order.
    pub async fn join(&self, count: usize) -> (ContainerClient, Vec<ContainerClient>) {
        let master = self.connect_master().await;
        let mut containers = Vec::with_capacity(count);
        for _ in 0..count {
            containers.push(self.connect_container().await);
        }
        (master, containers)
    }

    /// Run a blocking server call off the async workers.
    pub async fn blocking<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&ContainerServer) -> T + Send + 'static,
        T: Send + 'static,
    {
        let server = self.server.clone();
        timeout(
            TEST_TIMEOUT,
            tokio::task::spawn_blocking(move || f(&server)),
        )
        .await
        .expect("blocking server call timed out")
        .unwrap()
    }
}

/// Poll `condition` every few milliseconds until it holds or [`TEST_TIMEOUT`] passes.
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Await `future`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(TEST_TIMEOUT, future)
        .await
        .expect("operation timed out")
}
