// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Peer side of the rendezvous.
//!
//! Master and container processes both dial the coordinator with a
//! [`ContainerClient`]; which role a peer gets depends only on arrival order.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::{future::Future, net::SocketAddr};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::{
    codec::{DEFAULT_MAX_FRAME_SIZE, FrameCodec},
    error::Result,
};

/// Framed connection to a [`ContainerServer`](crate::ContainerServer).
pub struct ContainerClient {
    framed: Framed<TcpStream, FrameCodec>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl ContainerClient {
    /// Connect to the coordinator at `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_with_max_frame_size(addr, DEFAULT_MAX_FRAME_SIZE).await
    }

    /// Connect, enforcing `max_frame_size` on both directions.
    pub async fn connect_with_max_frame_size(
        addr: impl ToSocketAddrs,
        max_frame_size: usize,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        debug!("Connected to coordinator at {} from {}", peer_addr, local_addr);

        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new(Some(max_frame_size))),
            local_addr,
            peer_addr,
        })
    }

    /// Local address of this peer's socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the coordinator.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Next request from the coordinator, or `None` once it closes the connection.
    pub async fn next_request(&mut self) -> Result<Option<Bytes>> {
        match self.framed.next().await {
            Some(frame) => Ok(Some(frame?)),
            None => Ok(None),
        }
    }

    /// Send the reply to the current request.
    pub async fn reply(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_frame(payload).await
    }

    /// Write one frame regardless of whether a request is outstanding.
    pub async fn send_frame(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.framed.send(payload.into()).await?;
        Ok(())
    }

    /// Answer requests with `handler` until the coordinator closes the connection.
    ///
    /// Returns the number of requests served.
    pub async fn serve<F, Fut>(&mut self, mut handler: F) -> Result<usize>
    where
        F: FnMut(Bytes) -> Fut,
        Fut: Future<Output = Bytes>,
    {
        let mut served = 0;
        while let Some(request) = self.next_request().await? {
            let reply = handler(request).await;
            self.reply(reply).await?;
            served += 1;
        }
        debug!("Coordinator closed the connection after {} requests", served);
        Ok(served)
    }

    /// Read until the coordinator closes the connection, discarding anything received.
    ///
    /// Returns the number of frames discarded.
    pub async fn wait_closed(&mut self) -> Result<usize> {
        let mut discarded = 0;
        while self.next_request().await?.is_some() {
            discarded += 1;
        }
        Ok(discarded)
    }
}

impl std::fmt::Debug for ContainerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerClient")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameError, encode_frame};
    use crate::error::RendezvousError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_serve_until_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let coordinator = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::default());
            let mut replies = Vec::new();
            for request in ["a", "bb", "ccc"] {
                framed.send(Bytes::from_static(request.as_bytes())).await.unwrap();
                replies.push(framed.next().await.unwrap().unwrap());
            }
            replies
        });

        let mut client = ContainerClient::connect(addr).await.unwrap();
        assert_eq!(client.peer_addr(), addr);
        let served = client
            .serve(|request| async move { Bytes::from(request.len().to_string()) })
            .await
            .unwrap();
        assert_eq!(served, 3);

        let replies = coordinator.await.unwrap();
        assert_eq!(replies, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_send_frame_uses_inclusive_length() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = ContainerClient::connect(addr).await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        client.send_frame("hello").await.unwrap();
        let mut buf = [0u8; 9];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &encode_frame(b"hello").unwrap()[..]);
    }

    #[tokio::test]
    async fn test_truncated_request_is_framing_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = ContainerClient::connect(addr).await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();
        let frame = encode_frame(b"incomplete").unwrap();
        stream.write_all(&frame[..8]).await.unwrap();
        drop(stream);

        assert!(matches!(
            client.next_request().await,
            Err(RendezvousError::Framing(FrameError::Truncated { .. }))
        ));
    }

    #[tokio::test]
    async fn test_wait_closed_counts_discarded_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = ContainerClient::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::default());
        framed.send(Bytes::from_static(b"ignored")).await.unwrap();
        drop(framed);

        assert_eq!(client.wait_closed().await.unwrap(), 1);
    }
}
