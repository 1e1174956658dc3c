// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reactor thread.
//!
//! A single OS thread drives a current-thread tokio runtime that runs the
//! accept loop and one task per accepted connection. Every accept, read and
//! disconnect hook therefore runs on this one thread.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener as TokioTcpListener, TcpStream},
    runtime::Runtime,
    sync::mpsc,
};
use tokio_util::{codec::Framed, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    codec::FrameCodec,
    delegate::ContainerDelegate,
    error::RendezvousError,
    registry::{Connection, Role},
    server::ServerState,
};

pub(crate) const THREAD_NAME: &str = "rendezvous-reactor";

/// Why a connection task stopped serving its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionExit {
    /// Closed locally, by shutdown or by a delegate close.
    Closed,
    /// Finite container delivered its reply.
    Finished,
    /// Peer closed the socket, or the stream failed.
    Lost,
    /// Peer broke the request/reply protocol.
    Violation,
}

/// Body of the reactor thread.
pub(crate) fn run(runtime: Runtime, listener: std::net::TcpListener, state: Arc<ServerState>) {
    state.shutdown.register_reactor_thread();

    if let Err(e) = runtime.block_on(accept_loop(listener, state.clone())) {
        error!("Container server reactor failed: {:#}", e);
        state.shutdown(true);
    }

    drop(runtime);
    debug!("Reactor thread exiting");
    state.shutdown.mark_terminated();
}

async fn accept_loop(listener: std::net::TcpListener, state: Arc<ServerState>) -> Result<()> {
    let listener = TokioTcpListener::from_std(listener)
        .context("Failed to convert std TcpListener to tokio TcpListener")?;
    let teardown_token = state.shutdown.teardown_token().clone();
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            biased;
            _ = teardown_token.cancelled() => {
                info!("Container server listener shutting down");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => admit(stream, peer_addr, &state, &tracker),
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
        }
    }

    // Close the listening socket before waiting on the connections
    drop(listener);
    tracker.close();
    tracker.wait().await;
    Ok(())
}

fn admit(stream: TcpStream, peer_addr: SocketAddr, state: &Arc<ServerState>, tracker: &TaskTracker) {
    if state.barrier.is_released() {
        warn!(
            "Refusing connection from {}: all expected peers have already joined",
            peer_addr
        );
        return;
    }

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on {}: {}", peer_addr, e);
    }

    let id = state.registry.next_id();
    let role = state.registry.classify();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let close = state.shutdown.teardown_token().child_token();
    let connection = Arc::new(Connection::new(id, peer_addr, role, outbound_tx, close));

    match role {
        Role::Master => {
            state.registry.set_master(connection.clone());
            info!(connection = %id, "Master connected from {}", peer_addr);
        }
        _ => {
            state
                .registry
                .insert_container(ContainerDelegate::new(connection.clone(), state.replies.clone()));
            info!(connection = %id, "Container connected from {}", peer_addr);
        }
    }
    state.barrier.count_down();

    tracker.spawn(serve_connection(stream, connection, outbound_rx, state.clone()));
}

async fn serve_connection(
    stream: TcpStream,
    connection: Arc<Connection>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    state: Arc<ServerState>,
) {
    let id = connection.id();
    let peer_addr = connection.peer_addr();
    let close = connection.close_token().clone();
    let mut framed = Framed::new(stream, FrameCodec::new(Some(state.max_frame_size)));

    let exit = loop {
        tokio::select! {
            biased;
            _ = close.cancelled() => break ConnectionExit::Closed,
            frame = framed.next() => {
                match frame {
                    Some(Ok(payload)) => {
                        if let Some(exit) = on_read(&connection, payload, &state) {
                            break exit;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, "Framing error from {}: {}", peer_addr, e);
                        break ConnectionExit::Lost;
                    }
                    None => {
                        debug!(connection = %id, "Connection from {} closed by peer", peer_addr);
                        break ConnectionExit::Lost;
                    }
                }
            }
            Some(payload) = outbound.recv() => {
                let sent = tokio::select! {
                    biased;
                    _ = close.cancelled() => break ConnectionExit::Closed,
                    sent = framed.send(payload) => sent,
                };
                if let Err(e) = sent {
                    warn!(connection = %id, "Failed to write to {}: {}", peer_addr, e);
                    break ConnectionExit::Lost;
                }
            }
        }
    };

    outbound.close();
    connection.close();
    drop(framed);
    on_disconnect(&connection, exit, &state);
}

/// Handle one decoded frame. Returns `Some` when the connection must stop.
fn on_read(connection: &Connection, payload: Bytes, state: &ServerState) -> Option<ConnectionExit> {
    let id = connection.id();
    if connection.role() == Role::Master {
        debug!(connection = %id, "Discarding {} byte frame from master", payload.len());
        return None;
    }

    let Some(handler) = state.replies.take(id) else {
        let violation =
            RendezvousError::protocol_violation(id, "frame received with no request pending");
        error!("{}; closing connection to {}", violation, connection.peer_addr());
        return Some(ConnectionExit::Violation);
    };

    debug!(connection = %id, "Reply of {} bytes received", payload.len());
    handler.on_reply(payload.clone());
    if let Some(listener) = state.reply_listener() {
        listener.on_reply(&payload);
    }

    if state.finite {
        debug!(connection = %id, "Closing finite container after its reply");
        Some(ConnectionExit::Finished)
    } else {
        None
    }
}

fn on_disconnect(connection: &Connection, exit: ConnectionExit, state: &ServerState) {
    let id = connection.id();
    match connection.role() {
        Role::Master => {
            if exit == ConnectionExit::Lost {
                warn!(connection = %id, "Master disconnected; tearing down container server");
                state.shutdown(true);
                if let Some(hook) = &state.on_disconnect {
                    hook();
                }
            }
        }
        _ => {
            state.registry.remove_container(id);
            if state.replies.abandon(id) {
                warn!(
                    connection = %id,
                    "Abandoned in-flight request to {} ({:?})",
                    connection.peer_addr(),
                    exit
                );
            }
            debug!(connection = %id, "Container {} deregistered ({:?})", connection.peer_addr(), exit);
        }
    }
}
