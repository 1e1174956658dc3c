// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Local address resolution for the default bind address.
//!
//! Containers run on other hosts, so the coordinator binds to a routable local
//! address rather than loopback unless told otherwise.

use local_ip_address::Error;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Source of the host's local IP addresses.
pub trait IpResolver {
    /// Preferred IPv4 address.
    fn local_ip(&self) -> Result<IpAddr, Error>;
    /// Preferred IPv6 address.
    fn local_ipv6(&self) -> Result<IpAddr, Error>;
}

/// [`IpResolver`] backed by the `local-ip-address` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultIpResolver;

impl IpResolver for DefaultIpResolver {
    fn local_ip(&self) -> Result<IpAddr, Error> {
        local_ip_address::local_ip()
    }

    fn local_ipv6(&self) -> Result<IpAddr, Error> {
        local_ip_address::local_ipv6()
    }
}

/// Resolve the local IP with `resolver`: IPv4 first, then IPv6, then `127.0.0.1`.
pub fn resolve_local_ip_with<R: IpResolver>(resolver: &R) -> IpAddr {
    let resolved = resolver.local_ip().or_else(|err| match err {
        Error::LocalIpAddressNotFound => resolver.local_ipv6(),
        _ => Err(err),
    });

    match resolved {
        Ok(addr) => addr,
        Err(e) => {
            tracing::debug!("Local IP resolution failed ({e}), falling back to loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Resolve the local IP with the [`DefaultIpResolver`].
pub fn resolve_local_ip() -> IpAddr {
    resolve_local_ip_with(&DefaultIpResolver)
}

/// Local IP with an OS-assigned port.
pub fn default_bind_addr() -> SocketAddr {
    SocketAddr::new(resolve_local_ip(), 0)
}

/// Format a host and port, bracketing IPv6 literals.
///
/// ```
/// use rendezvous::net::format_socket_addr;
///
/// assert_eq!(format_socket_addr("10.0.0.7", 7070), "10.0.0.7:7070");
/// assert_eq!(format_socket_addr("::1", 7070), "[::1]:7070");
/// assert_eq!(format_socket_addr("[::1]", 7070), "[::1]:7070");
/// ```
pub fn format_socket_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
