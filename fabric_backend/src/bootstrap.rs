// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Bootstrap rendezvous (§4.A, §6): establishes world size, assigns
//! ranks, and exchanges opaque endpoint addresses over a plain stream
//! socket before the fabric session is used for anything else.
//!
//! Grounded on `rpcbind::server`'s `TcpListener::bind` + `SO_REUSEADDR`
//! setup and `rpc_protocol::client`'s connect-then-exchange pattern,
//! adapted from RPC call/reply framing to the fixed-width handshake §6
//! specifies.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::socket::{setsockopt, sockopt::ReuseAddr};
use std::os::fd::AsFd;

use crate::action::Rank;
use crate::error::{Error, Result};
use crate::instance::Config;

/// Result of a completed rendezvous: this process's assigned rank, and
/// the full `world_size * address_length` table in rank order.
pub struct BootstrapResult {
    pub rank: Rank,
    pub world_size: u32,
    pub address_table: Vec<u8>,
}

/// Runs the bootstrap protocol for this process, given its own opaque
/// endpoint address (already obtained from the transport per §4.A step
/// 1). `accept_timeout` is the **[AMBIENT]** bounded-accept improvement
/// noted in the Design Notes; `None` preserves the original "stuck peer
/// hangs rendezvous" semantics.
pub fn bootstrap(
    config: &Config,
    own_address: &[u8],
    accept_timeout: Option<Duration>,
) -> Result<BootstrapResult> {
    let address_length = own_address.len();
    let world_size = config.world_size;

    if world_size == 0 {
        return Err(Error::Configuration("LAIK_SIZE must be at least 1".into()));
    }
    if world_size == 1 {
        // Degenerate single-process run: this process is rank 0 and the
        // only address in the table is its own.
        return Ok(BootstrapResult {
            rank: 0,
            world_size: 1,
            address_table: own_address.to_vec(),
        });
    }

    let home_addr = resolve_home(&config.home_host, config.home_port)?;
    let want_master = check_local(&config.home_host)?;

    if want_master {
        match TcpListener::bind(home_addr) {
            Ok(listener) => {
                info!("bootstrap: acting as master on {home_addr}");
                return run_master(listener, world_size, own_address, accept_timeout);
            }
            Err(e) => {
                // Another local process already bound first; fall
                // through and connect as an ordinary peer.
                debug!("bootstrap: bind failed ({e}), falling back to peer role");
            }
        }
    }

    run_peer(home_addr, own_address, world_size)
}

fn resolve_home(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Configuration(format!("failed to resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| Error::Configuration(format!("no addresses found for {host}:{port}")))
}

/// Returns whether `host` resolves to one of this machine's local
/// interfaces (spec §6 upcall `check_local`).
pub fn check_local(host: &str) -> Result<bool> {
    let targets: Vec<SocketAddr> = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| Error::Configuration(format!("failed to resolve {host}: {e}")))?
        .collect();

    let local_addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::Configuration(format!("getifaddrs failed: {e}")))?;

    for iface in local_addrs {
        let Some(addr) = iface.address else { continue };
        let Some(ip) = addr.as_sockaddr_in().map(|a| std::net::IpAddr::V4(a.ip())).or_else(|| {
            addr.as_sockaddr_in6().map(|a| std::net::IpAddr::V6(a.ip()))
        }) else {
            continue;
        };
        if targets.iter().any(|t| t.ip() == ip) {
            return Ok(true);
        }
    }

    Ok(false)
}

fn run_master(
    listener: TcpListener,
    world_size: u32,
    own_address: &[u8],
    accept_timeout: Option<Duration>,
) -> Result<BootstrapResult> {
    setsockopt(&listener.as_fd(), ReuseAddr, &true)
        .map_err(|e| Error::Configuration(format!("SO_REUSEADDR failed: {e}")))?;

    let address_length = own_address.len();
    let mut table = vec![0u8; world_size as usize * address_length];
    table[0..address_length].copy_from_slice(own_address);

    let mut peers: Vec<TcpStream> = Vec::with_capacity(world_size as usize - 1);

    if let Some(timeout) = accept_timeout {
        listener.set_nonblocking(true)?;
        let deadline = std::time::Instant::now() + timeout;
        while peers.len() < world_size as usize - 1 {
            match listener.accept() {
                Ok((stream, _)) => peers.push(stream),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if std::time::Instant::now() >= deadline {
                        return Err(Error::Configuration(format!(
                            "bootstrap master timed out after {timeout:?} waiting for {} more peers",
                            world_size as usize - 1 - peers.len()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        listener.set_nonblocking(false)?;
    } else {
        while peers.len() < world_size as usize - 1 {
            let (stream, _) = listener.accept()?;
            peers.push(stream);
        }
    }

    for (i, stream) in peers.iter_mut().enumerate() {
        let rank = i as u32 + 1;
        let slot = &mut table[rank as usize * address_length..(rank as usize + 1) * address_length];
        stream.read_exact(slot)?;
    }

    for (i, stream) in peers.iter_mut().enumerate() {
        let rank: u32 = i as u32 + 1;
        stream.write_all(&rank.to_be_bytes())?;
        stream.write_all(&table)?;
    }

    Ok(BootstrapResult {
        rank: 0,
        world_size,
        address_table: table,
    })
}

fn run_peer(home_addr: SocketAddr, own_address: &[u8], world_size: u32) -> Result<BootstrapResult> {
    let mut stream = connect_with_retry(home_addr)?;

    stream.write_all(own_address)?;

    let mut rank_bytes = [0u8; 4];
    stream.read_exact(&mut rank_bytes)?;
    let rank = u32::from_be_bytes(rank_bytes);
    if rank == 0 || rank >= world_size {
        return Err(Error::Configuration(format!(
            "master assigned an out-of-range rank {rank} for world_size {world_size}"
        )));
    }

    let address_length = own_address.len();
    let mut table = vec![0u8; world_size as usize * address_length];
    stream.read_exact(&mut table)?;

    Ok(BootstrapResult {
        rank,
        world_size,
        address_table: table,
    })
}

/// A process may reach `connect()` before the master has called
/// `bind()`+`listen()`; §4.A does not specify a retry policy for this
/// narrow race, so a short bounded retry avoids spurious bootstrap
/// failures on process-group startup without masking a genuinely absent
/// master (it still gives up after a few seconds).
fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
    let mut last_err = None;
    for attempt in 0..50 {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if attempt == 0 {
                    warn!("bootstrap: connect to master at {addr} failed ({e}), retrying");
                }
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    Err(Error::Io(last_err.unwrap()))
}
