//! Lifecycle (C8): accept hand-off, outbound connect and its completion,
//! destruction, and the periodic maintenance sweep.
//!
//! Grounded on `tcp_splice_conn_from_sock()`, `tcp_splice_new()`,
//! `tcp_splice_connect()`, `tcp_splice_connect_finish()`,
//! `tcp_splice_destroy()` and `tcp_splice_timer()` in the reference
//! implementation.

use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;

use mio::Registry;
use tracing::{debug, trace, warn};

use crate::error::SpliceError;

use super::collab::{ForeignContext, ListenerRef, Origin};
use super::events::{Events, Flags};
use super::pipe_pool::PipePool;
use super::readiness;
use super::socket_pool::{Family, SocketPool};
use super::table::{Connection, ConnTable, Slot};

/// Outcome of handing an accepted socket to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffOutcome {
    /// A connection record was created at this table index; its outbound
    /// connect is in flight (or already finished synchronously).
    Accepted(usize),
    /// The peer wasn't loopback, or the table was full: the collaborator
    /// should handle the socket itself (e.g. the tapped path, or just drop
    /// it).
    Declined,
}

fn is_loopback(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn set_tcp_quickack(fd: RawFd) {
    let value: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        trace!(fd, "lifecycle: failed to set TCP_QUICKACK");
    }
}

/// Connect `fd` to the loopback address for `port`. Returns `Ok(true)` if
/// the connection completed synchronously (rare for a nonblocking socket),
/// `Ok(false)` if it's in progress (`EINPROGRESS`, the common case).
fn connect_loopback(fd: RawFd, v6: bool, port: u16) -> std::io::Result<bool> {
    let ret = if v6 {
        let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        addr.sin6_port = port.to_be();
        addr.sin6_addr = libc::in6_addr {
            s6_addr: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
        };
        unsafe {
            libc::connect(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    } else {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr = libc::in_addr {
            s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
        };
        unsafe {
            libc::connect(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
    };

    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok(false)
    } else {
        Err(err)
    }
}

fn open_originator_socket(v6: bool) -> Result<RawFd, SpliceError> {
    let domain = if v6 {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(SpliceError::SocketCreate)?;
    socket
        .set_nonblocking(true)
        .map_err(SpliceError::SocketCreate)?;
    Ok(std::os::unix::io::IntoRawFd::into_raw_fd(socket))
}

/// Allocate the outbound (target-side) socket and kick off its connect.
/// Mirrors `tcp_splice_new()` + `tcp_splice_connect()`.
fn connect(
    conn: &mut Connection,
    target_fd: RawFd,
    port: u16,
) -> Result<(), SpliceError> {
    conn.sockets[1] = target_fd;
    set_tcp_quickack(target_fd);

    match connect_loopback(target_fd, conn.is_v6(), port) {
        Ok(true) => {
            conn.events.insert(Events::ESTABLISHED);
        }
        Ok(false) => {
            conn.events.insert(Events::CONNECT);
        }
        Err(e) => return Err(SpliceError::Connect(e)),
    }
    Ok(())
}

/// Accept an incoming socket and, if it's loopback-to-loopback, start
/// splicing it. Mirrors `tcp_splice_conn_from_sock()`.
pub fn accept_handoff<C: ForeignContext>(
    table: &mut ConnTable,
    sock_pool: &mut SocketPool,
    ctx: &C,
    accepted: RawFd,
    peer: SocketAddr,
    listener: &dyn ListenerRef,
) -> HandoffOutcome {
    if !is_loopback(&peer) {
        return HandoffOutcome::Declined;
    }
    let v6 = matches!(peer.ip(), IpAddr::V6(_));

    set_tcp_quickack(accepted);

    let mut conn = Connection::new(accepted, -1, v6);

    let target = match listener.origin() {
        Origin::SpliceOriginator => open_originator_socket(v6),
        Origin::HostOriginator => {
            let family = if v6 { Family::V6 } else { Family::V4 };
            sock_pool.take_or_refill(ctx, family)
        }
    };

    let target_fd = match target {
        Ok(fd) => fd,
        Err(e) => {
            warn!(error = %e, "lifecycle: couldn't open connectable socket for splice");
            return HandoffOutcome::Declined;
        }
    };

    if let Err(e) = connect(&mut conn, target_fd, listener.port()) {
        warn!(error = %e, "lifecycle: connect() failed, closing splice attempt");
        conn.flags.insert(Flags::CLOSING);
    }

    match table.insert(Slot::Spliced(conn)) {
        Some(idx) => {
            debug!(idx, "lifecycle: connection accepted for splicing");
            HandoffOutcome::Accepted(idx)
        }
        None => {
            warn!("lifecycle: connection table full, declining splice");
            HandoffOutcome::Declined
        }
    }
}

/// Complete a connect: allocate the two pipe pairs and move to ESTABLISHED.
/// Mirrors `tcp_splice_connect_finish()`.
pub fn finish_connect(conn: &mut Connection, pipe_pool: &mut PipePool) -> Result<(), SpliceError> {
    let dir0 = pipe_pool.take_or_create()?;
    let dir1 = pipe_pool.take_or_create()?;
    conn.set_pipes(dir0, dir1);

    if !conn.events.contains(Events::ESTABLISHED) {
        conn.events.insert(Events::ESTABLISHED);
    }
    conn.events.remove(Events::CONNECT);
    Ok(())
}

/// Re-register a relocated connection's readiness entries at its new table
/// index. Mirrors the need for `tcp_table_compact()`'s movers to fix up
/// epoll state that's keyed by table index.
pub fn on_table_move(registry: &Registry, new_idx: usize, conn: &mut Connection) {
    if let Err(e) = readiness::sync_registration(registry, new_idx, conn) {
        warn!(idx = new_idx, error = %e, "lifecycle: re-registration after table move failed");
        conn.flags.insert(Flags::CLOSING);
    }
}

/// Close all descriptors owned by `conn`. Mirrors `tcp_splice_destroy()`,
/// except this always closes both sockets — the original only
/// unconditionally closes the accepted socket and otherwise relies on the
/// `SPLICE_CONNECT` flag having been set, which a synchronously-succeeding
/// `connect()` would skip and leak a descriptor. Always closing both avoids
/// that edge case.
pub fn destroy(conn: &mut Connection) {
    if let Some(pipes) = conn.clear_pipes() {
        for (r, w) in pipes {
            unsafe {
                libc::close(r);
                libc::close(w);
            }
        }
    }

    for &fd in &conn.sockets {
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
    conn.sockets = [-1, -1];
}

/// Per-connection maintenance: lower `SO_RCVLOWAT` back to 1 once a
/// dynamically-raised threshold has gone a full tick without triggering a
/// new raise. Mirrors `tcp_splice_timer()`'s non-CLOSING branch. Returns
/// `true` if the connection is marked `CLOSING` and should be destroyed.
pub fn tick_connection(conn: &mut Connection) -> bool {
    if conn.destroyable() {
        return true;
    }

    for side in 0..2 {
        let (set_flag, act_flag) = if side == 0 {
            (Flags::RCVLOWAT_SET_0, Flags::RCVLOWAT_ACT_0)
        } else {
            (Flags::RCVLOWAT_SET_1, Flags::RCVLOWAT_ACT_1)
        };

        if conn.flags.contains(set_flag) && !conn.flags.contains(act_flag) {
            let lowat: libc::c_int = 1;
            let ret = unsafe {
                libc::setsockopt(
                    conn.sockets[side],
                    libc::SOL_SOCKET,
                    libc::SO_RCVLOWAT,
                    &lowat as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if ret != 0 {
                trace!(fd = conn.sockets[side], "lifecycle: can't reset SO_RCVLOWAT");
            }
            conn.flags.remove(set_flag);
        }
    }

    conn.flags.remove(Flags::RCVLOWAT_ACT_0);
    conn.flags.remove(Flags::RCVLOWAT_ACT_1);
    false
}
