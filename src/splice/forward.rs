//! Forwarding engine (C7): the `splice(2)` read/write loop that moves bytes
//! between the two sockets of an established connection.
//!
//! Grounded on `tcp_splice_sock_handler()` in the reference implementation —
//! the direction resolution, the 90%/10% thresholds, the `SPLICE_F_MORE`
//! hint, and the retry/would-block control flow are a direct translation of
//! that function's loop, syscall for syscall. The raw `libc::splice` call
//! itself follows the only other real splice call site in the pack, the
//! `rabbit-digger-pro` Unix `splice()` FFI wrapper (same flags, same
//! would-block-on-negative-return convention).

use std::os::unix::io::RawFd;

use mio::event::Event;
use tracing::trace;

use crate::error::SpliceError;

use super::events::{Events, Flags};
use super::table::Connection;

/// What the caller (lifecycle) should do once forwarding returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep the connection as is; readiness has already been re-derived.
    Continue,
    /// Both directions are drained and FIN has propagated both ways, or an
    /// unrecoverable I/O error occurred: the caller should destroy this
    /// connection.
    Close,
}

fn raw_splice(from: RawFd, to: RawFd, len: usize, more: bool) -> std::io::Result<isize> {
    let mut flags = libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK;
    if more {
        flags |= libc::SPLICE_F_MORE;
    }
    let ret = unsafe {
        libc::splice(
            from,
            std::ptr::null_mut(),
            to,
            std::ptr::null_mut(),
            len,
            flags as libc::c_uint,
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret as isize)
    }
}

/// Which side of the connection is `from` vs. `to` for a given handler
/// invocation, mirroring `tcp_splice_dir()`. `ref_side` is the socket the
/// readiness event fired on; `reverse` is true when driven by a
/// writable-side event, where the ready socket is the destination.
fn resolve_direction(ref_side: usize, reverse: bool) -> (usize, usize) {
    if reverse {
        (1 - ref_side, ref_side)
    } else {
        (ref_side, 1 - ref_side)
    }
}

fn out_wait_flag(side: usize) -> Events {
    if side == 0 {
        Events::OUT_WAIT_0
    } else {
        Events::OUT_WAIT_1
    }
}

fn fin_rcvd_flag(side: usize) -> Events {
    if side == 0 {
        Events::FIN_RCVD_0
    } else {
        Events::FIN_RCVD_1
    }
}

fn fin_sent_flag(side: usize) -> Events {
    if side == 0 {
        Events::FIN_SENT_0
    } else {
        Events::FIN_SENT_1
    }
}

fn lowat_flags(side: usize) -> (Flags, Flags) {
    if side == 0 {
        (Flags::RCVLOWAT_SET_0, Flags::RCVLOWAT_ACT_0)
    } else {
        (Flags::RCVLOWAT_SET_1, Flags::RCVLOWAT_ACT_1)
    }
}

fn set_rcvlowat(fd: RawFd, value: libc::c_int) {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVLOWAT,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        trace!(fd, value, "forward: setsockopt(SO_RCVLOWAT) failed");
    }
}

/// Drain one direction's pipe: splice from `from` into the pipe, then from
/// the pipe into `to`, until neither side has more to move right now.
/// Returns `eof` (the source socket hit read-EOF during this pass).
fn drive_direction(
    conn: &mut Connection,
    pipe_size: usize,
    from_side: usize,
    to_side: usize,
) -> Result<bool, SpliceError> {
    let from = conn.sockets[from_side];
    let to = conn.sockets[to_side];
    let (pipe_r, pipe_w) = conn
        .pipes_for(from_side)
        .expect("drive_direction called before pipes are established");

    let (lowat_set, lowat_act) = lowat_flags(from_side);

    // `eof`/`never_read` live for the whole direction-pass, not per retry:
    // the reference implementation declares them before its `swap:` label,
    // outside the `while (1)` whose body we're about to translate, so a
    // write-side would-block after an earlier successful read within the
    // same call still sees `never_read == false` and correctly arms
    // `OUT_WAIT` instead of silently dropping the stall on the floor.
    let mut eof = false;
    let mut never_read = true;

    'passes: loop {
        // Reset once per full pass (`ssize_t to_write = 0;` at the top of
        // the reference's `while (1)` body) -- but *not* on a same-pass
        // retry below, where the original's `goto retry` skips back past
        // this initializer and `to_write` keeps accumulating.
        let mut to_write: usize = 0;
        let mut more = false;

        'retry: loop {
            let readlen = loop {
                match raw_splice(from, pipe_w, pipe_size, false) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break -1,
                    Err(e) => return Err(SpliceError::Splice(e)),
                }
            };

            if readlen < 0 {
                to_write = pipe_size;
            } else if readlen == 0 {
                eof = true;
                to_write = pipe_size;
            } else {
                never_read = false;
                to_write += readlen as usize;
                if readlen as usize >= pipe_size * 90 / 100 {
                    more = true;
                }
                if conn.flags.contains(lowat_set) {
                    conn.flags.insert(lowat_act);
                }
            }

            let written = loop {
                match raw_splice(pipe_r, to, to_write, more) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break -1,
                    Err(e) => return Err(SpliceError::Splice(e)),
                }
            };

            if readlen > 0 && readlen == written {
                conn.bytes_read[from_side] += readlen as u64;
                conn.bytes_written[from_side] += written as u64;

                if readlen as usize >= pipe_size * 10 / 100 {
                    continue 'passes;
                }

                if conn.flags.contains(lowat_set) && readlen as usize > pipe_size / 10 {
                    let lowat = (pipe_size / 4) as libc::c_int;
                    set_rcvlowat(from, lowat);
                    conn.flags.insert(lowat_set);
                    conn.flags.insert(lowat_act);
                }

                break 'passes;
            }

            conn.bytes_read[from_side] += readlen.max(0) as u64;
            conn.bytes_written[from_side] += written.max(0) as u64;

            if written < 0 {
                // would-block on the write side
                if never_read {
                    break 'passes;
                }
                conn.events.insert(out_wait_flag(to_side));
                break 'passes;
            }

            if never_read && written as usize == pipe_size {
                continue 'retry;
            }

            if !never_read && (written as usize) < to_write {
                // Partial write: loop back for a fresh read/write attempt,
                // carrying the undelivered remainder forward so the next
                // write-splice call flushes backlog plus newly-read bytes
                // in one syscall, matching the reference implementation's
                // `to_write -= written; goto retry;`.
                to_write -= written as usize;
                continue 'retry;
            }

            if eof {
                break 'passes;
            }

            // No condition above matched: the reference implementation
            // falls off the bottom of its `while (1)` body here, which
            // loops back to the top and re-initializes `to_write`/`more`.
            continue 'passes;
        }
    }

    Ok(eof)
}

/// Propagate FIN once the just-processed direction has drained to EOF: for
/// each side, if its peer signalled EOF (`FIN_RCVD_<side>`), we haven't
/// already shut our write side down towards it, and this pass's byte
/// counters are even and hit EOF, `shutdown(SHUT_WR)` and mark `FIN_SENT`.
///
/// Both sides are always checked here, even though only the just-drained
/// direction's counters could plausibly have changed — matching the
/// reference implementation, which runs this same pair of checks
/// unconditionally after every pass rather than just the one that applies.
fn propagate_fin(conn: &mut Connection, drained_side: usize, eof: bool) {
    let drained = eof && conn.bytes_read[drained_side] == conn.bytes_written[drained_side];
    if !drained {
        return;
    }

    for (rcvd_side, sent_side) in [(0usize, 1usize), (1, 0)] {
        if conn.events.contains(fin_rcvd_flag(rcvd_side)) && !conn.events.contains(fin_sent_flag(sent_side)) {
            let fd = conn.sockets[sent_side];
            unsafe {
                libc::shutdown(fd, libc::SHUT_WR);
            }
            conn.events.insert(fin_sent_flag(sent_side));
        }
    }
}

/// Handle a readiness event on `ref_side`. `pipe_size` is the pool's
/// negotiated pipe capacity. Assumes the connection is ESTABLISHED (the
/// CONNECT-state handshake is lifecycle's job, run before this is called).
pub fn on_ready(
    conn: &mut Connection,
    pipe_size: usize,
    ref_side: usize,
    event: &Event,
) -> Result<Outcome, SpliceError> {
    if event.is_error() {
        return Err(SpliceError::ReadinessError);
    }

    let writable = event.is_writable();
    let readable = event.is_readable();

    if writable {
        conn.events.remove(out_wait_flag(ref_side));
    }

    if event.is_read_closed() {
        conn.events.insert(fin_rcvd_flag(ref_side));
    }
    if event.is_write_closed() {
        conn.events.insert(fin_sent_flag(ref_side));
    }

    let (from0, to0) = resolve_direction(ref_side, writable);
    let mut passes = vec![(from0, to0)];
    if readable && writable {
        passes.push((to0, from0));
    }

    for (from_side, to_side) in passes {
        let eof = drive_direction(conn, pipe_size, from_side, to_side)?;
        propagate_fin(conn, from_side, eof);

        if conn.events.both_fin_sent() {
            return Ok(Outcome::Close);
        }
    }

    if event.is_write_closed() {
        return Ok(Outcome::Close);
    }

    Ok(Outcome::Continue)
}
