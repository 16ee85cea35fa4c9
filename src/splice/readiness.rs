//! Readiness controller (C5): derives the registration mask for each of a
//! connection's two sockets from its event set, and keeps `mio`'s
//! registration in sync with it.
//!
//! Grounded on `tcp_splice_conn_epoll_events()` / `tcp_splice_epoll_ctl()` in
//! the reference implementation — the table in §4.5 is a literal
//! transcription of that function's `if`/`else` chain. `mio::Interest` has
//! no direct analogue of `EPOLLRDHUP`; idiomatically, a `mio` readiness loop
//! requests `READABLE` and learns about a peer half-close from
//! `Event::is_read_closed()`, so no extra interest bit is requested for it
//! here — see `forward`/`lifecycle` for where that's read back.

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use crate::error::SpliceError;

use super::events::Events;
use super::table::Connection;

/// Encode (connection table index, socket side) into a single `mio::Token`.
pub fn token_for(idx: usize, side: usize) -> Token {
    debug_assert!(side < 2);
    Token(idx * 2 + side)
}

/// Inverse of `token_for`.
pub fn decode_token(token: Token) -> (usize, usize) {
    (token.0 / 2, token.0 % 2)
}

/// Derive the readiness interest each of the two sockets should have, per
/// §4.5's table. `None` means "not registered".
pub fn interest_masks(events: Events) -> [Option<Interest>; 2] {
    let mut masks: [Option<Interest>; 2] = [None, None];

    if events.contains(Events::ESTABLISHED) {
        if !events.contains(Events::FIN_SENT_1) {
            masks[0] = Some(Interest::READABLE);
        }
        if !events.contains(Events::FIN_SENT_0) {
            masks[1] = Some(Interest::READABLE);
        }
    } else if events.contains(Events::CONNECT) {
        masks[1] = Some(Interest::WRITABLE);
    }

    if events.contains(Events::OUT_WAIT_0) {
        masks[0] = Some(masks[0].map_or(Interest::WRITABLE, |m| m.add(Interest::WRITABLE)));
    }
    if events.contains(Events::OUT_WAIT_1) {
        masks[1] = Some(masks[1].map_or(Interest::WRITABLE, |m| m.add(Interest::WRITABLE)));
    }

    masks
}

/// Re-derive the interest masks from `conn.events` and bring `registry`'s
/// registration in sync: register sockets newly needing interest,
/// reregister ones whose interest changed, deregister ones that no longer
/// need any. Per §4.5, a registration failure is fatal for the connection
/// (caller should set CLOSING).
pub fn sync_registration(
    registry: &Registry,
    idx: usize,
    conn: &mut Connection,
) -> Result<(), SpliceError> {
    let masks = interest_masks(conn.events);

    for side in 0..2 {
        let fd = conn.sockets[side];
        let token = token_for(idx, side);
        let was_registered = conn.side_registered[side];

        match masks[side] {
            Some(interest) => {
                let mut source = SourceFd(&fd);
                let result = if was_registered {
                    registry.reregister(&mut source, token, interest)
                } else {
                    registry.register(&mut source, token, interest)
                };
                result.map_err(SpliceError::RegistrationFailed)?;
                conn.side_registered[side] = true;
            }
            None => {
                if was_registered {
                    let mut source = SourceFd(&fd);
                    let _ = registry.deregister(&mut source);
                    conn.side_registered[side] = false;
                }
            }
        }
    }

    conn.registered = conn.side_registered[0] && conn.side_registered[1];
    Ok(())
}

/// Deregister both sockets unconditionally (used when CLOSING is set, per
/// §4.5's "On CLOSING being set, deregister both sockets immediately").
pub fn deregister_both(registry: &Registry, conn: &mut Connection) {
    for side in 0..2 {
        if conn.side_registered[side] {
            let fd = conn.sockets[side];
            let mut source = SourceFd(&fd);
            let _ = registry.deregister(&mut source);
            conn.side_registered[side] = false;
        }
    }
    conn.registered = false;
}
