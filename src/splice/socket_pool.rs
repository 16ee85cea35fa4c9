//! Pool of connect-ready sockets opened inside the foreign network context (C2).
//!
//! Grounded on `ns_sock_pool4`/`ns_sock_pool6` and `tcp_sock_refill_ns()` in
//! the reference implementation: two pools, one per address family, each a
//! fixed-size array of socket descriptors. Empty slots hold the sentinel
//! `-1`. Refilling means entering the foreign context once (batched — the
//! context-enter is the expensive part) and opening fresh sockets for every
//! empty slot; consumers take the last filled slot.

use std::os::unix::io::RawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{trace, warn};

use crate::error::SpliceError;
use crate::splice::collab::ForeignContext;

const EMPTY: RawFd = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn domain(self) -> Domain {
        match self {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        }
    }
}

fn new_tcp_socket(family: Family) -> std::io::Result<RawFd> {
    let socket = Socket::new(family.domain(), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(std::os::unix::io::IntoRawFd::into_raw_fd(socket))
}

/// A single address family's fixed-size socket pool.
struct FamilyPool {
    slots: Vec<RawFd>,
    low_watermark: usize,
}

impl FamilyPool {
    fn new(size: usize, low_watermark: usize) -> Self {
        Self {
            slots: vec![EMPTY; size],
            low_watermark: low_watermark.min(size.saturating_sub(1)),
        }
    }

    fn needs_refill(&self) -> bool {
        self.slots
            .get(self.low_watermark)
            .map(|&fd| fd == EMPTY)
            .unwrap_or(true)
    }

    fn refill(&mut self, family: Family) {
        for slot in self.slots.iter_mut() {
            if *slot != EMPTY {
                continue;
            }
            match new_tcp_socket(family) {
                Ok(fd) => *slot = fd,
                Err(e) => {
                    trace!(error = %e, ?family, "socket pool: refill failed, pool stays short");
                }
            }
        }
    }

    /// Take the last filled slot, if any.
    fn take(&mut self) -> Option<RawFd> {
        for slot in self.slots.iter_mut().rev() {
            if *slot != EMPTY {
                let fd = *slot;
                *slot = EMPTY;
                return Some(fd);
            }
        }
        None
    }

    #[cfg(test)]
    fn filled_count(&self) -> usize {
        self.slots.iter().filter(|&&fd| fd != EMPTY).count()
    }
}

/// The two foreign-context socket pools (v4/v6).
///
/// Sockets for the *originating* context are not owned here — per §4.3 those
/// come from an analogous init-side pool owned by the collaborator that
/// accepts connections; this type only tracks sockets that must be opened
/// inside the foreign (e.g. namespace) context, since only those need the
/// expensive context-enter.
pub struct SocketPool {
    v4: FamilyPool,
    v6: FamilyPool,
}

impl SocketPool {
    pub fn new(size: usize, low_watermark: usize) -> Self {
        Self {
            v4: FamilyPool::new(size, low_watermark),
            v6: FamilyPool::new(size, low_watermark),
        }
    }

    fn pool_mut(&mut self, family: Family) -> &mut FamilyPool {
        match family {
            Family::V4 => &mut self.v4,
            Family::V6 => &mut self.v6,
        }
    }

    /// Refill both pools under pressure, batched behind a single context
    /// entry so the (expensive) context switch is paid once per trip, never
    /// on the forwarding hot path.
    pub fn refill_if_needed<C: ForeignContext>(&mut self, ctx: &C) {
        let v4_needed = self.v4.needs_refill();
        let v6_needed = self.v6.needs_refill();
        if !v4_needed && !v6_needed {
            return;
        }
        ctx.enter(|| {
            if v4_needed {
                self.v4.refill(Family::V4);
            }
            if v6_needed {
                self.v6.refill(Family::V6);
            }
        });
    }

    /// Take a pooled socket for `family`, refilling first (as a side effect,
    /// since the context-enter cost is already being paid by the caller in
    /// that case) if the pool was empty.
    pub fn take_or_refill<C: ForeignContext>(
        &mut self,
        ctx: &C,
        family: Family,
    ) -> Result<RawFd, SpliceError> {
        if let Some(fd) = self.pool_mut(family).take() {
            return Ok(fd);
        }

        ctx.enter(|| self.pool_mut(family).refill(family));

        self.pool_mut(family).take().ok_or_else(|| {
            warn!(?family, "socket pool empty after refill");
            SpliceError::PoolExhausted(std::io::Error::new(
                std::io::ErrorKind::Other,
                "socket pool exhausted after refill",
            ))
        })
    }
}
