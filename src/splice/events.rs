//! Connection event and flag sets.
//!
//! Named after the reference implementation's `SPLICE_CONNECT`,
//! `SPLICE_ESTABLISHED`, `OUT_WAIT_0`, ... bitmask, translated into
//! `bitflags` sets instead of raw integers.

use bitflags::bitflags;

bitflags! {
    /// Per-connection event set (`events` field of the connection record).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Events: u16 {
        /// Outbound `connect()` is in progress, waiting for writability.
        const CONNECT      = 1 << 0;
        /// Both sockets are open and pipes are allocated; steady state.
        const ESTABLISHED  = 1 << 1;
        /// Socket 0's pipe is full; waiting for socket 0 to become writable.
        const OUT_WAIT_0   = 1 << 2;
        /// Socket 1's pipe is full; waiting for socket 1 to become writable.
        const OUT_WAIT_1   = 1 << 3;
        /// Read-hangup (EPOLLRDHUP equivalent) observed on socket 0.
        const FIN_RCVD_0   = 1 << 4;
        /// Read-hangup observed on socket 1.
        const FIN_RCVD_1   = 1 << 5;
        /// Write shutdown has been issued on socket 0.
        const FIN_SENT_0   = 1 << 6;
        /// Write shutdown has been issued on socket 1.
        const FIN_SENT_1   = 1 << 7;
    }
}

bitflags! {
    /// Per-connection flag set (`flags` field of the connection record).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u8 {
        /// Connection is over IPv6 loopback (`::1`), not IPv4 (`127.0.0.0/8`).
        const V6            = 1 << 0;
        /// `SO_RCVLOWAT` is currently raised on socket 0.
        const RCVLOWAT_SET_0 = 1 << 1;
        /// `SO_RCVLOWAT` is currently raised on socket 1.
        const RCVLOWAT_SET_1 = 1 << 2;
        /// Socket 0's direction drained bytes since the low-watermark was raised.
        const RCVLOWAT_ACT_0 = 1 << 3;
        /// Socket 1's direction drained bytes since the low-watermark was raised.
        const RCVLOWAT_ACT_1 = 1 << 4;
        /// Terminal: connection is tearing down, no further transitions apply.
        const CLOSING       = 1 << 5;
    }
}

impl Events {
    /// Both directions have sent their FIN: the connection is destroyable.
    pub fn both_fin_sent(&self) -> bool {
        self.contains(Events::FIN_SENT_0) && self.contains(Events::FIN_SENT_1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_fin_sent_requires_both_sides() {
        let mut e = Events::FIN_SENT_0;
        assert!(!e.both_fin_sent());
        e |= Events::FIN_SENT_1;
        assert!(e.both_fin_sent());
    }

    #[test]
    fn flags_toggle_independently() {
        let mut f = Flags::empty();
        f.insert(Flags::RCVLOWAT_SET_0);
        assert!(f.contains(Flags::RCVLOWAT_SET_0));
        assert!(!f.contains(Flags::RCVLOWAT_SET_1));
        f.remove(Flags::RCVLOWAT_SET_0);
        assert!(f.is_empty());
    }
}
