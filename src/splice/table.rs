//! Connection table binding (C4): tagged-union, index-identity connection
//! arena shared between the spliced and (out of scope) tapped TCP paths.
//!
//! Grounded on the teacher's `runtime/connection.rs` `ConnectionRegistry`
//! for the index-based insert/get/remove shape, and on the reference
//! implementation's `tcp_table_compact()` contract for *why* removal must
//! relocate the last entry into the freed slot rather than leave a hole:
//! external readiness references store only the table index (§4.4), so a
//! stable-index, hole-leaving `slab::Slab` would satisfy "identity is the
//! index" but not "no reference survives a destroy, the table compacts" —
//! this crate needs the latter, so it is a hand-rolled `Vec`-backed arena
//! instead of a slab (see DESIGN.md).

use std::os::unix::io::RawFd;

use tracing::debug;

use super::events::{Events, Flags};

pub type PipePair = (RawFd, RawFd);

/// A spliced connection record (§3).
#[derive(Debug)]
pub struct Connection {
    pub sockets: [RawFd; 2],
    /// `pipes[d]` is the pipe pair carrying bytes from `sockets[d]` to
    /// `sockets[!d]`. `None` until ESTABLISHED (§3's invariant).
    pub pipes: Option<[PipePair; 2]>,
    pub bytes_read: [u64; 2],
    pub bytes_written: [u64; 2],
    pub events: Events,
    pub flags: Flags,
    pub registered: bool,
    /// Per-socket registration state the readiness controller uses to choose
    /// `register` vs `reregister` vs `deregister`; `registered` above is the
    /// coarse "both sides in the readiness set" view §3 names.
    pub side_registered: [bool; 2],
}

impl Connection {
    pub fn new(accepted: RawFd, target: RawFd, v6: bool) -> Self {
        let mut flags = Flags::empty();
        if v6 {
            flags.insert(Flags::V6);
        }
        Self {
            sockets: [accepted, target],
            pipes: None,
            bytes_read: [0, 0],
            bytes_written: [0, 0],
            events: Events::empty(),
            flags,
            registered: false,
            side_registered: [false, false],
        }
    }

    /// Pipe pair for direction `d` (bytes flowing from `sockets[d]` to
    /// `sockets[!d]`), if pipes have been allocated (ESTABLISHED).
    pub fn pipes_for(&self, d: usize) -> Option<PipePair> {
        self.pipes.map(|pair| pair[d])
    }

    pub fn set_pipes(&mut self, dir0: PipePair, dir1: PipePair) {
        self.pipes = Some([dir0, dir1]);
    }

    pub fn clear_pipes(&mut self) -> Option<[PipePair; 2]> {
        self.pipes.take()
    }

    pub fn is_v6(&self) -> bool {
        self.flags.contains(Flags::V6)
    }

    /// Both directions drained: destroyable per §3's invariant.
    pub fn destroyable(&self) -> bool {
        self.events.both_fin_sent() || self.flags.contains(Flags::CLOSING)
    }
}

/// One table slot: either a spliced connection (what this crate implements)
/// or a tapped one (out of scope — reserved so the two paths can share one
/// table, per §1/§4.4).
pub enum Slot {
    Spliced(Connection),
    Tapped,
}

impl Slot {
    pub fn as_spliced(&self) -> Option<&Connection> {
        match self {
            Slot::Spliced(c) => Some(c),
            Slot::Tapped => None,
        }
    }

    pub fn as_spliced_mut(&mut self) -> Option<&mut Connection> {
        match self {
            Slot::Spliced(c) => Some(c),
            Slot::Tapped => None,
        }
    }
}

/// Index-identity connection arena with fill-from-end compaction on
/// removal.
///
/// Not a `slab::Slab`: removal here always swaps the last element into the
/// freed index and truncates (never leaves a hole), and callers that care
/// about relocation learn about it via the `Option<usize>` that `remove`
/// returns (the index that moved, if any, and where it moved *from* is
/// always the old last index).
pub struct ConnTable {
    slots: Vec<Slot>,
    max_connections: usize,
}

impl ConnTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: Vec::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn insert(&mut self, slot: Slot) -> Option<usize> {
        if self.slots.len() >= self.max_connections {
            return None;
        }
        self.slots.push(slot);
        Some(self.slots.len() - 1)
    }

    pub fn get(&self, idx: usize) -> Option<&Slot> {
        self.slots.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Slot> {
        self.slots.get_mut(idx)
    }

    /// Remove the slot at `idx`. If the removed slot wasn't the last one in
    /// the table, the last slot is moved into `idx` to keep the array dense
    /// (per §4.4, "the table compacts on deletion (fill-from-end)"). Returns
    /// `Some(idx)` when a relocation happened — the caller (lifecycle) must
    /// then invoke the moved record's `on_table_move` to re-register its
    /// readiness entries, since descriptors are unchanged but the index
    /// carried in readiness references is not.
    pub fn remove(&mut self, idx: usize) -> (Option<Slot>, Option<usize>) {
        if idx >= self.slots.len() {
            return (None, None);
        }
        let last = self.slots.len() - 1;
        if idx == last {
            let removed = self.slots.pop();
            return (removed, None);
        }
        let removed = self.slots.swap_remove(idx);
        debug!(from = last, to = idx, "connection table compacted");
        (Some(removed), Some(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spliced(fd: RawFd) -> Slot {
        Slot::Spliced(Connection::new(fd, fd + 100, false))
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let mut t = ConnTable::new(4);
        let a = t.insert(spliced(1)).unwrap();
        let b = t.insert(spliced(2)).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(a).unwrap().as_spliced().unwrap().sockets[0], 1);
        assert_eq!(t.get(b).unwrap().as_spliced().unwrap().sockets[0], 2);
    }

    #[test]
    fn remove_last_does_not_relocate() {
        let mut t = ConnTable::new(4);
        let a = t.insert(spliced(1)).unwrap();
        let b = t.insert(spliced(2)).unwrap();
        let (_, moved) = t.remove(b);
        assert!(moved.is_none());
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(a).unwrap().as_spliced().unwrap().sockets[0], 1);
    }

    #[test]
    fn remove_middle_relocates_last_into_the_gap() {
        // Scenario 6: create A, B, C; destroy B; C moves into B's slot.
        let mut t = ConnTable::new(4);
        let a = t.insert(spliced(1)).unwrap();
        let b = t.insert(spliced(2)).unwrap();
        let c = t.insert(spliced(3)).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        let (_, moved) = t.remove(b);
        assert_eq!(moved, Some(b));
        assert_eq!(t.len(), 2);
        // C is now at index b.
        assert_eq!(t.get(b).unwrap().as_spliced().unwrap().sockets[0], 3);
        assert_eq!(t.get(a).unwrap().as_spliced().unwrap().sockets[0], 1);
    }

    #[test]
    fn insert_respects_capacity() {
        let mut t = ConnTable::new(1);
        assert!(t.insert(spliced(1)).is_some());
        assert!(t.insert(spliced(2)).is_none());
    }
}
