//! Pipe-size probing (C3) and the pool of pre-opened pipe pairs (C1).
//!
//! Grounded on `tcp_set_pipe_size()` and `tcp_splice_pipe_refill()` in the
//! reference implementation: probe the largest pipe capacity the kernel
//! actually grants once at startup, then keep a fixed-size pool of
//! nonblocking, close-on-exec pipe pairs pre-set to that capacity so the
//! hot path never pays for `pipe2()`/`fcntl()` itself.

use std::os::unix::io::RawFd;

use tracing::{debug, trace, warn};

use crate::error::SpliceError;

/// One end of a pipe pair: (read fd, write fd).
pub type PipePair = (RawFd, RawFd);

fn pipe2_nonblocking_cloexec() -> std::io::Result<PipePair> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn pipe2_cloexec_only() -> std::io::Result<PipePair> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn set_pipe_size(read_fd: RawFd, size: usize) -> std::io::Result<()> {
    let ret = unsafe { libc::fcntl(read_fd, libc::F_SETPIPE_SZ, size as libc::c_int) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn close_pair((r, w): PipePair) {
    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

/// Probe the largest pipe capacity the kernel will actually grant, starting
/// from `starting_size` and halving on failure until either every probe pipe
/// in a pool of `pool_size` accepts it, or the candidate size reaches zero
/// (in which case the starting size is restored as a best effort and
/// returned, matching the reference implementation's fallback).
///
/// Terminates within `log2(starting_size)` iterations.
pub fn probe_pipe_size(pool_size: usize, starting_size: usize) -> usize {
    let mut candidate = starting_size;

    loop {
        let mut opened = Vec::with_capacity(pool_size);
        let mut ok = true;

        for _ in 0..pool_size {
            match pipe2_cloexec_only() {
                Ok(pair) => {
                    if set_pipe_size(pair.0, candidate).is_err() {
                        close_pair(pair);
                        ok = false;
                        break;
                    }
                    opened.push(pair);
                }
                Err(e) => {
                    warn!(error = %e, "pipe-size probe: pipe2 failed");
                    ok = false;
                    break;
                }
            }
        }

        for pair in opened {
            close_pair(pair);
        }

        if ok {
            debug!(pipe_size = candidate, "pipe-size probe settled");
            return candidate;
        }

        candidate /= 2;
        if candidate == 0 {
            warn!(
                fallback = starting_size,
                "pipe-size probe exhausted candidates, restoring starting size"
            );
            return starting_size;
        }
    }
}

/// Fixed-size pool of pre-opened pipe pairs, refilled lazily.
///
/// No locking: only ever touched from the single cooperative loop thread.
pub struct PipePool {
    slots: Vec<Option<PipePair>>,
    pipe_size: usize,
}

impl PipePool {
    pub fn new(size: usize, pipe_size: usize) -> Self {
        Self {
            slots: vec![None; size],
            pipe_size,
        }
    }

    /// Iterate slots front to back; for every empty one, open a fresh
    /// nonblocking, close-on-exec pipe pair and try to raise its capacity to
    /// `pipe_size`. A capacity-set failure is logged but nonfatal — the pipe
    /// is kept at its default capacity.
    pub fn refill(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.is_some() {
                continue;
            }
            match pipe2_nonblocking_cloexec() {
                Ok(pair) => {
                    if let Err(e) = set_pipe_size(pair.0, self.pipe_size) {
                        trace!(error = %e, "pool pipe: cannot set pipe size");
                    }
                    *slot = Some(pair);
                }
                Err(e) => {
                    trace!(error = %e, "pool pipe: pipe2 failed, pool stays short");
                }
            }
        }
    }

    /// Take a pre-opened pair from the pool, if any is filled.
    pub fn take(&mut self) -> Option<PipePair> {
        for slot in self.slots.iter_mut() {
            if let Some(pair) = slot.take() {
                return Some(pair);
            }
        }
        None
    }

    /// Take a pooled pair, or open one fresh (with capacity set) on a miss.
    pub fn take_or_create(&mut self) -> Result<PipePair, SpliceError> {
        if let Some(pair) = self.take() {
            return Ok(pair);
        }
        let pair = pipe2_nonblocking_cloexec().map_err(SpliceError::PipeCreate)?;
        if let Err(e) = set_pipe_size(pair.0, self.pipe_size) {
            trace!(error = %e, "fresh pipe: cannot set pipe size");
        }
        Ok(pair)
    }

    pub fn pipe_size(&self) -> usize {
        self.pipe_size
    }

    #[cfg(test)]
    pub fn filled_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_settles_within_reasonable_iterations() {
        // Small pool, small starting size: must terminate and return a
        // positive size (real pipes on any Linux kernel).
        let size = probe_pipe_size(4, 64 * 1024);
        assert!(size > 0);
        assert!(size <= 64 * 1024);
    }

    #[test]
    fn pool_refill_fills_all_slots() {
        let mut pool = PipePool::new(4, 4096);
        assert_eq!(pool.filled_count(), 0);
        pool.refill();
        assert_eq!(pool.filled_count(), 4);

        let (r, w) = pool.take().unwrap();
        assert_eq!(pool.filled_count(), 3);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn take_or_create_never_fails_on_empty_pool() {
        let mut pool = PipePool::new(2, 4096);
        let (r, w) = pool.take_or_create().expect("fresh pipe");
        assert!(r >= 0 && w >= 0);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
