//! The spliced TCP forwarding engine.
//!
//! `Engine` owns every piece of per-process state the splice path needs —
//! the connection table, the pipe and socket pools, and the foreign-context
//! collaborator — and exposes the handful of operations a readiness-driven
//! driver calls into: accept a socket, dispatch a readiness event, run the
//! periodic maintenance sweep.

pub mod collab;
pub mod events;
pub mod forward;
pub mod lifecycle;
pub mod pipe_pool;
pub mod readiness;
pub mod socket_pool;
pub mod table;

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use mio::event::Event;
use mio::{Registry, Token};
use tracing::warn;

use crate::config::Config;

use collab::{ForeignContext, ListenerRef};
use events::{Events, Flags};
use lifecycle::HandoffOutcome;
use pipe_pool::PipePool;
use socket_pool::SocketPool;
use table::ConnTable;

pub struct Engine<C: ForeignContext> {
    table: ConnTable,
    pipe_pool: PipePool,
    sock_pool: SocketPool,
    ctx: C,
    pipe_size: usize,
}

impl<C: ForeignContext> Engine<C> {
    /// Probe the usable pipe size, pre-fill both pools, and build an empty
    /// connection table. Mirrors `tcp_splice_init()`.
    pub fn init(ctx: C, config: &Config) -> Self {
        let pipe_size = pipe_pool::probe_pipe_size(config.pipe_pool_size, config.starting_pipe_size);
        let mut pipe_pool = PipePool::new(config.pipe_pool_size, pipe_size);
        pipe_pool.refill();

        let mut sock_pool = SocketPool::new(config.sock_pool_size, config.sock_pool_low_watermark);
        sock_pool.refill_if_needed(&ctx);

        Self {
            table: ConnTable::new(config.max_connections),
            pipe_pool,
            sock_pool,
            ctx,
            pipe_size,
        }
    }

    pub fn pipe_size(&self) -> usize {
        self.pipe_size
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Hand an accepted socket to the engine. On acceptance, registers its
    /// readiness interests; on error mid-setup, tears the attempt down
    /// immediately rather than leaving a half-built record behind.
    pub fn accept_handoff(
        &mut self,
        registry: &Registry,
        accepted: RawFd,
        peer: SocketAddr,
        listener: &dyn ListenerRef,
    ) -> HandoffOutcome {
        let outcome = lifecycle::accept_handoff(
            &mut self.table,
            &mut self.sock_pool,
            &self.ctx,
            accepted,
            peer,
            listener,
        );
        if let HandoffOutcome::Accepted(idx) = outcome {
            self.sync_after_change(registry, idx);
        }
        outcome
    }

    /// Dispatch a readiness event for one of a connection's two sockets,
    /// identified by `token` (see `readiness::token_for`).
    pub fn on_socket_ready(&mut self, registry: &Registry, token: Token, event: &Event) {
        let (idx, side) = readiness::decode_token(token);
        let Some(conn) = self
            .table
            .get_mut(idx)
            .and_then(|slot| slot.as_spliced_mut())
        else {
            return;
        };

        if conn.events.contains(Events::CONNECT) {
            if event.is_error() || !event.is_writable() {
                conn.flags.insert(Flags::CLOSING);
            } else if let Err(e) = lifecycle::finish_connect(conn, &mut self.pipe_pool) {
                warn!(idx, error = %e, "engine: failed to finish connect");
                conn.flags.insert(Flags::CLOSING);
            }
        }

        if !conn.flags.contains(Flags::CLOSING) && conn.events.contains(Events::ESTABLISHED) {
            match forward::on_ready(conn, self.pipe_size, side, event) {
                Ok(forward::Outcome::Close) => conn.flags.insert(Flags::CLOSING),
                Ok(forward::Outcome::Continue) => {}
                Err(e) => {
                    warn!(idx, error = %e, "engine: forwarding error");
                    conn.flags.insert(Flags::CLOSING);
                }
            }
        }

        self.sync_after_change(registry, idx);
    }

    /// Periodic maintenance: lower `SO_RCVLOWAT` back down on quiet
    /// connections, destroy anything marked `CLOSING`, and keep the pools
    /// topped up. Mirrors `tcp_splice_timer()` run over every connection,
    /// plus `tcp_splice_refill()`.
    pub fn tick(&mut self, registry: &Registry) {
        let mut idx = 0;
        while idx < self.table.len() {
            let closing = match self.table.get_mut(idx).and_then(|s| s.as_spliced_mut()) {
                Some(conn) => lifecycle::tick_connection(conn),
                None => false,
            };
            if closing {
                self.destroy_at(registry, idx);
            } else {
                idx += 1;
            }
        }

        self.sock_pool.refill_if_needed(&self.ctx);
        self.pipe_pool.refill();
    }

    /// Re-derive readiness registration after any event/flag change; if
    /// that leaves the connection `CLOSING`, destroy it immediately rather
    /// than waiting for the next tick.
    fn sync_after_change(&mut self, registry: &Registry, idx: usize) {
        let Some(conn) = self
            .table
            .get_mut(idx)
            .and_then(|slot| slot.as_spliced_mut())
        else {
            return;
        };

        if conn.destroyable() {
            readiness::deregister_both(registry, conn);
            self.destroy_at(registry, idx);
            return;
        }

        if let Err(e) = readiness::sync_registration(registry, idx, conn) {
            warn!(idx, error = %e, "engine: readiness registration failed");
            conn.flags.insert(Flags::CLOSING);
            readiness::deregister_both(registry, conn);
            self.destroy_at(registry, idx);
        }
    }

    fn destroy_at(&mut self, registry: &Registry, idx: usize) {
        if let Some(conn) = self
            .table
            .get_mut(idx)
            .and_then(|slot| slot.as_spliced_mut())
        {
            lifecycle::destroy(conn);
        }

        let (_, moved) = self.table.remove(idx);
        if let Some(new_idx) = moved {
            if let Some(conn) = self
                .table
                .get_mut(new_idx)
                .and_then(|slot| slot.as_spliced_mut())
            {
                lifecycle::on_table_move(registry, new_idx, conn);
            }
        }
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::splice::collab::{FixedListenerRef, LocalContext, Origin};
    use crate::splice::lifecycle::HandoffOutcome;
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
    use std::os::unix::io::IntoRawFd;
    use std::time::{Duration, Instant};

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".into(),
            pipe_pool_size: 2,
            starting_pipe_size: 64 * 1024,
            sock_pool_size: 2,
            sock_pool_low_watermark: 1,
            max_connections: 8,
            tick_interval_ms: 1000,
            log_level: "info".into(),
        }
    }

    /// Spawns a plain echo server on loopback and returns its port.
    fn spawn_echo_target() -> u16 {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        port
    }

    /// Drives `poll` in a bounded loop, dispatching every non-listener
    /// readiness event to `engine`, until `done` reports true or the
    /// deadline passes. Returns whether `done` was satisfied.
    fn drive_until<C: ForeignContext>(
        poll: &mut mio::Poll,
        engine: &mut Engine<C>,
        mut done: impl FnMut(&Engine<C>) -> bool,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = mio::Events::with_capacity(32);
        loop {
            if done(engine) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if poll
                .poll(&mut events, Some(Duration::from_millis(50)))
                .is_err()
            {
                continue;
            }
            for event in events.iter() {
                engine.on_socket_ready(poll.registry(), event.token(), event);
            }
        }
    }

    /// Accepts one connection from `listener` and hands it off to `engine`,
    /// returning the table index it landed at.
    fn accept_one<C: ForeignContext>(
        listener: &mio::net::TcpListener,
        engine: &mut Engine<C>,
        registry: &mio::Registry,
        target_port: u16,
    ) -> usize {
        let listener_ref = FixedListenerRef {
            port: target_port,
            origin: Origin::HostOriginator,
        };
        let (stream, peer) = listener.accept().unwrap();
        let fd = stream.into_raw_fd();
        match engine.accept_handoff(registry, fd, peer, &listener_ref) {
            HandoffOutcome::Accepted(idx) => idx,
            HandoffOutcome::Declined => panic!("loopback peer was declined"),
        }
    }

    /// Scenario 1 + 5: a source writes a small message, the target echoes
    /// it back, and the outbound connect (necessarily asynchronous even to
    /// loopback) is observed to transition CONNECT -> ESTABLISHED exactly
    /// once, allocating pipes at that point.
    #[test]
    fn immediate_echo_and_deferred_connect() {
        let target_port = spawn_echo_target();

        let mut poll = mio::Poll::new().unwrap();
        let mut source_listener =
            mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let source_addr = source_listener.local_addr().unwrap();
        poll.registry()
            .register(&mut source_listener, mio::Token(usize::MAX), mio::Interest::READABLE)
            .unwrap();

        let mut engine = Engine::init(LocalContext, &test_config());

        let client = std::thread::spawn(move || {
            let mut stream = StdTcpStream::connect(source_addr).unwrap();
            stream.write_all(b"hello\n").unwrap();
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello\n");
            drop(stream);
        });

        // Wait for the listener to become readable, then hand off.
        let mut events = mio::Events::with_capacity(8);
        let idx = loop {
            poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
            if events.iter().any(|e| e.token() == mio::Token(usize::MAX)) {
                break accept_one(&source_listener, &mut engine, poll.registry(), target_port);
            }
        };

        // Pipes aren't allocated until the outbound connect finishes.
        let pre_connect_has_pipes = matches!(
            engine.table.get(idx).and_then(|s| s.as_spliced()),
            Some(c) if c.pipes.is_some()
        );
        assert!(!pre_connect_has_pipes, "pipes allocated before ESTABLISHED");

        let established = drive_until(&mut poll, &mut engine, |e| {
            matches!(
                e.table.get(idx).and_then(|s| s.as_spliced()),
                Some(c) if c.events.contains(events::Events::ESTABLISHED)
            )
        });
        assert!(established, "connect never finished");
        assert!(matches!(
            engine.table.get(idx).and_then(|s| s.as_spliced()),
            Some(c) if c.pipes.is_some()
        ));

        // Joined only after the connection is fully torn down: the echo
        // round trip and the client's own close both still need the poll
        // loop to keep running, and nothing else drives it here.
        let drained = drive_until(&mut poll, &mut engine, |e| e.is_empty());
        assert!(drained, "connection was never destroyed");

        client.join().unwrap();
    }

    /// Scenario 3: source shuts down writing after sending its share, target
    /// replies then closes; the connection is destroyed once both
    /// directions have drained and shut down.
    #[test]
    fn half_close_propagates_both_ways() {
        let port = {
            let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            std::thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                stream.read_exact(&mut buf).unwrap();
                stream.write_all(&[2u8; 2048]).unwrap();
                stream.shutdown(std::net::Shutdown::Write).unwrap();
            });
            port
        };

        let mut poll = mio::Poll::new().unwrap();
        let mut source_listener =
            mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let source_addr = source_listener.local_addr().unwrap();
        poll.registry()
            .register(&mut source_listener, mio::Token(usize::MAX), mio::Interest::READABLE)
            .unwrap();

        let mut engine = Engine::init(LocalContext, &test_config());

        let client = std::thread::spawn(move || {
            let mut stream = StdTcpStream::connect(source_addr).unwrap();
            stream.write_all(&[1u8; 1024]).unwrap();
            stream.shutdown(std::net::Shutdown::Write).unwrap();
            let mut out = Vec::new();
            stream.read_to_end(&mut out).unwrap();
            assert_eq!(out.len(), 2048);
        });

        let mut events = mio::Events::with_capacity(8);
        loop {
            poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
            if events.iter().any(|e| e.token() == mio::Token(usize::MAX)) {
                accept_one(&source_listener, &mut engine, poll.registry(), port);
                break;
            }
        }

        // See the comment in `immediate_echo_and_deferred_connect`: the
        // client's `read_to_end` only unblocks once the engine has spliced
        // the target's reply through, which needs the poll loop still
        // running, so join it only after the connection is destroyed.
        let drained = drive_until(&mut poll, &mut engine, |e| e.is_empty());
        assert!(drained, "half-closed connection was never destroyed");

        client.join().unwrap();
    }

    /// Scenario 4: a non-loopback peer is declined without touching any
    /// pool or table slot.
    #[test]
    fn declined_handoff_consumes_nothing() {
        let mut engine = Engine::init(LocalContext, &test_config());
        let poll = mio::Poll::new().unwrap();
        let peer: std::net::SocketAddr = "203.0.113.5:9".parse().unwrap();
        let listener_ref = FixedListenerRef {
            port: 9,
            origin: Origin::HostOriginator,
        };

        // A closed dummy fd stands in for "some accepted socket"; it's
        // never touched since the peer check runs first.
        let dummy = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let fd = dummy.into_raw_fd();

        let outcome = engine.accept_handoff(poll.registry(), fd, peer, &listener_ref);
        assert_eq!(outcome, HandoffOutcome::Declined);
        assert!(engine.is_empty());

        unsafe {
            libc::close(fd);
        }
    }

    /// Deterministic xorshift64 stream, used instead of a `rand` dependency
    /// since the point here is a reproducible sequence both ends can
    /// checksum independently, not cryptographic quality.
    fn xorshift_fill(buf: &mut [u8], mut state: u64) {
        let mut i = 0;
        while i < buf.len() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let chunk = state.to_le_bytes();
            let n = chunk.len().min(buf.len() - i);
            buf[i..i + n].copy_from_slice(&chunk[..n]);
            i += n;
        }
    }

    fn fold_checksum(acc: u64, data: &[u8]) -> u64 {
        data.iter()
            .fold(acc, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u64))
    }

    /// Scenario 2: a large (64 MiB) transfer through a deliberately small
    /// pipe pool forces `drive_direction` through many read/write-splice
    /// passes, including genuine partial writes and write-side would-block
    /// once the target's kernel socket buffer fills — exactly the sustained
    /// multi-pass, backpressured path that only running the loop a handful
    /// of times never reaches. Expects the target to see every byte, in
    /// order, with nothing dropped or duplicated.
    #[test]
    fn large_transfer_checksum_matches_no_data_loss() {
        const SIZE: usize = 64 * 1024 * 1024;
        const SEED: u64 = 0x9E3779B97F4A7C15;

        let mut payload = vec![0u8; SIZE];
        xorshift_fill(&mut payload, SEED);
        let expected_checksum = fold_checksum(0, &payload);

        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let target_port = listener.local_addr().unwrap().port();
        let target = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64 * 1024];
            let mut checksum = 0u64;
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        checksum = fold_checksum(checksum, &buf[..n]);
                        total += n;
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            (total, checksum)
        });

        let mut poll = mio::Poll::new().unwrap();
        let mut source_listener =
            mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let source_addr = source_listener.local_addr().unwrap();
        poll.registry()
            .register(&mut source_listener, mio::Token(usize::MAX), mio::Interest::READABLE)
            .unwrap();

        // Small pipes relative to the transfer size so the forwarding loop
        // has to run many passes instead of draining everything in one or
        // two `splice()` calls.
        let mut config = test_config();
        config.starting_pipe_size = 64 * 1024;
        config.pipe_pool_size = 2;
        let mut engine = Engine::init(LocalContext, &config);

        let client = std::thread::spawn(move || {
            let mut stream = StdTcpStream::connect(source_addr).unwrap();
            stream.write_all(&payload).unwrap();
            stream.shutdown(std::net::Shutdown::Write).unwrap();
        });

        let mut events = mio::Events::with_capacity(8);
        loop {
            poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
            if events.iter().any(|e| e.token() == mio::Token(usize::MAX)) {
                accept_one(&source_listener, &mut engine, poll.registry(), target_port);
                break;
            }
        }

        let deadline = Instant::now() + Duration::from_secs(60);
        let mut drained = false;
        let mut poll_events = mio::Events::with_capacity(64);
        while Instant::now() < deadline {
            if engine.is_empty() {
                drained = true;
                break;
            }
            if poll
                .poll(&mut poll_events, Some(Duration::from_millis(50)))
                .is_err()
            {
                continue;
            }
            for event in poll_events.iter() {
                engine.on_socket_ready(poll.registry(), event.token(), event);
            }
        }
        assert!(drained, "large transfer connection was never destroyed");

        client.join().unwrap();
        let (total, actual_checksum) = target.join().unwrap();

        assert_eq!(total, SIZE, "target did not receive every byte");
        assert_eq!(
            actual_checksum, expected_checksum,
            "byte stream corrupted or reordered in transit"
        );
    }
}
