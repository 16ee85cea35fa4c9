//! Single-threaded `mio::Poll` loop wiring the splice engine to real sockets.
//!
//! Grounded on the teacher's `runtime/mio/event_loop.rs` for the dispatch
//! shape (a listener token routed to accept, everything else routed to a
//! per-connection handler) but with no worker-thread pool (see `runtime`'s
//! module doc) and a bounded poll timeout driving the periodic maintenance
//! sweep instead of the teacher's block-forever `None`.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::splice::collab::{FixedListenerRef, ForeignContext};
use crate::splice::lifecycle::HandoffOutcome;
use crate::splice::Engine;

const LISTENER_TOKEN: Token = Token(usize::MAX);

pub fn run<C: ForeignContext>(
    config: Config,
    addr: SocketAddr,
    ctx: C,
    listener_ref: FixedListenerRef,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1024);

    let mut listener = TcpListener::bind(addr)?;
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut engine = Engine::init(ctx, &config);
    let tick_interval = Duration::from_millis(config.tick_interval_ms.max(1));
    let mut last_tick = Instant::now();

    info!(
        listen = %addr,
        pipe_size = engine.pipe_size(),
        "splice engine started"
    );

    loop {
        let timeout = tick_interval.saturating_sub(last_tick.elapsed());
        match poll.poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept_all(&listener, &mut engine, poll.registry(), &listener_ref);
            } else {
                engine.on_socket_ready(poll.registry(), event.token(), event);
            }
        }

        if last_tick.elapsed() >= tick_interval {
            engine.tick(poll.registry());
            last_tick = Instant::now();
        }
    }
}

fn accept_all<C: ForeignContext>(
    listener: &TcpListener,
    engine: &mut Engine<C>,
    registry: &mio::Registry,
    listener_ref: &FixedListenerRef,
) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = %e, "event loop: accept failed");
                return;
            }
        };

        // Hand the fd's ownership to the engine; mio's wrapper is dropped
        // without closing it.
        let fd: RawFd = stream.into_raw_fd();

        match engine.accept_handoff(registry, fd, peer, listener_ref) {
            HandoffOutcome::Accepted(idx) => {
                debug!(idx, peer = %peer, "event loop: splicing connection");
            }
            HandoffOutcome::Declined => {
                debug!(peer = %peer, "event loop: declined, not loopback-to-loopback");
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }
}
