//! Single-threaded readiness-driven runtime for the splice engine.
//!
//! Unlike a general-purpose cache server, nothing here needs a worker pool:
//! the splice engine's own invariant is that exactly one thread ever touches
//! connection state, so the only useful backend is a single `mio::Poll`
//! loop. See `event_loop` for the loop itself.

pub mod event_loop;

use crate::config::Config;
use crate::splice::collab::{FixedListenerRef, LocalContext, Origin};

/// Run the splice forwarder until the process is killed.
pub fn run(config: Config) -> std::io::Result<()> {
    let addr: std::net::SocketAddr = config
        .listen
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // The fixed listener forwards every accepted connection to the same
    // destination port it was accepted on; in production this comes from a
    // listening collaborator's routing policy (out of scope here).
    let listener_ref = FixedListenerRef {
        port: addr.port(),
        origin: Origin::HostOriginator,
    };

    event_loop::run(config, addr, LocalContext, listener_ref)
}
