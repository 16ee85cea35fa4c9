//! loopsplice: zero-copy TCP forwarding for loopback-local connections
//!
//! Accepts TCP connections and, for peers on loopback (127.0.0.0/8 or ::1),
//! forwards bytes to a local destination using `splice(2)` through kernel
//! pipes instead of copying through user space.

mod config;
mod error;
mod runtime;
mod splice;

use config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        pipe_pool_size = config.pipe_pool_size,
        starting_pipe_size = config.starting_pipe_size,
        max_connections = config.max_connections,
        "Starting loopsplice"
    );

    if let Err(e) = runtime::run(config) {
        error!(error = %e, "loopsplice exited with error");
        return Err(Box::new(e));
    }

    Ok(())
}
