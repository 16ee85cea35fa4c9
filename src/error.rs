//! Internal error domain for the splice engine.
//!
//! Per the engine's error-handling contract, none of these ever escape to a
//! collaborator: the lifecycle layer catches every one of them and
//! downgrades the connection to `CLOSING` (§7). They exist so that the
//! engine's internals can use `?` instead of hand-threading control flow,
//! and so failures are logged with a concrete cause.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpliceError {
    #[error("failed to create pipe pair: {0}")]
    PipeCreate(#[source] std::io::Error),

    #[error("failed to create socket: {0}")]
    SocketCreate(#[source] std::io::Error),

    #[error("connect() failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("splice() failed: {0}")]
    Splice(#[source] std::io::Error),

    #[error("readiness registration failed: {0}")]
    RegistrationFailed(#[source] std::io::Error),

    #[error("socket pool exhausted and direct open failed: {0}")]
    PoolExhausted(#[source] std::io::Error),

    #[error("readiness error event reported on socket")]
    ReadinessError,
}
