use std::io;

/// A convenience wrapper around `Result` for [`NetError`].
pub type NetResult<T> = Result<T, NetError>;

/// Failure conditions of the transport core.
///
/// All endpoint-level failures that happen asynchronously are reported through
/// the endpoint's own error callback; the variants here also double as the
/// synchronous return channel for setup-time failures. The service loop itself
/// never unwinds.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum NetError {
    /// No buffer or end point slot is available. This is a normal, recoverable
    ///  condition - callers retry, defer, or reject the triggering work.
    #[error("resource exhausted: no free {0}")]
    ResourceExhausted(&'static str),

    /// The operation is not legal for the end point's current state, including
    ///  operations on a handle whose end point was already released.
    #[error("invalid in the current end point state: {0}")]
    InvalidState(&'static str),

    /// Malformed address, length or parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The peer or the underlying transport failed (connection reset, ICMP
    ///  error, socket failure). The affected connection is torn down by the
    ///  implementation.
    #[error("peer or transport failure")]
    Peer(#[source] io::Error),

    /// Bad bind / interface / socket parameters at setup time. Fatal to the
    ///  operation, never to the process.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl NetError {
    pub(crate) fn config(context: &str, e: io::Error) -> NetError {
        NetError::Configuration(format!("{}: {}", context, e))
    }

    pub(crate) fn stale_handle() -> NetError {
        NetError::InvalidState("end point handle is stale")
    }
}
