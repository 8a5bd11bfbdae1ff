//! A uniform, callback-driven transport layer over raw IP, UDP and TCP,
//!  designed so the protocol code above it never needs to know whether it is
//!  running against a host operating system's sockets or an embedded network
//!  stack.
//!
//! ## Design goals
//!
//! * One abstraction for three transports - raw IP, UDP datagrams and TCP
//!   byte streams - with a shared buffer type and a shared event loop
//!   * each communication end is an *end point*, acquired from a fixed-size
//!     pool and identified by a generation-checked handle, so a released
//!     end point can never be operated on by accident
//! * Strictly cooperative, single threaded execution
//!   * the application drives everything by calling
//!     [`Transport::service`](transport::Transport::service) from its own
//!     main loop - a test harness, a daemon, or an embedded superloop
//!   * the core never spawns a thread or a task; no operation blocks
//!   * all notifications arrive through per-end-point event sinks, and
//!     callbacks may re-enter the transport freely
//! * Explicit resource management suited to constrained deployments
//!   * fixed end point pool, bounded buffer pool, bounded send queues
//!   * exhaustion is a recoverable, *counted* condition, never an abort
//!   * [`PacketBuf`](buffers::packet_buf::PacketBuf) is reference counted
//!     and chainable, with reserved headroom for lower-layer headers, so
//!     payloads move through the stack without copying
//! * TCP with an explicit connection state machine
//!   * flow controlled receive with application-level acknowledgement and
//!     "put back" redelivery for data that arrived too early
//!   * half-close in both directions, graceful close that flushes pending
//!     sends, abortive close that discards them
//! * One-shot timers identified by `(callback, context)`, dispatched from
//!   the same service pass as the I/O callbacks
//!
//! Out of scope here, by design: application wire protocols, TLS, and any
//!  multi-threaded socket sharing - those belong to the layers above.

pub mod addr;
pub mod buffers;
pub mod config;
pub mod end_point_pool;
pub mod error;
pub mod events;
mod raw_end_point;
mod sys;
pub mod tcp_end_point;
pub mod transport;
mod udp_end_point;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
