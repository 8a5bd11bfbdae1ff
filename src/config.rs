use crate::error::{NetError, NetResult};

/// Sizing and flow control knobs of the transport core. All capacities are
///  fixed at construction time - the core never grows its pools while running,
///  which is what makes exhaustion an observable, recoverable condition
///  instead of unbounded memory growth.
pub struct NetConfig {
    /// Number of end point slots. Acquiring an end point beyond this fails
    ///  with `ResourceExhausted`, which the caller is expected to handle
    ///  (e.g. by rejecting an inbound connection). This is the dominant
    ///  resource limit in constrained deployments, so exhaustion is counted
    ///  and exposed through the statistics.
    pub max_end_points: usize,

    /// Payload capacity of a pooled packet buffer. Receives are chunked at
    ///  this size; a TCP delivery may chain several buffers.
    ///
    /// The default leaves room for a full Ethernet frame's payload. Choosing
    ///  this value close to the path MTU avoids wasted buffer memory for
    ///  datagram traffic.
    pub buffer_capacity: usize,

    /// Number of free buffers retained for reuse - buffers in excess of this
    ///  are dropped when their last owner releases them.
    pub buffer_pool_retain: usize,

    /// Upper bound on simultaneously live buffers. Allocation beyond this
    ///  fails with `ResourceExhausted`.
    pub max_buffers_in_flight: usize,

    /// Bytes delivered to the application but not yet acknowledged via
    ///  `tcp_ack_receive` before the core stops reading from a TCP socket.
    ///  Backpressure then propagates to the peer through the kernel's own
    ///  receive window.
    pub tcp_receive_window: usize,

    /// Upper bound in bytes on a TCP end point's unflushed send queue.
    ///  `tcp_send` beyond this fails with `ResourceExhausted` so the caller
    ///  can defer.
    pub tcp_send_queue_limit: usize,

    /// Datagrams queued on a raw/UDP end point when the socket send buffer is
    ///  full. Further sends fail with `ResourceExhausted`.
    pub datagram_send_queue_limit: usize,

    /// Datagrams handed to one end point's callback within a single service
    ///  pass, so one busy socket cannot starve the others.
    pub max_datagrams_per_pass: usize,
}

impl NetConfig {
    pub fn validate(&self) -> NetResult<()> {
        if self.max_end_points == 0 {
            return Err(NetError::Configuration(
                "max_end_points must be at least 1".to_owned(),
            ));
        }
        if self.buffer_capacity < 128 {
            return Err(NetError::Configuration(
                "buffer_capacity below 128 bytes cannot hold a useful datagram".to_owned(),
            ));
        }
        if self.max_buffers_in_flight == 0 {
            return Err(NetError::Configuration(
                "max_buffers_in_flight must be at least 1".to_owned(),
            ));
        }
        if self.tcp_receive_window < self.buffer_capacity {
            return Err(NetError::Configuration(
                "tcp_receive_window must hold at least one buffer".to_owned(),
            ));
        }
        if self.tcp_send_queue_limit < self.buffer_capacity {
            return Err(NetError::Configuration(
                "tcp_send_queue_limit must hold at least one buffer".to_owned(),
            ));
        }
        if self.max_datagrams_per_pass == 0 {
            return Err(NetError::Configuration(
                "max_datagrams_per_pass must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for NetConfig {
    fn default() -> NetConfig {
        NetConfig {
            max_end_points: 64,
            buffer_capacity: 1536,
            buffer_pool_retain: 256,
            max_buffers_in_flight: 4096,
            tcp_receive_window: 64 * 1024,
            tcp_send_queue_limit: 256 * 1024,
            datagram_send_queue_limit: 64,
            max_datagrams_per_pass: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(NetConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::no_end_points(NetConfig { max_end_points: 0, ..NetConfig::default() })]
    #[case::tiny_buffers(NetConfig { buffer_capacity: 64, ..NetConfig::default() })]
    #[case::no_buffers(NetConfig { max_buffers_in_flight: 0, ..NetConfig::default() })]
    #[case::window_below_buffer(NetConfig { tcp_receive_window: 512, ..NetConfig::default() })]
    #[case::send_queue_below_buffer(NetConfig { tcp_send_queue_limit: 512, ..NetConfig::default() })]
    #[case::no_receives_per_pass(NetConfig { max_datagrams_per_pass: 0, ..NetConfig::default() })]
    fn test_validate_rejects(#[case] config: NetConfig) {
        assert!(matches!(
            config.validate(),
            Err(NetError::Configuration(_))
        ));
    }
}
