//! Tunables for the delivery plane.

use std::time::Duration;

/// Timing and capacity knobs shared by every connection on an instance.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Interval between heartbeat pings on the write side.
    pub ping_period: Duration,
    /// How long the read side waits for any inbound traffic before the
    /// connection is considered dead.
    pub pong_wait: Duration,
    /// Deadline for a single socket write.
    pub write_deadline: Duration,
    /// Capacity of each connection's outbound frame queue. When the queue
    /// is full the connection is a slow consumer and gets evicted.
    pub outbound_queue_capacity: usize,
    /// Maximum inbound frame size. Oversize frames close the connection.
    pub max_frame_bytes: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_deadline: Duration::from_secs(10),
            outbound_queue_capacity: 256,
            max_frame_bytes: 512 * 1024,
        }
    }
}
