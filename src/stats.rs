/// Point-in-time stack counters, snapshotted on the packets context.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackStats {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Packets refused by the inbound ring or received while stopped.
    pub packets_dropped: u64,
    pub malformed_packets: u64,
    pub batches_flushed: u64,
    pub connections_intercepted: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    /// SYNs that found the socket pool exhausted.
    pub admission_failures: u64,
    /// Live flow count at snapshot time.
    pub connections_active: u64,
}
