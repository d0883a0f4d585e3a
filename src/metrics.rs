/// Basic metrics gathered from a running server, refreshed once per tick.
#[derive(Debug, Clone, Default)]
pub struct ServerMetrics {
    /// Total number of bytes read by the server since start.
    pub total_read: u64,

    /// Total number of bytes written by the server since start.
    pub total_written: u64,

    /// Number of bytes read by the server during the last second.
    pub read_last_second: u64,

    /// Number of bytes written by the server during the last second.
    pub written_last_second: u64,

    /// Number of currently connected clients.
    pub connections: usize,

    /// Number of active connection threads, as reported by the forking
    /// strategy.
    pub threads: usize,
}
