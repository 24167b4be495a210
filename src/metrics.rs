use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Instant,
};

/// Process-wide counters, written by the forwarders and the supervisor and
/// read by the status endpoint. All counters are monotonic except the stream
/// gauges and the connected flag.
pub struct Metrics {
    /// Peer channels established since startup.
    pub p2p_connections: AtomicU64,

    /// Currently open TCP substreams.
    pub tcp_streams: AtomicU64,

    /// Currently open UDP substreams.
    pub udp_streams: AtomicU64,

    /// Bytes forwarded in the exposer→accessor direction.
    pub bytes_up: AtomicU64,

    /// Bytes forwarded in the accessor→exposer direction.
    pub bytes_down: AtomicU64,

    /// Whether this accessor currently holds a ready session to the exposer.
    pub connected_to_host: AtomicBool,

    started: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            p2p_connections: AtomicU64::new(0),
            tcp_streams: AtomicU64::new(0),
            udp_streams: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            connected_to_host: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn add_bytes_up(&self, count: u64) {
        self.bytes_up.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, count: u64) {
        self.bytes_down.fetch_add(count, Ordering::Relaxed);
    }
}
