use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::source::SourceProto;

/// Process-wide counters updated by the core and read by the metrics
/// exporter. All updates are lock-free.
#[derive(Debug, Default)]
pub struct Stats {
    publishers_connected: AtomicI64,
    readers_connected: AtomicI64,
    sources_rtsp_idle: AtomicI64,
    sources_rtsp_running: AtomicI64,
    sources_rtmp_idle: AtomicI64,
    sources_rtmp_running: AtomicI64,
    bytes_received: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_publisher(&self) {
        self.publishers_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_publisher(&self) {
        self.publishers_connected.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_reader(&self) {
        self.readers_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_reader(&self) {
        self.readers_connected.fetch_sub(1, Ordering::Relaxed);
    }

    /// A managed source exists but is not connected.
    pub fn add_idle_source(&self, proto: SourceProto) {
        self.idle_gauge(proto).fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_idle_source(&self, proto: SourceProto) {
        self.idle_gauge(proto).fetch_sub(1, Ordering::Relaxed);
    }

    /// A managed source established its upstream session.
    pub fn source_started(&self, proto: SourceProto) {
        self.idle_gauge(proto).fetch_sub(1, Ordering::Relaxed);
        self.running_gauge(proto).fetch_add(1, Ordering::Relaxed);
    }

    /// A connected source lost its upstream session.
    pub fn source_stopped(&self, proto: SourceProto) {
        self.running_gauge(proto).fetch_sub(1, Ordering::Relaxed);
        self.idle_gauge(proto).fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    fn idle_gauge(&self, proto: SourceProto) -> &AtomicI64 {
        match proto {
            SourceProto::Rtsp => &self.sources_rtsp_idle,
            SourceProto::Rtmp => &self.sources_rtmp_idle,
        }
    }

    fn running_gauge(&self, proto: SourceProto) -> &AtomicI64 {
        match proto {
            SourceProto::Rtsp => &self.sources_rtsp_running,
            SourceProto::Rtmp => &self.sources_rtmp_running,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            publishers_connected: self.publishers_connected.load(Ordering::Relaxed),
            readers_connected: self.readers_connected.load(Ordering::Relaxed),
            sources_rtsp_idle: self.sources_rtsp_idle.load(Ordering::Relaxed),
            sources_rtsp_running: self.sources_rtsp_running.load(Ordering::Relaxed),
            sources_rtmp_idle: self.sources_rtmp_idle.load(Ordering::Relaxed),
            sources_rtmp_running: self.sources_rtmp_running.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view handed to the exporter.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub publishers_connected: i64,
    pub readers_connected: i64,
    pub sources_rtsp_idle: i64,
    pub sources_rtsp_running: i64,
    pub sources_rtmp_idle: i64,
    pub sources_rtmp_running: i64,
    pub bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let stats = Stats::new();

        stats.add_publisher();
        stats.add_reader();
        stats.add_reader();
        stats.add_bytes_received(1024);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.publishers_connected, 1);
        assert_eq!(snapshot.readers_connected, 2);
        assert_eq!(snapshot.bytes_received, 1024);

        stats.remove_reader();
        stats.remove_publisher();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.publishers_connected, 0);
        assert_eq!(snapshot.readers_connected, 1);
    }

    #[test]
    fn test_snapshot_serializes_for_the_exporter() {
        let stats = Stats::new();
        stats.add_publisher();
        stats.add_bytes_received(42);

        let value = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(value["publishers_connected"], 1);
        assert_eq!(value["bytes_received"], 42);
    }

    #[test]
    fn test_source_gauges() {
        let stats = Stats::new();

        stats.add_idle_source(SourceProto::Rtsp);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sources_rtsp_idle, 1);
        assert_eq!(snapshot.sources_rtsp_running, 0);

        stats.source_started(SourceProto::Rtsp);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sources_rtsp_idle, 0);
        assert_eq!(snapshot.sources_rtsp_running, 1);

        stats.source_stopped(SourceProto::Rtsp);
        stats.remove_idle_source(SourceProto::Rtsp);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sources_rtsp_idle, 0);
        assert_eq!(snapshot.sources_rtsp_running, 0);

        stats.add_idle_source(SourceProto::Rtmp);
        assert_eq!(stats.snapshot().sources_rtmp_idle, 1);
    }
}
