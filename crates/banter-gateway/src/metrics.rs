//! Counters for the transport and chat layers. Plain atomics, rendered on
//! demand in Prometheus text format; gauges are computed at render time
//! from the live index, retry queue and repository.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub handshake_frames_in: AtomicU64,
    pub secure_frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub decrypt_failures: AtomicU64,
    pub replay_rejections: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub unknown_session_drops: AtomicU64,
    pub retransmissions: AtomicU64,
    pub delivery_exhausted: AtomicU64,
    pub oversize_drops: AtomicU64,
    pub acks_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub ai_requests: AtomicU64,
    pub ai_failures: AtomicU64,
    pub ai_rejections: AtomicU64,
}

/// Point-in-time gauge values collected by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaugeSnapshot {
    pub active_sessions: u64,
    pub authenticated_sessions: u64,
    pub retry_queue_depth: u64,
    pub rooms: u64,
    pub members: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&self, gauges: &GaugeSnapshot) -> String {
        let mut out = String::with_capacity(2048);

        let counters: &[(&str, &AtomicU64)] = &[
            ("banter_handshake_frames_received_total", &self.handshake_frames_in),
            ("banter_secure_frames_received_total", &self.secure_frames_in),
            ("banter_frames_sent_total", &self.frames_out),
            ("banter_bytes_received_total", &self.bytes_in),
            ("banter_bytes_sent_total", &self.bytes_out),
            ("banter_decrypt_failures_total", &self.decrypt_failures),
            ("banter_replay_rejections_total", &self.replay_rejections),
            ("banter_protocol_errors_total", &self.protocol_errors),
            ("banter_unknown_session_drops_total", &self.unknown_session_drops),
            ("banter_retransmissions_total", &self.retransmissions),
            ("banter_delivery_exhausted_total", &self.delivery_exhausted),
            ("banter_oversize_drops_total", &self.oversize_drops),
            ("banter_acks_received_total", &self.acks_received),
            ("banter_messages_sent_total", &self.messages_sent),
            ("banter_ai_requests_total", &self.ai_requests),
            ("banter_ai_failures_total", &self.ai_failures),
            ("banter_ai_rejections_total", &self.ai_rejections),
        ];
        for (name, counter) in counters {
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.load(Ordering::Relaxed));
        }

        let gauge_values: &[(&str, u64)] = &[
            ("banter_active_sessions", gauges.active_sessions),
            ("banter_authenticated_sessions", gauges.authenticated_sessions),
            ("banter_retry_queue_depth", gauges.retry_queue_depth),
            ("banter_rooms", gauges.rooms),
            ("banter_room_members", gauges.members),
        ];
        for (name, value) in gauge_values {
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_counters_and_gauges() {
        let metrics = Metrics::new();
        metrics.replay_rejections.fetch_add(3, Ordering::Relaxed);

        let out = metrics.render(&GaugeSnapshot {
            active_sessions: 2,
            ..Default::default()
        });

        assert!(out.contains("banter_replay_rejections_total 3"));
        assert!(out.contains("banter_active_sessions 2"));
        assert!(out.contains("# TYPE banter_frames_sent_total counter"));
        assert!(out.contains("# TYPE banter_active_sessions gauge"));
    }
}
