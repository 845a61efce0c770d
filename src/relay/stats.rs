//! Relay Statistics

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Direction;

/// Byte counters for one client/target pairing
#[derive(Debug)]
pub struct RelayCounters {
    pub session_id: String,
    pub rule: String,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Snapshot of a relay, active or finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub session_id: String,
    pub rule: String,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub start_time: SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
}

impl RelayCounters {
    pub fn new(
        session_id: String,
        rule: String,
        client_addr: SocketAddr,
        target_addr: SocketAddr,
    ) -> Self {
        Self {
            session_id,
            rule,
            client_addr,
            target_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Bytes relayed from client to target
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes relayed from target to client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Upstream => self.bytes_up.fetch_add(bytes, Ordering::Relaxed),
            Direction::Downstream => self.bytes_down.fetch_add(bytes, Ordering::Relaxed),
        };
    }

    pub fn to_stats(&self) -> ConnectionStats {
        let duration = self.duration();

        ConnectionStats {
            session_id: self.session_id.clone(),
            rule: self.rule.clone(),
            client_addr: self.client_addr,
            target_addr: self.target_addr,
            start_time: SystemTime::now() - duration,
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
        }
    }

    /// Log the final figures of a relay
    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            rule = %self.rule,
            client_addr = %self.client_addr,
            target_addr = %self.target_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            total_bytes = self.total_bytes(),
            "Relay completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let client: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        let target: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let counters = RelayCounters::new(
            "session-1".to_string(),
            "9000,127.0.0.1,9001".to_string(),
            client,
            target,
        );

        assert_eq!(counters.total_bytes(), 0);

        counters.add_bytes(Direction::Upstream, 1024);
        counters.add_bytes(Direction::Downstream, 2048);
        counters.add_bytes(Direction::Upstream, 1);

        let stats = counters.to_stats();
        assert_eq!(stats.session_id, "session-1");
        assert_eq!(stats.client_addr, client);
        assert_eq!(stats.target_addr, target);
        assert_eq!(stats.bytes_up, 1025);
        assert_eq!(stats.bytes_down, 2048);
        assert_eq!(stats.total_bytes, 3073);
    }

    #[test]
    fn test_stats_serialize() {
        let counters = RelayCounters::new(
            "session-2".to_string(),
            "9000,127.0.0.1,9001".to_string(),
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        );
        let json = serde_json::to_string(&counters.to_stats()).unwrap();
        assert!(json.contains("\"session_id\":\"session-2\""));
        assert!(json.contains("\"bytes_up\":0"));
    }
}
