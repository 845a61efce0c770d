//! Session Registry
//!
//! Owns one relay session per forwarding rule. A rule that fails to start
//! is reported and left idle; the others are unaffected.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::config::{ForwardRule, RelaySettings};
use crate::error::StartError;
use crate::metrics::Metrics;
use crate::relay::{ConnectionStats, RelaySession, SessionStatus};

/// Outcome of starting one rule
#[derive(Debug)]
pub struct StartReport {
    pub rule: ForwardRule,
    pub session_id: String,
    pub result: Result<(), StartError>,
}

impl StartReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Point-in-time view of a registered session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub rule: String,
    pub status: SessionStatus,
    pub listen_addr: Option<SocketAddr>,
    pub last_relay: Option<ConnectionStats>,
}

/// Registry of forwarding sessions, one per rule
pub struct SessionRegistry {
    settings: RelaySettings,
    metrics: Option<Arc<Metrics>>,
    sessions: Vec<(ForwardRule, RelaySession)>,
}

impl SessionRegistry {
    pub fn new(settings: RelaySettings, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            settings,
            metrics,
            sessions: Vec::new(),
        }
    }

    /// Start one session per rule, in order
    pub async fn start_all(&mut self, rules: Vec<ForwardRule>) -> Vec<StartReport> {
        let mut reports = Vec::with_capacity(rules.len());
        for rule in rules {
            reports.push(self.start_rule(rule).await);
        }
        reports
    }

    /// Create a session for `rule` and start it
    pub async fn start_rule(&mut self, rule: ForwardRule) -> StartReport {
        let session = match &self.metrics {
            Some(metrics) => RelaySession::with_metrics(self.settings.clone(), metrics.clone()),
            None => RelaySession::new(self.settings.clone()),
        };

        let result = session.start(&rule).await;
        match &result {
            Ok(()) => {
                info!(session_id = %session.id(), rule = %rule, "Now forwarding");
                if let Some(metrics) = &self.metrics {
                    metrics.record_session_started();
                }
            }
            Err(e) => {
                error!(session_id = %session.id(), rule = %rule, error = %e, "Failed to start forwarding");
                if let Some(metrics) = &self.metrics {
                    metrics.record_start_failure();
                }
            }
        }

        let report = StartReport {
            rule: rule.clone(),
            session_id: session.id().to_string(),
            result,
        };
        self.sessions.push((rule, session));
        report
    }

    pub fn sessions(&self) -> impl Iterator<Item = &RelaySession> {
        self.sessions.iter().map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn running_count(&self) -> usize {
        let mut running = 0;
        for (_, session) in &self.sessions {
            if session.is_running().await {
                running += 1;
            }
        }
        running
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::with_capacity(self.sessions.len());
        for (rule, session) in &self.sessions {
            infos.push(SessionInfo {
                session_id: session.id().to_string(),
                rule: rule.to_string(),
                status: session.status().await,
                listen_addr: session.listen_addr().await,
                last_relay: session.stats().await,
            });
        }
        infos
    }

    /// Stop every session
    pub async fn stop_all(&self) {
        info!("Stopping {} forwarding session(s)", self.sessions.len());
        for (_, session) in &self.sessions {
            session.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_rule_does_not_affect_others() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let listen_port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let metrics = Arc::new(Metrics::new().unwrap());
        let mut registry = SessionRegistry::new(RelaySettings::loopback(), Some(metrics.clone()));

        let rules = vec![
            ForwardRule::parse_line(1, "bad,127.0.0.1,80").unwrap(),
            ForwardRule::new(listen_port, "127.0.0.1", target_port),
        ];
        let reports = registry.start_all(rules).await;

        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0].result, Err(StartError::InvalidSourcePort(_))));
        assert!(reports[1].is_ok());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.running_count().await, 1);
        assert_eq!(metrics.sessions_started(), 1);
        assert_eq!(metrics.start_failures(), 1);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].status, SessionStatus::Idle);
        assert_eq!(snapshot[1].status, SessionStatus::Listening);
        assert_eq!(snapshot[1].listen_addr.map(|a| a.port()), Some(listen_port));

        registry.stop_all().await;
        assert_eq!(registry.running_count().await, 0);
    }
}
