//! Relay Session
//!
//! A session forwards one local port to one remote endpoint for one client
//! at a time. Its state lives behind a single mutex:
//!
//! ```text
//! Idle --start--> Connecting --target up--> Listening --client--> Relaying
//!                     |  (client parked while the target connect runs)  |
//!                     +-----------------------------+-------------------+
//!                                                   |
//!                                         stop / failure --> Idle
//! ```
//!
//! Each `start` opens a new epoch. Accept and read completions carry the
//! epoch they were armed under and do nothing once it is over.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::copier;
use super::stats::{ConnectionStats, RelayCounters};
use crate::config::{ForwardRule, RelaySettings, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::error::{Direction, StartError};
use crate::metrics::Metrics;

/// Externally visible lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Listening,
    Relaying,
}

/// One forwarding session. Clones share the same session.
#[derive(Clone)]
pub struct RelaySession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    settings: RelaySettings,
    metrics: Option<Arc<Metrics>>,
    guarded: Mutex<Guarded>,
    epochs: AtomicU64,
    status_tx: watch::Sender<SessionStatus>,
}

struct Guarded {
    state: SessionState,
    last_relay: Option<ConnectionStats>,
}

enum SessionState {
    Idle,
    Connecting(Connecting),
    Listening(Listening),
    Relaying(Relaying),
}

/// Listener is up, outbound connect in flight
struct Connecting {
    epoch: u64,
    rule: ForwardRule,
    listen_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    pending_client: Option<(TcpStream, SocketAddr)>,
}

/// Target connected, waiting for the client
struct Listening {
    epoch: u64,
    rule: ForwardRule,
    listen_addr: SocketAddr,
    target_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    target: TcpStream,
}

/// Both legs up, copier tasks running
struct Relaying {
    epoch: u64,
    rule: ForwardRule,
    listen_addr: SocketAddr,
    counters: Arc<RelayCounters>,
    upstream: JoinHandle<()>,
    downstream: JoinHandle<()>,
}

/// Tasks aborted by a teardown. Joining them waits until the sockets
/// they own are closed.
struct Released(Vec<JoinHandle<()>>);

impl Released {
    async fn join(self) {
        for task in self.0 {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Session task failed");
                }
            }
        }
    }
}

impl SessionState {
    fn epoch(&self) -> Option<u64> {
        match self {
            SessionState::Idle => None,
            SessionState::Connecting(c) => Some(c.epoch),
            SessionState::Listening(l) => Some(l.epoch),
            SessionState::Relaying(r) => Some(r.epoch),
        }
    }

    fn status(&self) -> SessionStatus {
        match self {
            SessionState::Idle => SessionStatus::Idle,
            SessionState::Connecting(_) => SessionStatus::Connecting,
            SessionState::Listening(_) => SessionStatus::Listening,
            SessionState::Relaying(_) => SessionStatus::Relaying,
        }
    }

    fn listen_addr(&self) -> Option<SocketAddr> {
        match self {
            SessionState::Idle => None,
            SessionState::Connecting(c) => Some(c.listen_addr),
            SessionState::Listening(l) => Some(l.listen_addr),
            SessionState::Relaying(r) => Some(r.listen_addr),
        }
    }

    fn rule(&self) -> Option<&ForwardRule> {
        match self {
            SessionState::Idle => None,
            SessionState::Connecting(c) => Some(&c.rule),
            SessionState::Listening(l) => Some(&l.rule),
            SessionState::Relaying(r) => Some(&r.rule),
        }
    }
}

impl RelaySession {
    /// Create an idle session
    pub fn new(settings: RelaySettings) -> Self {
        Self::build(settings, None)
    }

    /// Create an idle session that reports to `metrics`
    pub fn with_metrics(settings: RelaySettings, metrics: Arc<Metrics>) -> Self {
        Self::build(settings, Some(metrics))
    }

    fn build(mut settings: RelaySettings, metrics: Option<Arc<Metrics>>) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Idle);

        // A zero-length read buffer would read as end of stream
        let buffer_size = settings.buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);
        if buffer_size != settings.buffer_size {
            warn!(
                requested = settings.buffer_size,
                buffer_size, "Buffer size out of range, clamped"
            );
            settings.buffer_size = buffer_size;
        }

        Self {
            inner: Arc::new(SessionInner {
                id: uuid::Uuid::new_v4().to_string(),
                settings,
                metrics,
                guarded: Mutex::new(Guarded {
                    state: SessionState::Idle,
                    last_relay: None,
                }),
                epochs: AtomicU64::new(0),
                status_tx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.inner.settings
    }

    /// Start forwarding according to `rule`.
    ///
    /// Binds the listener, then connects to the target. Host name
    /// resolution and the connect share one connect timeout. Returns once
    /// the target is connected; the client is accepted in the background.
    pub async fn start(&self, rule: &ForwardRule) -> Result<(), StartError> {
        let settings = &self.inner.settings;

        if self.is_running().await {
            warn!(session_id = %self.id(), rule = %rule, "Already routing, ignoring start");
            return Err(StartError::AlreadyRunning);
        }

        let connect_timeout = settings.connect_timeout;
        let deadline = Instant::now() + connect_timeout;
        let resolved = rule.resolve_until(deadline).await?;

        let (epoch, target_addr, listen_addr) = {
            let mut guarded = self.inner.guarded.lock().await;
            if !matches!(guarded.state, SessionState::Idle) {
                warn!(session_id = %self.id(), rule = %rule, "Already routing, ignoring start");
                return Err(StartError::AlreadyRunning);
            }

            let bind_addr = SocketAddr::new(settings.listen_ip, resolved.listen_port);
            let listener = TcpListener::bind(bind_addr)
                .await
                .map_err(|source| StartError::Bind {
                    port: resolved.listen_port,
                    source,
                })?;
            let listen_addr = listener.local_addr().unwrap_or(bind_addr);

            let epoch = self.inner.epochs.fetch_add(1, Ordering::SeqCst) + 1;
            let accept_task = tokio::spawn(accept_client(self.clone(), epoch, listener));

            guarded.state = SessionState::Connecting(Connecting {
                epoch,
                rule: rule.clone(),
                listen_addr,
                accept_task,
                pending_client: None,
            });
            self.publish(&guarded);

            info!(
                session_id = %self.id(),
                listen_addr = %listen_addr,
                target_addr = %resolved.target,
                "Listening, connecting to target"
            );

            (epoch, resolved.target, listen_addr)
        };

        let outcome = match timeout_at(deadline, TcpStream::connect(target_addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(StartError::from_connect(target_addr, e)),
            Err(_) => Err(StartError::ConnectTimeout {
                target: target_addr,
                timeout: connect_timeout,
            }),
        };

        let mut guarded = self.inner.guarded.lock().await;
        let connecting = match std::mem::replace(&mut guarded.state, SessionState::Idle) {
            SessionState::Connecting(c) if c.epoch == epoch => c,
            other => {
                guarded.state = other;
                debug!(session_id = %self.id(), "Session stopped while connecting to target");
                return Err(StartError::Cancelled);
            }
        };

        let target = match outcome {
            Ok(target) => target,
            Err(e) => {
                let accept_task = connecting.accept_task;
                accept_task.abort();
                drop(connecting.pending_client);
                self.publish(&guarded);
                drop(guarded);

                // The listener lives in the accept task
                Released(vec![accept_task]).join().await;
                error!(
                    session_id = %self.id(),
                    target_addr = %target_addr,
                    error = %e,
                    "Could not connect to the target end point"
                );
                return Err(e);
            }
        };

        debug!(session_id = %self.id(), target_addr = %target_addr, "Connected to target");

        guarded.state = match connecting.pending_client {
            Some((client, client_addr)) => self.begin_relay(
                epoch,
                connecting.rule,
                listen_addr,
                client,
                client_addr,
                target,
                target_addr,
            ),
            None => SessionState::Listening(Listening {
                epoch,
                rule: connecting.rule,
                listen_addr,
                target_addr,
                accept_task: connecting.accept_task,
                target,
            }),
        };
        self.publish(&guarded);

        Ok(())
    }

    /// Stop the session and release every handle. Calling it on an idle
    /// session does nothing.
    ///
    /// Returns once the listener and both connections are closed.
    pub async fn stop(&self) {
        let released = {
            let mut guarded = self.inner.guarded.lock().await;
            self.teardown(&mut guarded)
        };

        match released {
            Some(released) => {
                released.join().await;
                info!(session_id = %self.id(), "Disconnected from socket");
            }
            None => debug!(session_id = %self.id(), "Stop on idle session"),
        }
    }

    /// Stop the session only if it is still in `epoch`.
    ///
    /// Called from the copier tasks, which are among the aborted tasks, so
    /// the released handles are not joined here.
    pub(crate) async fn stop_epoch(&self, epoch: u64) {
        let mut guarded = self.inner.guarded.lock().await;
        if guarded.state.epoch() == Some(epoch) && self.teardown(&mut guarded).is_some() {
            info!(session_id = %self.id(), "Disconnected from socket");
        }
    }

    pub(crate) async fn is_relaying(&self, epoch: u64) -> bool {
        let guarded = self.inner.guarded.lock().await;
        matches!(&guarded.state, SessionState::Relaying(r) if r.epoch == epoch)
    }

    pub(crate) fn record_bytes(&self, direction: Direction, bytes: u64) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.add_bytes(direction, bytes);
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.inner.guarded.lock().await.state.status()
    }

    pub async fn is_running(&self) -> bool {
        self.status().await != SessionStatus::Idle
    }

    /// Address the listener was bound to, while running
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.guarded.lock().await.state.listen_addr()
    }

    /// Rule the session is currently running
    pub async fn rule(&self) -> Option<ForwardRule> {
        self.inner.guarded.lock().await.state.rule().cloned()
    }

    /// Statistics of the active relay, or of the last finished one
    pub async fn stats(&self) -> Option<ConnectionStats> {
        let guarded = self.inner.guarded.lock().await;
        match &guarded.state {
            SessionState::Relaying(r) => Some(r.counters.to_stats()),
            _ => guarded.last_relay.clone(),
        }
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    async fn on_accept(&self, epoch: u64, accepted: std::io::Result<(TcpStream, SocketAddr)>) {
        let mut guarded = self.inner.guarded.lock().await;
        if guarded.state.epoch() != Some(epoch) {
            debug!(session_id = %self.id(), "Dropping client accepted after stop");
            return;
        }

        let (client, client_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(session_id = %self.id(), error = %e, "Failed to accept client");
                self.teardown(&mut guarded);
                return;
            }
        };

        info!(session_id = %self.id(), client_addr = %client_addr, "Client connected");

        guarded.state = match std::mem::replace(&mut guarded.state, SessionState::Idle) {
            SessionState::Connecting(mut c) => {
                debug!(
                    session_id = %self.id(),
                    "Target not connected yet, holding client"
                );
                c.pending_client = Some((client, client_addr));
                SessionState::Connecting(c)
            }
            SessionState::Listening(l) => self.begin_relay(
                epoch,
                l.rule,
                l.listen_addr,
                client,
                client_addr,
                l.target,
                l.target_addr,
            ),
            other => other,
        };
        self.publish(&guarded);
    }

    /// Pair both legs and spawn the copiers. Runs under the guard.
    #[allow(clippy::too_many_arguments)]
    fn begin_relay(
        &self,
        epoch: u64,
        rule: ForwardRule,
        listen_addr: SocketAddr,
        client: TcpStream,
        client_addr: SocketAddr,
        target: TcpStream,
        target_addr: SocketAddr,
    ) -> SessionState {
        for (leg, stream) in [("client", &client), ("target", &target)] {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(session_id = %self.id(), leg, error = %e, "Failed to enable TCP_NODELAY");
            }
        }

        let counters = Arc::new(RelayCounters::new(
            self.id().to_string(),
            rule.to_string(),
            client_addr,
            target_addr,
        ));
        let buffer_size = self.inner.settings.buffer_size;

        let (client_read, client_write) = client.into_split();
        let (target_read, target_write) = target.into_split();

        let upstream = tokio::spawn(copier::forward(
            self.clone(),
            epoch,
            Direction::Upstream,
            client_read,
            target_write,
            counters.clone(),
            buffer_size,
        ));
        let downstream = tokio::spawn(copier::forward(
            self.clone(),
            epoch,
            Direction::Downstream,
            target_read,
            client_write,
            counters.clone(),
            buffer_size,
        ));

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_relay_started();
        }

        info!(
            session_id = %self.id(),
            client_addr = %client_addr,
            target_addr = %target_addr,
            "Relaying"
        );

        SessionState::Relaying(Relaying {
            epoch,
            rule,
            listen_addr,
            counters,
            upstream,
            downstream,
        })
    }

    /// Abort every task, drop the connections held in the state and go
    /// back to idle. Returns `None` if the session was already idle.
    fn teardown(&self, guarded: &mut Guarded) -> Option<Released> {
        let released = match std::mem::replace(&mut guarded.state, SessionState::Idle) {
            SessionState::Idle => None,
            SessionState::Connecting(c) => {
                c.accept_task.abort();
                drop(c.pending_client);
                Some(Released(vec![c.accept_task]))
            }
            SessionState::Listening(l) => {
                l.accept_task.abort();
                drop(l.target);
                Some(Released(vec![l.accept_task]))
            }
            SessionState::Relaying(r) => {
                r.upstream.abort();
                r.downstream.abort();

                let stats = r.counters.to_stats();
                r.counters.log_stats();
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_relay_finished(&stats);
                }
                guarded.last_relay = Some(stats);
                Some(Released(vec![r.upstream, r.downstream]))
            }
        };

        self.publish(guarded);
        released
    }

    fn publish(&self, guarded: &Guarded) {
        self.inner.status_tx.send_replace(guarded.state.status());
    }
}

/// Accept exactly one client, then drop the listener
async fn accept_client(session: RelaySession, epoch: u64, listener: TcpListener) {
    let accepted = listener.accept().await;
    drop(listener);
    session.on_accept(epoch, accepted).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_new_session_is_idle() {
        let session = RelaySession::new(RelaySettings::loopback());
        assert_eq!(session.status().await, SessionStatus::Idle);
        assert!(!session.is_running().await);
        assert!(session.listen_addr().await.is_none());
        assert!(session.stats().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let session = RelaySession::new(RelaySettings::loopback());
        session.stop().await;
        session.stop().await;
        assert_eq!(session.status().await, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_invalid_rule_leaves_session_idle() {
        let session = RelaySession::new(RelaySettings::loopback());
        let rule = ForwardRule::parse_line(1, "nope,127.0.0.1,80").unwrap();

        let result = session.start(&rule).await;
        assert!(matches!(result, Err(StartError::InvalidSourcePort(_))));
        assert_eq!(session.status().await, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_relay_records_stats() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let port = free_port();

        let session = RelaySession::new(RelaySettings::loopback());
        let rule = ForwardRule::new(port, "127.0.0.1", target_addr.port());
        session.start(&rule).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (mut upstream, _) = target.accept().await.unwrap();

        let mut status = session.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| *s == SessionStatus::Relaying),
        )
        .await
        .unwrap()
        .unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        session.stop().await;
        assert_eq!(session.status().await, SessionStatus::Idle);
        let stats = session.stats().await.unwrap();
        assert_eq!(stats.bytes_up, 5);
    }
    #[tokio::test]
    async fn test_stop_releases_listen_port() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free_port();

        let session = RelaySession::new(RelaySettings::loopback());
        let rule = ForwardRule::new(port, "127.0.0.1", target.local_addr().unwrap().port());
        session.start(&rule).await.unwrap();
        assert_eq!(session.status().await, SessionStatus::Listening);

        session.stop().await;
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());

        session.start(&rule).await.unwrap();
        session.stop().await;
    }

    #[tokio::test]
    async fn test_failed_start_releases_listen_port() {
        let port = free_port();

        let session = RelaySession::new(RelaySettings::loopback());
        let result = session.start(&ForwardRule::new(port, "127.0.0.1", free_port())).await;
        assert!(matches!(result, Err(StartError::ConnectRefused { .. })));

        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn test_zero_buffer_size_is_clamped() {
        let session = RelaySession::new(RelaySettings::loopback().with_buffer_size(0));
        assert_eq!(session.settings().buffer_size, MIN_BUFFER_SIZE);

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free_port();
        let rule = ForwardRule::new(port, "127.0.0.1", target.local_addr().unwrap().port());
        session.start(&rule).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (mut upstream, _) = target.accept().await.unwrap();

        client.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), upstream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"data");
        assert_eq!(session.status().await, SessionStatus::Relaying);

        session.stop().await;
    }

    /// A listener with a backlog of one whose accept queue is already full,
    /// so further connects hang until they time out
    async fn saturated_listener() -> (TcpListener, Vec<TcpStream>) {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut queued = Vec::new();
        for _ in 0..4 {
            match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => queued.push(stream),
                _ => break,
            }
        }
        (listener, queued)
    }

    #[tokio::test]
    async fn test_client_parked_while_target_connects() {
        let (target, _queued) = saturated_listener().await;
        let target_port = target.local_addr().unwrap().port();
        let port = free_port();

        let settings = RelaySettings::loopback().with_connect_timeout(Duration::from_millis(1500));
        let session = RelaySession::new(settings);
        let rule = ForwardRule::new(port, "127.0.0.1", target_port);

        let starter = {
            let session = session.clone();
            tokio::spawn(async move { session.start(&rule).await })
        };

        let mut status = session.subscribe();
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| *s == SessionStatus::Connecting),
        )
        .await
        .unwrap()
        .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"early").await.unwrap();

        let parked = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let guarded = session.inner.guarded.lock().await;
                if let SessionState::Connecting(c) = &guarded.state {
                    if c.pending_client.is_some() {
                        break;
                    }
                }
                drop(guarded);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(parked.is_ok(), "client was not parked");
        assert_eq!(session.status().await, SessionStatus::Connecting);
        assert!(session.stats().await.is_none());

        let result = starter.await.unwrap();
        assert!(matches!(result, Err(StartError::ConnectTimeout { .. })));
        assert_eq!(session.status().await, SessionStatus::Idle);
        assert!(session.stats().await.is_none());

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "parked client should be closed");
    }
}
