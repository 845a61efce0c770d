//! Duplex Copier
//!
//! One task per direction. Each task owns the read half of its source, the
//! write half of its destination and its own scratch buffer, so the two
//! directions never wait on each other.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace, warn, Level};

use super::session::RelaySession;
use super::stats::RelayCounters;
use crate::error::{Direction, RelayError};

/// Copy bytes from `src` to `dst` until either side fails or closes.
///
/// Every exit path stops the session, which tears down both legs.
pub(crate) async fn forward(
    session: RelaySession,
    epoch: u64,
    direction: Direction,
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    counters: Arc<RelayCounters>,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let n = match src.read(&mut buffer).await {
            Ok(0) => {
                debug!(
                    session_id = %session.id(),
                    direction = %direction,
                    "Peer closed the connection"
                );
                break;
            }
            Ok(n) => n,
            Err(source) => {
                let err = RelayError::Read { direction, source };
                warn!(session_id = %session.id(), error = %err, "Relay leg failed");
                break;
            }
        };

        // A read that lands after stop() belongs to a finished relay
        if !session.is_relaying(epoch).await {
            debug!(
                session_id = %session.id(),
                direction = %direction,
                "Discarding read completed after stop"
            );
            return;
        }

        counters.add_bytes(direction, n as u64);
        session.record_bytes(direction, n as u64);

        if tracing::enabled!(Level::TRACE) {
            trace!(
                session_id = %session.id(),
                direction = %direction,
                bytes = n,
                "{}",
                hex_dump(&buffer[..n])
            );
        }

        if let Err(source) = dst.write_all(&buffer[..n]).await {
            let err = RelayError::Write { direction, source };
            warn!(session_id = %session.id(), error = %err, "Relay leg failed");
            break;
        }
    }

    session.stop_epoch(epoch).await;
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for byte in bytes {
        let _ = write!(out, "{:02x} ", byte);
    }
    out
}
