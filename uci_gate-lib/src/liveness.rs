//! Heartbeat and inactivity timers bound to one session.

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::session::ClientWriter;

pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(300);
pub const INACTIVITY_CHECK_PERIOD: Duration = Duration::from_secs(60);
pub const INACTIVITY_LIMIT: Duration = Duration::from_secs(900);

/// UCI engines ignore unknown tokens, and the client never sees `ping` as a
/// chess verb either - this is purely a client-side keepalive.
const HEARTBEAT_BYTES: &[u8] = b"\nping\n";

/// Last moment a line moved through the session, shared by the pumps and
/// the inactivity detector. Lock-free: stores elapsed-milliseconds since
/// session start.
#[derive(Debug)]
pub struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Activity {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit the keepalive bytes to the client until cancelled or the write
/// fails. The first tick fires immediately.
pub(crate) async fn heartbeat<W>(
    writer: Arc<ClientWriter<W>>,
    period: Duration,
    token: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(error) = writer.write_raw(HEARTBEAT_BYTES).await {
                    tracing::debug!(%error, "heartbeat write failed");
                    return;
                }
            }
        }
    }
}

/// Close the session once nothing has moved for longer than `limit`.
/// Cancelling the session token cascades into both pumps and teardown.
pub(crate) async fn watch_inactivity(
    activity: Arc<Activity>,
    check_period: Duration,
    limit: Duration,
    token: CancellationToken,
    peer: SocketAddr,
) {
    let mut ticker = tokio::time::interval(check_period);
    ticker.tick().await; // the immediate first tick is of no interest
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if activity.idle_for() > limit {
                    tracing::warn!(peer = %peer, "closing connection due to inactivity");
                    token.cancel();
                    return;
                }
            }
        }
    }
}
