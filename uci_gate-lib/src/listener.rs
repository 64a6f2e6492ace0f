use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::admission::{AdmissionGate, Verdict};
use crate::session::{self, EngineEndpoint, SessionOptions};

const RETRY_LIMIT: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error("maximum retries reached")]
    RetriesExhausted,
}

/// Server-wide pieces shared by every listener.
pub struct ServerContext {
    pub gate: AdmissionGate,
    pub permits: Arc<Semaphore>,
    pub sessions: TaskTracker,
    pub options: SessionOptions,
    pub enable_trusted_sources: bool,
}

/// Accept loop for one engine. Any bind or accept failure costs one retry
/// after a 5 s pause; cancellation exits cleanly without consuming one.
pub async fn serve(
    host: String,
    endpoint: Arc<EngineEndpoint>,
    ctx: Arc<ServerContext>,
    token: CancellationToken,
) -> Result<(), Error> {
    serve_with(host, endpoint, ctx, token, RETRY_DELAY).await
}

async fn serve_with(
    host: String,
    endpoint: Arc<EngineEndpoint>,
    ctx: Arc<ServerContext>,
    token: CancellationToken,
    retry_delay: Duration,
) -> Result<(), Error> {
    let bind_addr = format!("{host}:{port}", port = endpoint.port);
    let mut retries = RETRY_LIMIT;

    loop {
        let bound = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            res = TcpListener::bind(&bind_addr) => res,
        };
        let listener = match bound {
            Ok(listener) => {
                tracing::info!(addr = %bind_addr, engine = %endpoint.name, "listening");
                listener
            }
            Err(error) => {
                tracing::warn!(%error, addr = %bind_addr, engine = %endpoint.name, "failed binding listener");
                retries -= 1;
                if retries == 0 {
                    tracing::error!(engine = %endpoint.name, "maximum retries reached, listener exiting");
                    return Err(Error::RetriesExhausted);
                }
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(retry_delay) => continue,
                }
            }
        };

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, peer)) => admit(stream, peer, &endpoint, &ctx, &token).await,
                Err(error) => {
                    tracing::warn!(%error, engine = %endpoint.name, "accept failed");
                    retries -= 1;
                    if retries == 0 {
                        tracing::error!(engine = %endpoint.name, "maximum retries reached, listener exiting");
                        return Err(Error::RetriesExhausted);
                    }
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(retry_delay) => break, // rebind
                    }
                }
            }
        }
    }
}

/// Admission runs exactly once per accepted connection, before the engine
/// is spawned, and only when trusted-source checking is enabled. Refused
/// peers just see their socket close.
async fn admit(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: &Arc<EngineEndpoint>,
    ctx: &Arc<ServerContext>,
    token: &CancellationToken,
) {
    tracing::info!(peer = %peer, engine = %endpoint.name, "connection opened");

    let IpAddr::V4(peer_ip) = peer.ip() else {
        // the admission and firewall surfaces are IPv4-only
        tracing::warn!(peer = %peer, "dropping non-IPv4 peer");
        return;
    };

    if ctx.enable_trusted_sources {
        match ctx.gate.classify(peer_ip).await {
            Verdict::Trusted => {}
            Verdict::UntrustedAllowed | Verdict::UntrustedBlocked => {
                // dropping the stream closes the socket
                return;
            }
        }
    }

    ctx.sessions.spawn(session::run(
        stream,
        peer,
        Arc::clone(endpoint),
        Arc::clone(&ctx.permits),
        ctx.options,
        token.child_token(),
    ));
}
