//! One client connection and its private engine process.
//!
//! A session owns the accepted socket, a freshly spawned engine child and
//! the liveness timers. The server mediates the UCI handshake, then runs a
//! full-duplex line pump with `setoption` rewriting on the client-to-engine
//! direction. Teardown is idempotent and fires on whichever side gives up
//! first: client EOF, engine EOF, an I/O error, inactivity or shutdown.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use crate::liveness::{self, Activity, HEARTBEAT_PERIOD, INACTIVITY_CHECK_PERIOD, INACTIVITY_LIMIT};
use crate::transcript::Transcript;
use crate::uci::OptionPolicy;

#[derive(Debug, Error)]
pub enum Error {
    #[error("engine spawn failed: {0}")]
    Spawn(io::Error),
    #[error("engine stdio unavailable")]
    EngineStdio,
    #[error("engine closed before uciok")]
    HandshakeEof,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Serialized writer toward the client socket. The handshake relay, the
/// engine pumps and the heartbeat all write here; the mutex keeps their
/// lines whole on the wire.
pub struct ClientWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> ClientWriter<W> {
    pub fn new(inner: W) -> Self {
        ClientWriter {
            inner: Mutex::new(inner),
        }
    }

    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    pub async fn write_raw(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    pub async fn shutdown(&self) {
        let mut writer = self.inner.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Per-engine data shared by every session of one listener.
#[derive(Clone, Debug)]
pub struct EngineEndpoint {
    pub name: String,
    pub path: PathBuf,
    pub port: u16,
    pub policy: OptionPolicy,
    pub transcript_path: PathBuf,
}

#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    pub enable_uci_log: bool,
    pub detailed_log: bool,
}

/// Run one session to completion. Blocks on the global concurrency permit,
/// then owns the connection and the engine child until teardown.
pub async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: Arc<EngineEndpoint>,
    permits: Arc<Semaphore>,
    options: SessionOptions,
    token: CancellationToken,
) {
    let _permit = tokio::select! {
        _ = token.cancelled() => return,
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return, // semaphore closed, the server is shutting down
        },
    };
    if token.is_cancelled() {
        return;
    }

    match proxy(stream, peer, &endpoint, options, token).await {
        Ok(()) => tracing::info!(peer = %peer, engine = %endpoint.name, "connection closed"),
        Err(error) => {
            tracing::warn!(%error, peer = %peer, engine = %endpoint.name, "connection closed");
        }
    }
}

async fn proxy(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: &EngineEndpoint,
    options: SessionOptions,
    token: CancellationToken,
) -> Result<(), Error> {
    tracing::info!(peer = %peer, engine = %endpoint.name, path = %endpoint.path.display(), "initiating engine");
    let mut child = spawn_engine(endpoint)?;

    let engine_stdin = child.stdin.take().ok_or(Error::EngineStdio)?;
    let engine_stdout = child.stdout.take().ok_or(Error::EngineStdio)?;
    let engine_stderr = child.stderr.take().ok_or(Error::EngineStdio)?;

    let (client_read, client_write) = stream.into_split();
    let relay = Relay {
        client: Arc::new(ClientWriter::new(client_write)),
        transcript: open_transcript(endpoint, options).await,
        activity: Arc::new(Activity::new()),
        detailed: options.detailed_log,
    };

    let session_token = token.child_token();
    let heartbeat = tokio::spawn(liveness::heartbeat(
        Arc::clone(&relay.client),
        HEARTBEAT_PERIOD,
        session_token.clone(),
    ));
    let inactivity = tokio::spawn(liveness::watch_inactivity(
        Arc::clone(&relay.activity),
        INACTIVITY_CHECK_PERIOD,
        INACTIVITY_LIMIT,
        session_token.clone(),
        peer,
    ));
    // engine stderr is merged toward the client alongside stdout; it ending
    // on its own does not end the session
    let stderr_pump = tokio::spawn({
        let relay = relay.clone();
        let token = session_token.clone();
        async move {
            let lines = BufReader::new(engine_stderr).lines();
            tokio::select! {
                _ = token.cancelled() => {}
                _ = pump_engine(lines, &relay) => {}
            }
        }
    });

    let result = drive(
        client_read,
        engine_stdin,
        engine_stdout,
        &relay,
        &endpoint.policy,
        &session_token,
    )
    .await;

    // teardown, idempotent no matter which side ended the session
    session_token.cancel();
    let _ = heartbeat.await;
    let _ = inactivity.await;
    let _ = stderr_pump.await;
    shutdown_engine(&mut child, peer).await;
    relay.client.shutdown().await;

    result
}

fn spawn_engine(endpoint: &EngineEndpoint) -> Result<Child, Error> {
    let mut command = Command::new(&endpoint.path);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = endpoint.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        command.current_dir(dir);
    }
    command.spawn().map_err(Error::Spawn)
}

async fn open_transcript(endpoint: &EngineEndpoint, options: SessionOptions) -> Option<Arc<Transcript>> {
    if !options.enable_uci_log {
        return None;
    }
    match Transcript::open(&endpoint.transcript_path).await {
        Ok(transcript) => Some(Arc::new(transcript)),
        Err(error) => {
            tracing::warn!(%error, path = %endpoint.transcript_path.display(), "failed opening uci transcript");
            None
        }
    }
}

async fn drive<CR, EW, ER, CW>(
    client_read: CR,
    mut engine_in: EW,
    engine_stdout: ER,
    relay: &Relay<CW>,
    policy: &OptionPolicy,
    token: &CancellationToken,
) -> Result<(), Error>
where
    CR: AsyncRead + Unpin,
    EW: AsyncWrite + Unpin,
    ER: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
{
    let mut engine_lines = BufReader::new(engine_stdout).lines();

    tokio::select! {
        _ = token.cancelled() => return Ok(()),
        res = handshake(&mut engine_in, &mut engine_lines, relay, policy) => res?,
    }

    let client_pump = pump_client(client_read, engine_in, relay, policy);
    let engine_pump = pump_engine(engine_lines, relay);

    tokio::select! {
        _ = token.cancelled() => Ok(()),
        res = client_pump => res,
        res = engine_pump => res,
    }
}

/// The only moment the proxy speaks UCI on its own: push `uci` and the
/// policy options, then relay engine output up to and including the line
/// carrying `uciok`. The client-to-engine direction stays quiet until this
/// returns.
async fn handshake<EW, ER, CW>(
    engine_in: &mut EW,
    engine_lines: &mut Lines<BufReader<ER>>,
    relay: &Relay<CW>,
    policy: &OptionPolicy,
) -> Result<(), Error>
where
    EW: AsyncWrite + Unpin,
    ER: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
{
    relay.to_engine(engine_in, "uci").await?;
    for (name, value) in policy.handshake_options() {
        relay
            .to_engine(engine_in, &format!("setoption name {name} value {value}"))
            .await?;
    }

    while let Some(line) = engine_lines.next_line().await? {
        relay.to_client(&line).await?;
        if line.contains("uciok") {
            return Ok(());
        }
    }
    Err(Error::HandshakeEof)
}

async fn pump_client<CR, EW, CW>(
    client_read: CR,
    mut engine_in: EW,
    relay: &Relay<CW>,
    policy: &OptionPolicy,
) -> Result<(), Error>
where
    CR: AsyncRead + Unpin,
    EW: AsyncWrite + Unpin,
    CW: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(client_read).lines();
    while let Some(line) = lines.next_line().await? {
        relay.activity.touch();
        if line.is_empty() {
            continue;
        }
        match policy.rewrite_line(&line) {
            Some(rewritten) => relay.to_engine(&mut engine_in, &rewritten).await?,
            None => relay.to_engine(&mut engine_in, &line).await?,
        }
    }
    tracing::debug!("client closed the connection");
    Ok(())
}

async fn pump_engine<ER, CW>(mut lines: Lines<BufReader<ER>>, relay: &Relay<CW>) -> Result<(), Error>
where
    ER: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        relay.to_client(&line).await?;
    }
    tracing::debug!("engine closed its output");
    Ok(())
}

async fn shutdown_engine(child: &mut Child, peer: SocketAddr) {
    if let Err(error) = child.start_kill() {
        // the engine may have exited on its own already
        tracing::debug!(%error, peer = %peer, "engine already gone");
    }
    match child.wait().await {
        Ok(status) => tracing::debug!(peer = %peer, %status, "engine terminated"),
        Err(error) => tracing::warn!(%error, peer = %peer, "failed reaping engine"),
    }
}

/// Line sinks shared by the handshake and the pumps.
struct Relay<CW> {
    client: Arc<ClientWriter<CW>>,
    transcript: Option<Arc<Transcript>>,
    activity: Arc<Activity>,
    detailed: bool,
}

impl<CW> Clone for Relay<CW> {
    fn clone(&self) -> Self {
        Relay {
            client: Arc::clone(&self.client),
            transcript: self.transcript.clone(),
            activity: Arc::clone(&self.activity),
            detailed: self.detailed,
        }
    }
}

impl<CW: AsyncWrite + Unpin> Relay<CW> {
    async fn to_client(&self, line: &str) -> io::Result<()> {
        self.activity.touch();
        self.client.write_line(line).await?;
        if let Some(transcript) = &self.transcript {
            transcript.engine_line(line).await;
        }
        if self.detailed {
            tracing::info!("Engine: {line}");
        }
        Ok(())
    }

    async fn to_engine<EW: AsyncWrite + Unpin>(&self, engine_in: &mut EW, line: &str) -> io::Result<()> {
        engine_in.write_all(line.as_bytes()).await?;
        engine_in.write_all(b"\n").await?;
        engine_in.flush().await?;
        if let Some(transcript) = &self.transcript {
            transcript.client_line(line).await;
        }
        if self.detailed {
            tracing::info!("Client: {line}");
        }
        Ok(())
    }
}
