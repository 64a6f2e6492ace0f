//! Drives one real session end to end: TCP socket pair, a shell-script
//! engine child, the mediated handshake and the rewrite pumps.

#![cfg(unix)]

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use uci_gate_lib::session::{self, EngineEndpoint, SessionOptions};
use uci_gate_lib::uci::OptionPolicy;

const FAKE_ENGINE: &str = r#"#!/bin/sh
echo "id name FakeEngine 1"
echo "uciok"
while IFS= read -r line; do
  printf 'echo:%s\n' "$line"
done
"#;

fn write_fake_engine(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("fake_engine");
    std::fs::write(&path, FAKE_ENGINE)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// Keepalive lines show up whenever the heartbeat fires; skip them.
async fn next_engine_line(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> anyhow::Result<String> {
    loop {
        match lines.next_line().await? {
            Some(line) if line.is_empty() || line == "ping" => continue,
            Some(line) => return Ok(line),
            None => anyhow::bail!("unexpected EOF from proxy"),
        }
    }
}

#[tokio::test]
async fn proxies_a_full_session_through_a_real_engine_process() -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(30), exercise_session()).await?
}

async fn exercise_session() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let engine_path = write_fake_engine(dir.path())?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client = client?;
    let (server_stream, peer) = accepted?;

    let engine_vars: BTreeMap<String, String> = [
        ("Hash".to_string(), "128".to_string()),
        ("Threads".to_string(), "override".to_string()),
    ]
    .into();
    let global_vars: BTreeMap<String, String> =
        [("MultiPV".to_string(), "3".to_string())].into();

    let endpoint = Arc::new(EngineEndpoint {
        name: "fake".into(),
        path: engine_path,
        port: addr.port(),
        policy: OptionPolicy::new(engine_vars, global_vars),
        transcript_path: dir.path().join("communication_log_fake.txt"),
    });
    let permits = Arc::new(Semaphore::new(1));
    let token = CancellationToken::new();

    let session = tokio::spawn(session::run(
        server_stream,
        peer,
        endpoint,
        Arc::clone(&permits),
        SessionOptions {
            enable_uci_log: true,
            detailed_log: false,
        },
        token.clone(),
    ));

    let (client_read, mut client_write) = client.into_split();
    let mut lines = BufReader::new(client_read).lines();

    // handshake: engine greeting relayed up to and including uciok
    let mut saw_id = false;
    loop {
        let line = next_engine_line(&mut lines).await?;
        if line == "id name FakeEngine 1" {
            saw_id = true;
        }
        if line.contains("uciok") {
            break;
        }
    }
    assert!(saw_id);

    // the engine heard the policy pushes before any client byte
    assert_eq!(next_engine_line(&mut lines).await?, "echo:uci");
    assert_eq!(
        next_engine_line(&mut lines).await?,
        "echo:setoption name Hash value 128"
    );
    assert_eq!(
        next_engine_line(&mut lines).await?,
        "echo:setoption name MultiPV value 3"
    );

    // locked option: the client value is discarded
    client_write.write_all(b"setoption name Hash value 999\n").await?;
    assert_eq!(
        next_engine_line(&mut lines).await?,
        "echo:setoption name Hash value 128"
    );

    // override sentinel: forwarded verbatim
    client_write.write_all(b"setoption name Threads value 4\n").await?;
    assert_eq!(
        next_engine_line(&mut lines).await?,
        "echo:setoption name Threads value 4"
    );

    // global fallback
    client_write.write_all(b"setoption name MultiPV value 10\n").await?;
    assert_eq!(
        next_engine_line(&mut lines).await?,
        "echo:setoption name MultiPV value 3"
    );

    // opaque lines pass through untouched
    client_write.write_all(b"go depth 1\n").await?;
    assert_eq!(next_engine_line(&mut lines).await?, "echo:go depth 1");

    // client hangs up: the session reaps the engine and releases its permit
    drop(client_write);
    session.await?;
    assert_eq!(permits.available_permits(), 1);

    // whatever was in flight drains, then the proxy closes the socket
    while lines.next_line().await?.is_some() {}

    let transcript = std::fs::read_to_string(dir.path().join("communication_log_fake.txt"))?;
    assert!(transcript.contains("Client: uci\n"));
    assert!(transcript.contains("Engine: uciok\n"));
    assert!(transcript.contains("Client: setoption name Hash value 128\n"));
    assert!(transcript.contains("Client: go depth 1\n"));
    Ok(())
}
