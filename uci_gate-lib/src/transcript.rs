use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use std::path::{Path, PathBuf};

/// Append-only UCI transcript for one session. Writes from the handshake,
/// both pumps and the liveness tasks are serialized through the handle.
/// Transcript loss never kills a session, so failures are logged and
/// swallowed here.
pub struct Transcript {
    path: PathBuf,
    file: Mutex<File>,
}

impl Transcript {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Transcript {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub async fn client_line(&self, line: &str) {
        self.append("Client", line).await;
    }

    pub async fn engine_line(&self, line: &str) {
        self.append("Engine", line).await;
    }

    async fn append(&self, direction: &str, line: &str) {
        let mut file = self.file.lock().await;
        if let Err(error) = file
            .write_all(format!("{direction}: {line}\n").as_bytes())
            .await
        {
            tracing::warn!(%error, path = %self.path.display(), "failed appending uci transcript");
        }
    }
}
