use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use std::fs::OpenOptions;
use std::path::Path;

pub const SERVER_LOG_FILE: &str = "server.log";

const DEFAULT_LOG_FILTER: &str = "info";

pub type FileFmtLayer =
    fmt::Layer<Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<Option<FileFmtLayer>, Registry>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("reload error: {0}")]
    Reload(#[from] reload::Error),
}

/// Install the global collector: stderr output filtered via RUST_LOG plus
/// an empty slot for the server.log file layer. The file layer is swapped
/// in once the configuration is known.
pub fn init() -> LogReloadHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (reload_layer, handle) = reload::Layer::new(None::<FileFmtLayer>);
    tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    handle
}

pub fn enable_server_log(handle: &LogReloadHandle, base_log_dir: &Path) -> Result<(), Error> {
    let path = base_log_dir.join(SERVER_LOG_FILE);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let layer = fmt::layer()
        .with_writer(BoxMakeWriter::new(file))
        .with_ansi(false);
    handle.reload(Some(layer))?;
    Ok(())
}
