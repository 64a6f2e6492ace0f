use clap::Parser;

use std::path::PathBuf;

use uci_gate_lib::config;

/// UCI gateway - exposes private chess engine processes to remote GUIs over TCP
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Server configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH
    )]
    pub config_path: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}
