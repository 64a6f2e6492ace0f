use std::process;

use uci_gate_lib::{config, logging, supervisor};

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let args = cli::parse();

    let log_handle = logging::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let exit = run(&args, &log_handle);
    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }
    process::exit(exit)
}

fn run(args: &cli::Cli, log_handle: &logging::LogReloadHandle) -> exitcode::ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "failed building tokio runtime");
            return exitcode::OSERR;
        }
    };

    runtime.block_on(async {
        let config = match config::read(&args.config_path).await {
            Ok(config) => config,
            Err(config::Error::NoFile) => {
                tracing::error!(config_file = %args.config_path.display(), "cannot find configuration file");
                return exitcode::NOINPUT;
            }
            Err(error) => {
                tracing::error!(%error, config_file = %args.config_path.display(), "failed reading configuration");
                return exitcode::CONFIG;
            }
        };

        supervisor::run(config, log_handle).await
    })
}
