//! Boot order, watchdog and graceful shutdown.
//!
//! Boot: ensure the log directory, configure the firewall once, start one
//! listener per engine and the watchdog. Then wait for INT/TERM and cancel
//! top-down: listeners first, which cascades into sessions and their
//! liveness tasks, and join everything before exiting.

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crate::admission::AdmissionGate;
use crate::config::Config;
use crate::firewall::{FirewallControl, NetshFirewall, NoopFirewall};
use crate::listener::{self, ServerContext};
use crate::logging::{self, LogReloadHandle};
use crate::session::{EngineEndpoint, SessionOptions};
use crate::subnet;

const WATCHDOG_PERIOD: Duration = Duration::from_secs(300);

pub async fn run(config: Config, log_handle: &LogReloadHandle) -> exitcode::ExitCode {
    if let Err(error) = tokio::fs::create_dir_all(&config.base_log_dir).await {
        tracing::error!(%error, dir = %config.base_log_dir.display(), "failed creating log directory");
        return exitcode::CANTCREAT;
    }
    if config.enable_server_log {
        if let Err(error) = logging::enable_server_log(log_handle, &config.base_log_dir) {
            tracing::warn!(%error, "failed enabling server log file, continuing without it");
        }
    }

    let firewall = firewall_controller(&config);
    configure_firewall(&config, firewall.as_ref()).await;

    let token = CancellationToken::new();
    let ctx = Arc::new(ServerContext {
        gate: AdmissionGate::new(&config, Arc::clone(&firewall)),
        permits: Arc::new(Semaphore::new(config.max_connections)),
        sessions: TaskTracker::new(),
        options: SessionOptions {
            enable_uci_log: config.enable_uci_log,
            detailed_log: config.detailed_log_verbosity,
        },
        enable_trusted_sources: config.enable_trusted_sources,
    });

    let mut listeners = JoinSet::new();
    for (name, engine) in &config.engines {
        let endpoint = Arc::new(EngineEndpoint {
            name: name.clone(),
            path: engine.path.clone(),
            port: engine.port,
            policy: config.policy_for(engine),
            transcript_path: config.transcript_path(name),
        });
        tracing::info!(engine = %name, port = engine.port, "starting listener");
        listeners.spawn(listener::serve(
            config.host.clone(),
            endpoint,
            Arc::clone(&ctx),
            token.clone(),
        ));
    }

    let watchdog = tokio::spawn(watchdog(token.clone()));

    let exit = supervise(&mut listeners).await;

    tracing::info!("initiating graceful shutdown");
    token.cancel();
    while listeners.join_next().await.is_some() {}
    ctx.sessions.close();
    ctx.sessions.wait().await;
    let _ = watchdog.await;
    tracing::info!("server shutdown completed");
    exit
}

/// Wait for a shutdown signal. A listener exiting is fatal only once every
/// listener is gone.
async fn supervise(listeners: &mut JoinSet<Result<(), listener::Error>>) -> exitcode::ExitCode {
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                return exitcode::OK;
            }
            joined = listeners.join_next() => match joined {
                Some(Ok(Ok(()))) => tracing::warn!("listener exited"),
                Some(Ok(Err(error))) => tracing::warn!(%error, "listener gave up"),
                Some(Err(error)) => tracing::warn!(%error, "listener task failed"),
                None => {
                    tracing::error!("all listeners exited, shutting down");
                    return exitcode::OSERR;
                }
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(mut interrupt), Ok(mut terminate)) => {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
        }
        _ => {
            tracing::warn!("failed installing signal handlers, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn watchdog(token: CancellationToken) {
    let mut ticker = tokio::time::interval(WATCHDOG_PERIOD);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => tracing::info!("watchdog timer: server is responsive"),
        }
    }
}

fn firewall_controller(config: &Config) -> Arc<dyn FirewallControl> {
    if !config.enable_firewall_rules {
        tracing::info!("firewall rules configuration is disabled, skipping");
        return Arc::new(NoopFirewall);
    }
    if !cfg!(target_os = "windows") {
        tracing::warn!("firewall integration requires netsh, continuing without it");
        return Arc::new(NoopFirewall);
    }
    Arc::new(NetshFirewall::new())
}

/// Compute the complement of the trusted peers and install it as the subnet
/// block rule. The planning is pure CPU work and runs off the event loop.
async fn configure_firewall(config: &Config, firewall: &dyn FirewallControl) {
    if !(config.enable_firewall_rules && config.enable_firewall_subnet_blocking) {
        return;
    }

    let avoid_ips: Vec<Ipv4Addr> = config.trusted_sources.iter().copied().collect();
    let avoid_subnets = config.trusted_subnets.clone();
    let plan = match tokio::task::spawn_blocking(move || subnet::plan(&avoid_ips, &avoid_subnets)).await
    {
        Ok(plan) => plan,
        Err(error) => {
            tracing::error!(%error, "subnet planning task failed");
            return;
        }
    };

    firewall.replace_subnet_block(&config.engine_ports(), &plan).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watchdog_stops_on_cancellation() {
        let token = CancellationToken::new();
        let task = tokio::spawn(watchdog(token.clone()));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("watchdog should stop promptly after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn supervise_turns_fatal_once_every_listener_is_gone() {
        let mut listeners: JoinSet<Result<(), listener::Error>> = JoinSet::new();
        listeners.spawn(async { Err(listener::Error::RetriesExhausted) });
        listeners.spawn(async { Ok(()) });

        let exit = tokio::time::timeout(Duration::from_secs(2), supervise(&mut listeners))
            .await
            .expect("supervise should notice the empty listener set");
        assert_eq!(exit, exitcode::OSERR);
    }
}
