use ipnet::Ipv4Net;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::firewall::FirewallControl;

pub const UNTRUSTED_LOG_FILE: &str = "untrusted_connection_attempts.log";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Trusted,
    UntrustedAllowed,
    UntrustedBlocked,
}

/// Classifies connecting peers and counts untrusted attempts over a sliding
/// window. The attempt record is the only cross-session mutable state in the
/// server; one gate instance is shared by every listener.
pub struct AdmissionGate {
    trusted_sources: BTreeSet<Ipv4Addr>,
    trusted_subnets: Vec<Ipv4Net>,
    max_attempts: u32,
    window: Duration,
    attempts: Mutex<HashMap<Ipv4Addr, Vec<Instant>>>,
    firewall: Arc<dyn FirewallControl>,
    firewall_ip_blocking: bool,
    log_attempts: bool,
    attempt_log_path: PathBuf,
    engine_ports: String,
}

impl AdmissionGate {
    pub fn new(config: &Config, firewall: Arc<dyn FirewallControl>) -> Self {
        AdmissionGate {
            trusted_sources: config.trusted_sources.clone(),
            trusted_subnets: config.trusted_subnets.clone(),
            max_attempts: config.max_connection_attempts,
            window: config.attempt_period(),
            attempts: Mutex::new(HashMap::new()),
            firewall,
            firewall_ip_blocking: config.enable_firewall_ip_blocking,
            log_attempts: config.log_untrusted_connection_attempts,
            attempt_log_path: config.base_log_dir.join(UNTRUSTED_LOG_FILE),
            engine_ports: config.engine_ports(),
        }
    }

    /// Exact member of `trusted_sources` or covered by a trusted subnet.
    pub fn is_trusted(&self, peer: Ipv4Addr) -> bool {
        self.trusted_sources.contains(&peer)
            || self.trusted_subnets.iter().any(|net| net.contains(&peer))
    }

    pub async fn classify(&self, peer: Ipv4Addr) -> Verdict {
        self.classify_at(peer, Instant::now()).await
    }

    async fn classify_at(&self, peer: Ipv4Addr, now: Instant) -> Verdict {
        if self.is_trusted(peer) {
            return Verdict::Trusted;
        }

        let count = {
            let mut attempts = self.attempts.lock().await;
            // drop every peer whose latest attempt fell out of the window
            attempts.retain(|_, stamps| {
                stamps
                    .last()
                    .is_some_and(|last| now.duration_since(*last) <= self.window)
            });
            let stamps = attempts.entry(peer).or_default();
            stamps.push(now);
            let count = stamps.len() as u32;
            if count > self.max_attempts {
                attempts.remove(&peer);
            }
            count
        };

        if count <= self.max_attempts {
            tracing::warn!(peer = %peer, count, "untrusted connection attempt");
            self.log_attempt(format!(
                "Untrusted connection attempt from {peer}. Attempt count: {count}"
            ))
            .await;
            Verdict::UntrustedAllowed
        } else {
            tracing::warn!(peer = %peer, count, "blocking peer after excessive connection attempts");
            self.log_attempt(format!(
                "IP {peer} blocked due to excessive connection attempts. Attempt count: {count}"
            ))
            .await;
            if self.firewall_ip_blocking {
                let firewall = Arc::clone(&self.firewall);
                let ports = self.engine_ports.clone();
                // dispatched so the accept loop keeps serving while netsh runs
                tokio::spawn(async move {
                    firewall.add_ip_to_block_list(peer, &ports).await;
                });
            }
            Verdict::UntrustedBlocked
        }
    }

    async fn log_attempt(&self, line: String) {
        if !self.log_attempts {
            return;
        }
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.attempt_log_path)
                .await?;
            file.write_all(format!("{line}\n").as_bytes()).await
        }
        .await;
        if let Err(error) = result {
            tracing::warn!(%error, path = %self.attempt_log_path.display(), "failed appending untrusted attempt log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use std::path::Path;

    #[derive(Default)]
    struct RecordingFirewall {
        blocked: std::sync::Mutex<Vec<(Ipv4Addr, String)>>,
    }

    #[async_trait]
    impl FirewallControl for RecordingFirewall {
        async fn replace_subnet_block(&self, _local_ports: &str, _cidrs: &[Ipv4Net]) {}

        async fn add_ip_to_block_list(&self, ip: Ipv4Addr, local_ports: &str) {
            self.blocked
                .lock()
                .unwrap()
                .push((ip, local_ports.to_string()));
        }
    }

    fn test_config(base_log_dir: &Path, log_attempts: bool, ip_blocking: bool) -> Config {
        serde_json::from_value(serde_json::json!({
            "host": "127.0.0.1",
            "base_log_dir": base_log_dir,
            "engines": {
                "stockfish": { "path": "/opt/stockfish", "port": 5000 },
                "lc0": { "path": "/opt/lc0", "port": 5001 }
            },
            "max_connections": 4,
            "max_connection_attempts": 3,
            "connection_attempt_period": 60,
            "trusted_sources": ["10.0.0.5"],
            "trusted_subnets": ["192.168.0.0/16"],
            "enable_firewall_ip_blocking": ip_blocking,
            "log_untrusted_connection_attempts": log_attempts,
        }))
        .unwrap()
    }

    fn gate(base_log_dir: &Path, log_attempts: bool, ip_blocking: bool) -> (AdmissionGate, Arc<RecordingFirewall>) {
        let recorder = Arc::new(RecordingFirewall::default());
        let config = test_config(base_log_dir, log_attempts, ip_blocking);
        (AdmissionGate::new(&config, recorder.clone()), recorder)
    }

    fn peer() -> Ipv4Addr {
        "203.0.113.1".parse().unwrap()
    }

    async fn attempt_count(gate: &AdmissionGate, ip: Ipv4Addr) -> Option<usize> {
        gate.attempts.lock().await.get(&ip).map(Vec::len)
    }

    #[tokio::test]
    async fn trusted_source_never_enters_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let (gate, _) = gate(dir.path(), false, false);
        let trusted: Ipv4Addr = "10.0.0.5".parse().unwrap();

        for _ in 0..20 {
            assert_eq!(gate.classify(trusted).await, Verdict::Trusted);
        }
        assert!(gate.attempts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn trusted_subnet_member_is_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let (gate, _) = gate(dir.path(), false, false);
        let member: Ipv4Addr = "192.168.44.9".parse().unwrap();
        assert_eq!(gate.classify(member).await, Verdict::Trusted);
    }

    #[tokio::test]
    async fn fourth_attempt_within_window_blocks_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let (gate, recorder) = gate(dir.path(), false, true);
        let now = Instant::now();

        for i in 0..3 {
            let verdict = gate.classify_at(peer(), now + Duration::from_secs(i)).await;
            assert_eq!(verdict, Verdict::UntrustedAllowed);
        }
        let verdict = gate.classify_at(peer(), now + Duration::from_secs(10)).await;
        assert_eq!(verdict, Verdict::UntrustedBlocked);
        assert_eq!(attempt_count(&gate, peer()).await, None);

        // the firewall request is dispatched, not awaited
        tokio::time::sleep(Duration::from_millis(20)).await;
        let blocked = recorder.blocked.lock().unwrap();
        assert_eq!(blocked.as_slice(), &[(peer(), "5001,5000".to_string())]);
    }

    #[tokio::test]
    async fn spaced_attempts_never_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let (gate, _) = gate(dir.path(), false, false);
        let now = Instant::now();

        for i in 0..6u64 {
            let at = now + Duration::from_secs(i * 61);
            assert_eq!(gate.classify_at(peer(), at).await, Verdict::UntrustedAllowed);
            assert_eq!(attempt_count(&gate, peer()).await, Some(1));
        }
    }

    #[tokio::test]
    async fn blocked_peer_starts_over_when_seen_again() {
        let dir = tempfile::tempdir().unwrap();
        let (gate, _) = gate(dir.path(), false, false);
        let now = Instant::now();

        for i in 0..4 {
            gate.classify_at(peer(), now + Duration::from_secs(i)).await;
        }
        let verdict = gate.classify_at(peer(), now + Duration::from_secs(5)).await;
        assert_eq!(verdict, Verdict::UntrustedAllowed);
        assert_eq!(attempt_count(&gate, peer()).await, Some(1));
    }

    #[tokio::test]
    async fn no_firewall_request_when_ip_blocking_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let (gate, recorder) = gate(dir.path(), false, false);
        let now = Instant::now();

        for i in 0..5 {
            gate.classify_at(peer(), now + Duration::from_secs(i)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(recorder.blocked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn attempt_log_records_attempts_and_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (gate, _) = gate(dir.path(), true, false);
        let now = Instant::now();

        for i in 0..4 {
            gate.classify_at(peer(), now + Duration::from_secs(i)).await;
        }

        let log = std::fs::read_to_string(dir.path().join(UNTRUSTED_LOG_FILE)).unwrap();
        assert!(log.contains("Untrusted connection attempt from 203.0.113.1. Attempt count: 3"));
        assert!(log.contains("IP 203.0.113.1 blocked due to excessive connection attempts. Attempt count: 4"));
    }
}
