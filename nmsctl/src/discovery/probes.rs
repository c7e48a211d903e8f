//! Reachability and port probes used by the discovery pipeline.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

/// Result of probing one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub message: String,
}

impl ProbeOutcome {
    pub fn up(message: impl Into<String>) -> Self {
        Self {
            reachable: true,
            message: message.into(),
        }
    }

    pub fn down(message: impl Into<String>) -> Self {
        Self {
            reachable: false,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait NetworkProber: Send + Sync {
    /// Ping every address with one batched process. Returns exactly one outcome per input
    /// address, in input order.
    async fn ping(&self, ips: &[IpAddr], timeout: Duration) -> Vec<(IpAddr, ProbeOutcome)>;

    /// One TCP connect attempt, bounded by the prober's connect timeout.
    async fn check_port(&self, ip: IpAddr, port: u16) -> ProbeOutcome;
}

/// Pings with `fping` (or a compatible utility) and checks ports with a plain TCP connect.
#[derive(Debug, Clone)]
pub struct FpingProber {
    command: String,
    connect_timeout: Duration,
}

impl FpingProber {
    pub fn new(command: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            command: command.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl NetworkProber for FpingProber {
    async fn ping(&self, ips: &[IpAddr], timeout: Duration) -> Vec<(IpAddr, ProbeOutcome)> {
        if ips.is_empty() {
            return Vec::new();
        }

        let output = Command::new(&self.command)
            .args(["-c1", "-q"])
            .args(ips.iter().map(|ip| ip.to_string()))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, output).await {
            Ok(Ok(output)) => {
                // fping -q writes its per-target summary to stderr; scan both streams
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push('\n');
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                debug!("{} exited with {} for {} targets", self.command, output.status, ips.len());
                parse_ping_summary(&text, ips)
            }
            Ok(Err(e)) => {
                warn!("Failed to run {}: {}", self.command, e);
                all(ips, ProbeOutcome::down(format!("Error during ping check: {e}")))
            }
            Err(_) => {
                warn!("{} timed out after {}s for {} targets", self.command, timeout.as_secs(), ips.len());
                all(ips, ProbeOutcome::down("Ping process timed out"))
            }
        }
    }

    async fn check_port(&self, ip: IpAddr, port: u16) -> ProbeOutcome {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((ip, port))).await {
            Ok(Ok(_stream)) => ProbeOutcome::up(format!("Port {port} is open on {ip}")),
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => ProbeOutcome::down(format!("Port {port} is closed on {ip}")),
            Ok(Err(e)) => ProbeOutcome::down(e.to_string()),
            Err(_) => ProbeOutcome::down(format!("Connection to {ip}:{port} timed out")),
        }
    }
}

fn all(ips: &[IpAddr], outcome: ProbeOutcome) -> Vec<(IpAddr, ProbeOutcome)> {
    ips.iter().map(|ip| (*ip, outcome.clone())).collect()
}

/// Parse `<ip> : xmt/rcv/%loss = 1/0/100%` summary lines. Addresses missing from the output are
/// reported as unreachable.
pub fn parse_ping_summary(output: &str, ips: &[IpAddr]) -> Vec<(IpAddr, ProbeOutcome)> {
    let mut seen: HashMap<IpAddr, ProbeOutcome> = HashMap::new();

    for line in output.lines() {
        let Some((target, summary)) = line.split_once(" : ") else {
            continue;
        };
        let Ok(ip) = target.trim().parse::<IpAddr>() else {
            continue;
        };
        let outcome = if summary.contains("100%") {
            ProbeOutcome::down("Ping check failed: 100% packet loss")
        } else {
            ProbeOutcome::up("Ping check success")
        };
        seen.insert(ip, outcome);
    }

    ips.iter()
        .map(|ip| {
            let outcome = seen
                .get(ip)
                .cloned()
                .unwrap_or_else(|| ProbeOutcome::down("No response from fping"));
            (*ip, outcome)
        })
        .collect()
}
