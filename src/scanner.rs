//! Concurrent ping sweep of the local /24
//!
//! The 254 host addresses are split into fixed-size batches. Each batch is
//! probed sequentially by one task, and a semaphore bounds how many batches
//! run at once.

use async_trait::async_trait;
use if_addrs::get_if_addrs;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::agent::ScanSettings;
use crate::platform;

/// Spawning `ping` is not part of the probe budget
const PROCESS_SLACK: Duration = Duration::from_millis(250);

/// Hard ceiling on sweep workers regardless of configuration
const WORKER_CEILING: usize = 64;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("could not determine a usable local IPv4 address")]
    NoLocalAddress,
}

/// First three octets of a /24 network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetPrefix([u8; 3]);

impl SubnetPrefix {
    pub fn new(a: u8, b: u8, c: u8) -> Self {
        Self([a, b, c])
    }

    /// The /24 containing `ip`
    pub fn of(ip: Ipv4Addr) -> Self {
        let [a, b, c, _] = ip.octets();
        Self([a, b, c])
    }

    /// Host addresses `.1` through `.254`
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let [a, b, c] = self.0;
        (1..=254u8).map(move |d| Ipv4Addr::new(a, b, c, d))
    }
}

impl fmt::Display for SubnetPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{}.{}.{}", a, b, c)
    }
}

/// Primary local IPv4 address
///
/// Prefers the first non-loopback, non-link-local interface address, then
/// falls back to the source address the kernel would route external
/// traffic from.
pub fn local_ipv4() -> Result<Ipv4Addr, ScanError> {
    if let Ok(interfaces) = get_if_addrs() {
        let candidate = interfaces
            .iter()
            .filter(|iface| !iface.is_loopback())
            .find_map(|iface| match iface.ip() {
                IpAddr::V4(v4) if is_usable(v4) => Some(v4),
                _ => None,
            });

        if let Some(ip) = candidate {
            return Ok(ip);
        }
    }

    routed_source_address().ok_or(ScanError::NoLocalAddress)
}

fn is_usable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified()
}

/// Connecting a UDP socket sends nothing but selects a source address
fn routed_source_address() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) if is_usable(v4) => Some(v4),
        _ => None,
    }
}

/// Single reachability check against one address
#[async_trait]
pub trait Prober: Send + Sync {
    /// `true` only if the host answered; every failure counts as no answer
    async fn probe(&self, ip: Ipv4Addr) -> bool;
}

/// ICMP echo through the system `ping` binary
#[derive(Debug, Clone)]
pub struct PingProber {
    timeout: Duration,
}

impl PingProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, ip: Ipv4Addr) -> bool {
        let mut command = tokio::process::Command::new("ping");
        command
            .args(platform::ping_args(ip, self.timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout + PROCESS_SLACK, command.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("ping {} failed to run: {}", ip, e);
                false
            }
            Err(_) => false,
        }
    }
}

/// Number of sweep workers for the given configured cap and core count
pub fn worker_limit(configured_max: usize, cores: usize) -> usize {
    configured_max
        .min(WORKER_CEILING)
        .min(cores.max(1) * 4)
        .max(1)
}

/// Bounded-concurrency sweep of a /24
pub struct SubnetScanner {
    prober: Arc<dyn Prober>,
    batch_size: usize,
    workers: usize,
}

impl SubnetScanner {
    pub fn new(prober: Arc<dyn Prober>, batch_size: usize, workers: usize) -> Self {
        Self {
            prober,
            batch_size: batch_size.max(1),
            workers: workers.max(1),
        }
    }

    /// Scanner using `ping` with limits taken from configuration
    pub fn from_settings(settings: &ScanSettings) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Self::new(
            Arc::new(PingProber::new(settings.probe_timeout())),
            settings.batch_size,
            worker_limit(settings.max_workers, cores),
        )
    }

    /// Probe every host in `prefix` and return the responsive ones, sorted
    pub async fn sweep(&self, prefix: SubnetPrefix) -> Vec<Ipv4Addr> {
        let addresses: Vec<Ipv4Addr> = prefix.hosts().collect();
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut batches = JoinSet::new();

        debug!(
            "Sweeping {}.0/24 with {} worker(s), batch size {}",
            prefix, self.workers, self.batch_size
        );

        for batch in addresses.chunks(self.batch_size) {
            let batch = batch.to_vec();
            let prober = Arc::clone(&self.prober);
            let permits = Arc::clone(&permits);

            batches.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Vec::new();
                };

                let mut alive = Vec::new();
                for ip in batch {
                    if prober.probe(ip).await {
                        alive.push(ip);
                    }
                }
                alive
            });
        }

        let mut responsive = BTreeSet::new();
        while let Some(joined) = batches.join_next().await {
            match joined {
                Ok(alive) => responsive.extend(alive),
                Err(e) => warn!("Sweep batch aborted: {}", e),
            }
        }

        responsive.into_iter().collect()
    }
}
