use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{AgentConfig, CycleScheduler};
use crate::archive::{ArchiveRow, DiscoveryArchive};
use crate::cache::DeliveryCache;
use crate::enforcement::{EnforcementEngine, EnforcementReport, ProcessInfo};
use crate::inventory::{HealthSnapshot, HostInventory};
use crate::malware::{self, HeuristicRules};
use crate::policy::{PolicySnapshot, PolicyStore};
use crate::report::{
    Delivery, HostRecord, RecordContext, ReportSummary, ReportingPipeline, security_record,
};
use crate::resolver::{HostResolver, SystemResolver};
use crate::scanner::{self, SubnetPrefix, SubnetScanner};
use crate::transport::{HttpTransport, Transport};

/// Where a cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Scanning,
    Reporting,
    PolicyFetch,
    Enforcing,
}

/// What one cycle accomplished
///
/// Phases that never ran, because discovery had no local address or the
/// cycle was interrupted, are `None`.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub security: Option<Delivery>,
    pub devices: Option<ReportSummary>,
    pub enforcement: Option<EnforcementReport>,
    pub interrupted: bool,
}

/// Everything one agent instance needs across cycles
pub struct Agent {
    config: AgentConfig,
    inventory: HostInventory,
    scanner: SubnetScanner,
    resolver: Arc<dyn HostResolver>,
    reporting: ReportingPipeline,
    policies: PolicyStore,
    enforcement: Arc<EnforcementEngine>,
    archive: DiscoveryArchive,
    heuristics: HeuristicRules,
    phase: CyclePhase,
}

impl Agent {
    /// Wire up production collaborators from configuration
    pub async fn from_config(config: AgentConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> =
            Arc::new(HttpTransport::new(&config).context("Failed to create backend transport")?);

        let cache = DeliveryCache::load(&config.cache);
        tracing::info!(
            "Delivery cache: {} entries ({})",
            cache.len(),
            cache.path().display()
        );

        Ok(Self::new(
            HostInventory::collect().await,
            SubnetScanner::from_settings(&config.scan),
            Arc::new(SystemResolver),
            transport,
            cache,
            EnforcementEngine::for_platform(&config.enforcement),
            HeuristicRules::for_host(),
            config,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inventory: HostInventory,
        scanner: SubnetScanner,
        resolver: Arc<dyn HostResolver>,
        transport: Arc<dyn Transport>,
        cache: DeliveryCache,
        enforcement: EnforcementEngine,
        heuristics: HeuristicRules,
        config: AgentConfig,
    ) -> Self {
        let reporting = ReportingPipeline::new(
            Arc::clone(&transport),
            cache,
            Duration::from_millis(config.agent.send_delay_ms),
        );
        let policies = PolicyStore::new(
            transport,
            config.backend.websites_endpoint.clone(),
            config.backend.software_endpoint.clone(),
        );

        Self {
            archive: DiscoveryArchive::new(config.agent.csv_path.clone()),
            config,
            inventory,
            scanner,
            resolver,
            reporting,
            policies,
            enforcement: Arc::new(enforcement),
            heuristics,
            phase: CyclePhase::Idle,
        }
    }

    pub fn inventory(&self) -> &HostInventory {
        &self.inventory
    }

    fn interrupted(&self, shutdown: &watch::Receiver<bool>, report: &mut CycleReport) -> bool {
        if *shutdown.borrow() {
            tracing::info!("Cycle interrupted after {:?}", self.phase);
            report.interrupted = true;
        }
        report.interrupted
    }

    fn enter(&mut self, phase: CyclePhase) {
        tracing::debug!("Cycle phase: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// One full discovery, report, policy fetch and enforcement pass
    ///
    /// Discovery failures only skip device reporting; policy fetch and
    /// enforcement still run. Once `shutdown` is set no further phase starts
    /// and a running sweep is abandoned. The phase is back to `Idle` whenever
    /// this returns.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let result = self.cycle(shutdown, &mut report).await;
        self.enter(CyclePhase::Idle);
        result.map(|()| report)
    }

    async fn cycle(
        &mut self,
        shutdown: &watch::Receiver<bool>,
        report: &mut CycleReport,
    ) -> Result<()> {
        if self.interrupted(shutdown, report) {
            return Ok(());
        }
        self.enter(CyclePhase::Scanning);
        let health = HealthSnapshot::sample().await;
        let ctx = RecordContext::new(
            &self.inventory,
            &self.config.backend.account,
            &self.config.location,
            health,
        );

        let local_ip = scanner::local_ipv4();
        let local_mac = match &local_ip {
            Ok(ip) => self.resolver.mac_address(*ip).await,
            Err(_) => None,
        };

        if self.interrupted(shutdown, report) {
            return Ok(());
        }
        report.security = Some(
            self.send_security_notification(local_ip.as_ref().ok().copied(), local_mac.clone(), &ctx)
                .await?,
        );

        if self.interrupted(shutdown, report) {
            return Ok(());
        }
        match local_ip {
            Ok(ip) => {
                report.devices = self
                    .discover_and_report(ip, local_mac, &health, &ctx, shutdown)
                    .await;
            }
            Err(e) => tracing::error!("Device discovery skipped this cycle: {}", e),
        }

        if self.interrupted(shutdown, report) {
            return Ok(());
        }
        self.enter(CyclePhase::PolicyFetch);
        let snapshot = self.policies.snapshot().await;

        if self.interrupted(shutdown, report) {
            return Ok(());
        }
        self.enter(CyclePhase::Enforcing);
        report.enforcement = Some(self.enforce(snapshot).await?);

        if let Err(e) = self.reporting.cache_mut().prune() {
            tracing::warn!("Failed to prune delivery cache: {:#}", e);
        }

        Ok(())
    }

    async fn send_security_notification(
        &mut self,
        local_ip: Option<Ipv4Addr>,
        local_mac: Option<String>,
        ctx: &RecordContext,
    ) -> Result<Delivery> {
        let processes = self.snapshot_processes().await?;
        let findings = malware::scan(&processes, &self.heuristics);
        if findings.is_empty() {
            tracing::debug!("Malware heuristics: no findings");
        } else {
            tracing::warn!("Malware heuristics: {} finding(s)", findings.len());
        }

        let record = security_record(local_ip, local_mac, &findings, ctx);
        Ok(self.reporting.send_security_notification(&record).await)
    }

    async fn discover_and_report(
        &mut self,
        local_ip: Ipv4Addr,
        local_mac: Option<String>,
        health: &HealthSnapshot,
        ctx: &RecordContext,
        shutdown: &watch::Receiver<bool>,
    ) -> Option<ReportSummary> {
        let prefix = SubnetPrefix::of(local_ip);
        tracing::info!("Subnet base: {}.0/24 (ping sweep)", prefix);

        let mut interrupt = shutdown.clone();
        let responsive = tokio::select! {
            found = self.scanner.sweep(prefix) => found,
            _ = shutdown_requested(&mut interrupt) => {
                tracing::info!("Sweep abandoned on interrupt");
                return None;
            }
        };
        tracing::info!("Discovered {} responsive device(s)", responsive.len());

        let mut hosts = Vec::with_capacity(responsive.len());
        for ip in responsive {
            hosts.push(HostRecord {
                ip,
                mac: self.resolver.mac_address(ip).await,
                hostname: self.resolver.hostname(ip).await,
            });
        }

        let mut rows = vec![ArchiveRow::local_host(
            &self.inventory,
            Some(local_ip),
            local_mac,
            health,
            &self.config.location,
        )];
        rows.extend(
            hosts
                .iter()
                .map(|host| ArchiveRow::device(host, &self.config.location)),
        );
        if let Err(e) = self.archive.append(&rows) {
            tracing::error!("Error writing discovery archive: {:#}", e);
        }

        if *shutdown.borrow() {
            return None;
        }

        self.enter(CyclePhase::Reporting);
        let summary = self.reporting.report_devices(&hosts, local_ip, ctx).await;
        tracing::info!(
            "Device reporting: {} sent, {} duplicate, {} failed, {} rejected",
            summary.sent,
            summary.duplicates,
            summary.failed,
            summary.rejected
        );
        Some(summary)
    }

    async fn snapshot_processes(&self) -> Result<Vec<ProcessInfo>> {
        let engine = Arc::clone(&self.enforcement);
        tokio::task::spawn_blocking(move || engine.processes().processes())
            .await
            .context("Process enumeration task failed")
    }

    async fn enforce(&self, snapshot: PolicySnapshot) -> Result<EnforcementReport> {
        let engine = Arc::clone(&self.enforcement);
        let report = tokio::task::spawn_blocking(move || engine.enforce(&snapshot))
            .await
            .context("Enforcement task failed")?;

        tracing::info!(
            "Enforcement: {} process(es) terminated, {} installer(s) removed, network {:?}",
            report.execution.applied,
            report.acquisition.applied,
            report.network
        );
        Ok(report)
    }
}

/// Log the startup banner
fn log_banner(config: &AgentConfig, agent: &Agent) {
    tracing::info!("{}", "=".repeat(60));
    tracing::info!("ITAM Agent: discovery, malware scan, policy enforcement");
    tracing::info!(
        "Endpoint:  {}",
        config.endpoint_url(&config.backend.devices_endpoint)
    );
    tracing::info!("CSV file:  {}", config.agent.csv_path.display());
    tracing::info!("Agent:     {}", agent.inventory().agent_name);
    tracing::info!("{}", "=".repeat(60));
}

/// Resolves once the shutdown flag is set; never resolves if the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Flip the shutdown flag on the first Ctrl-C / SIGINT, exit on the second
fn spawn_interrupt_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, stopping after the current step");
                let _ = tx.send(true);

                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Second interrupt received, exiting immediately");
                    std::process::exit(130);
                }
                std::future::pending::<()>().await;
            }
            Err(e) => {
                tracing::error!("Unable to listen for interrupt signal: {}", e);
                // Keep the sender alive so the scheduler keeps its normal cadence
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

/// Run the agent until interrupted (or for a single cycle with `once`)
pub async fn run_agent_daemon(config: AgentConfig, once: bool) -> Result<()> {
    tracing::info!("Starting agent daemon");
    tracing::info!(
        "Cycle interval: {} seconds (+{} seconds jitter)",
        config.agent.poll_interval,
        config.agent.poll_jitter
    );

    let scheduler = CycleScheduler::new(config.agent.poll_interval, config.agent.poll_jitter);
    let mut agent = Agent::from_config(config.clone()).await?;
    log_banner(&config, &agent);

    let mut shutdown = spawn_interrupt_listener();

    loop {
        match agent.run_cycle(&shutdown).await {
            Ok(report) if report.interrupted => {
                tracing::info!("Exiting on user request");
                return Ok(());
            }
            Ok(report) => tracing::debug!("Cycle report: {:?}", report),
            Err(e) => {
                // Continue running even if this cycle failed
                tracing::error!("Cycle failed: {:#}", e);
            }
        }

        if once {
            tracing::info!("Single cycle complete, exiting");
            return Ok(());
        }

        let next = scheduler.next_cycle_time();
        tracing::debug!("Next cycle at about: {}", next.format("%Y-%m-%d %H:%M:%S %Z"));

        if scheduler.wait_for_next_cycle(&mut shutdown).await {
            tracing::info!("Exiting on user request");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::{
        BlockOutcome, FileSystem, NetworkBlocker, NetworkOutcome, ProcessEnumerator,
    };
    use crate::report::OutboundRecord;
    use crate::scanner::Prober;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::BTreeSet;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTransport {
        posted: Mutex<Vec<OutboundRecord>>,
        /// Raised as soon as anything is posted
        interrupt: Option<watch::Sender<bool>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post_record(&self, record: &OutboundRecord) -> Result<u16, TransportError> {
            self.posted.lock().unwrap().push(record.clone());
            if let Some(interrupt) = &self.interrupt {
                interrupt.send(true).unwrap();
            }
            Ok(200)
        }

        async fn get_json(&self, endpoint: &str) -> Result<Value, TransportError> {
            if endpoint.contains("website") {
                Ok(json!({"websites": ["Blocked.example"]}))
            } else {
                Ok(json!([{"name": "BitTorrent", "executableName": "bittorrent.exe"}]))
            }
        }
    }

    struct NoProber;

    #[async_trait]
    impl Prober for NoProber {
        async fn probe(&self, _ip: Ipv4Addr) -> bool {
            false
        }
    }

    struct QuietResolver;

    #[async_trait]
    impl HostResolver for QuietResolver {
        async fn mac_address(&self, _ip: Ipv4Addr) -> Option<String> {
            None
        }

        async fn hostname(&self, ip: Ipv4Addr) -> String {
            crate::resolver::fallback_name(ip)
        }
    }

    struct NoProcesses;

    impl ProcessEnumerator for NoProcesses {
        fn processes(&self) -> Vec<ProcessInfo> {
            vec![]
        }

        fn terminate(&self, _pid: u32) -> Result<()> {
            Ok(())
        }
    }

    struct NoFiles;

    impl FileSystem for NoFiles {
        fn list_files(&self, _dir: &Path) -> Result<Vec<PathBuf>> {
            Ok(vec![])
        }

        fn remove_file(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        fn is_dir(&self, _path: &Path) -> bool {
            false
        }
    }

    #[derive(Clone, Default)]
    struct CountingBlocker(Arc<Mutex<Vec<BTreeSet<String>>>>);

    impl NetworkBlocker for CountingBlocker {
        fn apply(&self, domains: &BTreeSet<String>) -> Result<BlockOutcome> {
            self.0.lock().unwrap().push(domains.clone());
            Ok(BlockOutcome {
                method: crate::enforcement::BlockMethod::HostsFile,
                entries: domains.len(),
                skipped: 0,
            })
        }
    }

    fn test_agent(dir: &Path, transport: Arc<ScriptedTransport>, blocker: &CountingBlocker) -> Agent {
        let mut config = AgentConfig::default();
        config.agent.csv_path = dir.join("discovery.csv");
        config.agent.send_delay_ms = 0;

        let inventory = HostInventory {
            agent_name: "agent-01".to_string(),
            os_name: "Linux 6.1".to_string(),
            device_type: "Linux Machine".to_string(),
            manufacturer: "Unknown".to_string(),
            serial: None,
        };

        Agent::new(
            inventory,
            SubnetScanner::new(Arc::new(NoProber), 32, 4),
            Arc::new(QuietResolver),
            transport,
            DeliveryCache::new(dir.join("sent.json"), chrono::Duration::days(30), 100),
            EnforcementEngine::new(
                Box::new(NoProcesses),
                Box::new(NoFiles),
                vec![],
                Box::new(blocker.clone()),
            ),
            HeuristicRules::new(vec![], vec![]),
            config,
        )
    }

    #[tokio::test]
    async fn cycle_reports_then_fetches_and_enforces_fresh_policy() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let blocker = CountingBlocker::default();
        let mut agent = test_agent(dir.path(), transport.clone(), &blocker);
        let (_tx, shutdown) = watch::channel(false);

        let report = agent.run_cycle(&shutdown).await.unwrap();

        assert!(!report.interrupted);
        assert_eq!(report.security, Some(Delivery::Sent(200)));
        let posted = transport.posted.lock().unwrap().clone();
        assert_eq!(posted[0].model, "SecurityNotification");

        let calls = blocker.0.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("blocked.example"));
        let enforcement = report.enforcement.unwrap();
        assert!(matches!(enforcement.network, NetworkOutcome::Applied(_)));
        assert_eq!(agent.phase, CyclePhase::Idle);
    }

    #[tokio::test]
    async fn interrupt_mid_cycle_skips_remaining_phases() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, shutdown) = watch::channel(false);
        let transport = Arc::new(ScriptedTransport {
            interrupt: Some(tx),
            ..Default::default()
        });
        let blocker = CountingBlocker::default();
        let mut agent = test_agent(dir.path(), transport.clone(), &blocker);

        let report = agent.run_cycle(&shutdown).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.security, Some(Delivery::Sent(200)));
        assert!(report.devices.is_none());
        assert!(report.enforcement.is_none());
        assert!(blocker.0.lock().unwrap().is_empty());
        assert_eq!(transport.posted.lock().unwrap().len(), 1);
        assert_eq!(agent.phase, CyclePhase::Idle);
    }

    #[tokio::test]
    async fn interrupted_before_start_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let blocker = CountingBlocker::default();
        let mut agent = test_agent(dir.path(), transport.clone(), &blocker);
        let (_tx, shutdown) = watch::channel(true);

        let report = agent.run_cycle(&shutdown).await.unwrap();

        assert!(report.interrupted);
        assert!(report.security.is_none());
        assert!(transport.posted.lock().unwrap().is_empty());
        assert!(blocker.0.lock().unwrap().is_empty());
    }
}
