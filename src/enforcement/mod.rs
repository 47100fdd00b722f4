// Policy enforcement against live machine state
//
// Three channels run every cycle, each independent of the others:
// execution blocking (terminate matching processes), acquisition blocking
// (delete matching installers from download folders) and network blocking
// (hosts file or firewall rules). A failure in one channel is logged and
// never prevents the others from running.

pub mod acquisition;
pub mod execution;
pub mod network;

use std::path::PathBuf;

use crate::agent::EnforcementSettings;
use crate::policy::{PolicySnapshot, descriptor_tokens};

pub use acquisition::{FileSystem, LocalFileSystem, block_acquisition};
pub use execution::{ProcessEnumerator, ProcessInfo, SysinfoProcesses, block_execution};
pub use network::{
    BlockMethod, BlockOutcome, DomainResolver, FirewallBlocker, FirewallRules, HostsFileBlocker,
    NetworkBlocker, SystemDnsResolver, platform_network_blocker,
};

/// Per-item results of one enforcement channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOutcome {
    pub matched: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Result of the network channel for one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkOutcome {
    /// No blocked domains this cycle
    Skipped,
    Applied(BlockOutcome),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcementReport {
    pub execution: ChannelOutcome,
    pub acquisition: ChannelOutcome,
    pub network: NetworkOutcome,
}

/// Applies a policy snapshot through platform capabilities
pub struct EnforcementEngine {
    processes: Box<dyn ProcessEnumerator>,
    files: Box<dyn FileSystem>,
    download_dir_candidates: Vec<PathBuf>,
    network: Box<dyn NetworkBlocker>,
}

impl EnforcementEngine {
    pub fn new(
        processes: Box<dyn ProcessEnumerator>,
        files: Box<dyn FileSystem>,
        download_dir_candidates: Vec<PathBuf>,
        network: Box<dyn NetworkBlocker>,
    ) -> Self {
        Self {
            processes,
            files,
            download_dir_candidates,
            network,
        }
    }

    /// Engine wired to the real process table, filesystem and platform blocker
    pub fn for_platform(settings: &EnforcementSettings) -> Self {
        Self::new(
            Box::new(SysinfoProcesses::new()),
            Box::new(LocalFileSystem),
            acquisition::download_dir_candidates(&settings.extra_download_dirs),
            platform_network_blocker(settings),
        )
    }

    pub fn processes(&self) -> &dyn ProcessEnumerator {
        self.processes.as_ref()
    }

    /// Run all three channels against `policy`
    pub fn enforce(&self, policy: &PolicySnapshot) -> EnforcementReport {
        let execution = block_execution(self.processes.as_ref(), policy.software.tokens());

        // Installer cleanup only trusts tokens derived from full descriptors
        let installer_tokens = descriptor_tokens(policy.software.descriptors());
        let acquisition = if installer_tokens.is_empty() {
            ChannelOutcome::default()
        } else {
            let dirs = acquisition::existing_download_dirs(
                self.files.as_ref(),
                &self.download_dir_candidates,
            );
            block_acquisition(self.files.as_ref(), &dirs, &installer_tokens)
        };

        let network = self.block_network(policy);

        EnforcementReport {
            execution,
            acquisition,
            network,
        }
    }

    fn block_network(&self, policy: &PolicySnapshot) -> NetworkOutcome {
        let domains = policy.websites.domains();
        if domains.is_empty() {
            tracing::debug!("No blocked domains; network blocking skipped");
            return NetworkOutcome::Skipped;
        }

        match self.network.apply(domains) {
            Ok(outcome) => NetworkOutcome::Applied(outcome),
            Err(e) => {
                tracing::error!("Network blocking failed: {:#}", e);
                NetworkOutcome::Failed(format!("{:#}", e))
            }
        }
    }
}
