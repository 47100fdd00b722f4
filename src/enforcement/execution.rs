use anyhow::{Context, Result, bail};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;
use sysinfo::{Pid, Signal, System};
use tracing::{debug, info, warn};

use super::ChannelOutcome;

/// A running process as seen by enforcement and the malware heuristics
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exe: Option<PathBuf>,
    pub cmd: Vec<String>,
}

impl ProcessInfo {
    /// Lowercase `"<name> <exe path>"` used for token matching
    pub fn match_text(&self) -> String {
        let exe = self
            .exe
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{} {}", self.name, exe).to_lowercase()
    }

    pub fn command_line(&self) -> String {
        self.cmd.join(" ")
    }
}

/// Access to the live process table
pub trait ProcessEnumerator: Send + Sync {
    fn processes(&self) -> Vec<ProcessInfo>;

    /// Ask a process to exit
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// Process table backed by sysinfo
pub struct SysinfoProcesses {
    system: Mutex<System>,
}

impl SysinfoProcesses {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEnumerator for SysinfoProcesses {
    fn processes(&self) -> Vec<ProcessInfo> {
        let Ok(mut system) = self.system.lock() else {
            warn!("Process table lock poisoned, skipping enumeration");
            return Vec::new();
        };
        system.refresh_processes();

        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                exe: process.exe().map(|p| p.to_path_buf()),
                cmd: process.cmd().to_vec(),
            })
            .collect()
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        let system = self
            .system
            .lock()
            .map_err(|_| anyhow::anyhow!("process table lock poisoned"))?;

        let process = system
            .process(Pid::from_u32(pid))
            .with_context(|| format!("process {} is gone", pid))?;

        // SIGTERM where supported, otherwise the platform's hard kill
        let sent = match process.kill_with(Signal::Term) {
            Some(sent) => sent,
            None => process.kill(),
        };

        if !sent {
            bail!("signal to process {} was refused", pid);
        }
        Ok(())
    }
}

/// Terminate every process whose name or executable path contains a token
///
/// Matching is a case-insensitive substring test. The agent never
/// terminates itself.
pub fn block_execution(
    processes: &dyn ProcessEnumerator,
    tokens: &BTreeSet<String>,
) -> ChannelOutcome {
    let mut outcome = ChannelOutcome::default();
    if tokens.is_empty() {
        return outcome;
    }

    let own_pid = std::process::id();

    for process in processes.processes() {
        if process.pid == own_pid || (process.name.is_empty() && process.exe.is_none()) {
            continue;
        }

        let text = process.match_text();
        let Some(token) = tokens.iter().find(|token| text.contains(token.as_str())) else {
            continue;
        };

        outcome.matched += 1;
        info!(
            "Terminating prohibited process {} (pid={}, token={:?})",
            process.name, process.pid, token
        );

        match processes.terminate(process.pid) {
            Ok(()) => outcome.applied += 1,
            Err(e) => {
                outcome.failed += 1;
                warn!("Failed to terminate {} (pid={}): {:#}", process.name, process.pid, e);
            }
        }
    }

    if outcome.matched == 0 {
        debug!("Execution blocking: no matching running processes");
    } else {
        info!(
            "Execution blocking: terminated {} of {} matching process(es)",
            outcome.applied, outcome.matched
        );
    }

    outcome
}
