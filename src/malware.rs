use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

use crate::enforcement::ProcessInfo;
use crate::platform;

/// Longest command line carried in a finding
const CMDLINE_LIMIT: usize = 800;

/// Command-line fragments typical of obfuscated PowerShell and LOLBin abuse
const SUSPICIOUS_CMDLINE: &[&str] = &["encodedcommand", "--enc", "powershell -e", "ie4uinit"];

/// One heuristic hit against a running process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Finding {
    ExeInTemp {
        pid: u32,
        name: String,
        exe: String,
    },
    SuspiciousCmdline {
        pid: u32,
        name: String,
        cmdline: String,
    },
    ExeInAppdataUntrusted {
        pid: u32,
        name: String,
        exe: String,
    },
}

impl Finding {
    /// Identity used to collapse repeated hits (pid is deliberately ignored)
    fn dedup_key(&self) -> (&'static str, &str, &str) {
        match self {
            Finding::ExeInTemp { name, exe, .. } => ("exe_in_temp", name.as_str(), exe.as_str()),
            Finding::SuspiciousCmdline { name, cmdline, .. } => {
                ("suspicious_cmdline", name.as_str(), cmdline.as_str())
            }
            Finding::ExeInAppdataUntrusted { name, exe, .. } => {
                ("exe_in_appdata_untrusted", name.as_str(), exe.as_str())
            }
        }
    }
}

/// Path fragments the heuristics compare executables against
#[derive(Debug, Clone)]
pub struct HeuristicRules {
    temp_prefixes: Vec<String>,
    trusted_appdata: Vec<String>,
}

impl HeuristicRules {
    pub fn new(temp_prefixes: Vec<String>, trusted_appdata: Vec<String>) -> Self {
        Self {
            temp_prefixes: temp_prefixes.into_iter().map(|p| p.to_lowercase()).collect(),
            trusted_appdata: trusted_appdata.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// Rules for the current user: `TEMP`/`TMP`, `/tmp`, and a few
    /// well-known per-user installs under `AppData\Local`
    pub fn for_host() -> Self {
        let mut temp = Vec::new();
        if let Some(tmp) = std::env::var_os("TEMP").or_else(|| std::env::var_os("TMP")) {
            temp.push(Path::new(&tmp).to_string_lossy().into_owned());
        }
        temp.push("/tmp".to_string());

        let local = platform::home_dir().join("AppData").join("Local");
        let trusted = vec![
            local.join("Programs").join("Microsoft VS Code"),
            local.join("Programs").join("Python"),
            local.join("Discord"),
        ]
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

        Self::new(temp, trusted)
    }
}

/// Run the heuristics over a process snapshot
///
/// A process flagged for its command line is not also checked for the
/// AppData rule.
pub fn scan(processes: &[ProcessInfo], rules: &HeuristicRules) -> Vec<Finding> {
    let mut findings = Vec::new();

    for process in processes {
        let Some(exe_path) = process.exe.as_deref() else {
            continue;
        };
        let exe = exe_path.to_string_lossy().into_owned();
        if exe.is_empty() {
            continue;
        }
        let exe_lower = exe.to_lowercase();

        if rules
            .temp_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && exe_lower.contains(prefix.as_str()))
        {
            findings.push(Finding::ExeInTemp {
                pid: process.pid,
                name: process.name.clone(),
                exe: exe.clone(),
            });
        }

        let cmdline = process.command_line();
        let cmd_lower = cmdline.to_lowercase();
        if SUSPICIOUS_CMDLINE.iter().any(|needle| cmd_lower.contains(needle)) {
            findings.push(Finding::SuspiciousCmdline {
                pid: process.pid,
                name: process.name.clone(),
                cmdline: cmdline.chars().take(CMDLINE_LIMIT).collect(),
            });
            continue;
        }

        if exe_lower.contains("appdata")
            && !rules
                .trusted_appdata
                .iter()
                .any(|prefix| !prefix.is_empty() && exe_lower.contains(prefix.as_str()))
        {
            findings.push(Finding::ExeInAppdataUntrusted {
                pid: process.pid,
                name: process.name.clone(),
                exe,
            });
        }
    }

    let mut seen = HashSet::new();
    findings.retain(|finding| {
        let (kind, name, detail) = finding.dedup_key();
        seen.insert((kind, name.to_string(), detail.to_string()))
    });
    findings
}
