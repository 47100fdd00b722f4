use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

/// Atomically write content to a file
///
/// Writes to a sibling temporary file, syncs it, then renames it over the
/// target so a crash mid-write never leaves a truncated cache behind.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&temp_path).with_context(|| {
            format!("Failed to create temporary file: {}", temp_path.display())
        })?;

        file.write_all(content)
            .context("Failed to write to temporary file")?;

        file.sync_all().context("Failed to sync file to disk")?;
    }

    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

/// Ensure a directory exists, creating it and all parents if needed
pub fn ensure_directory_exists(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || path.exists() {
        return Ok(());
    }

    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Check if running with administrator/root privileges
///
/// Enforcement needs these for the hosts file, the firewall and killing
/// other users' processes. The agent still runs without them.
pub fn ensure_admin_privileges() -> Result<()> {
    #[cfg(unix)]
    {
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            anyhow::bail!("Not running as root (EUID: {})", euid);
        }
    }

    #[cfg(windows)]
    {
        // Writing under the system temp dir requires an elevated token
        let marker = std::path::PathBuf::from(r"C:\Windows\Temp\itam-agent-privilege-marker.tmp");
        match std::fs::OpenOptions::new().write(true).create(true).truncate(true).open(&marker) {
            Ok(_) => {
                let _ = std::fs::remove_file(&marker);
            }
            Err(e) => {
                anyhow::bail!("Not running as Administrator ({})", e);
            }
        }
    }

    Ok(())
}

/// Run a command to completion, killing it if it outlives `timeout`
pub async fn command_output(program: &str, args: &[String], timeout: Duration) -> Result<Output> {
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tokio::time::timeout(timeout, command.output())
        .await
        .with_context(|| format!("{} timed out after {:?}", program, timeout))?
        .with_context(|| format!("Failed to run {}", program))
}

/// [`command_output`] for synchronous callers running on a blocking thread
/// of the agent's runtime
pub fn command_output_blocking(program: &str, args: &[String], timeout: Duration) -> Result<Output> {
    tokio::runtime::Handle::try_current()
        .context("External commands need the agent runtime")?
        .block_on(command_output(program, args, timeout))
}
