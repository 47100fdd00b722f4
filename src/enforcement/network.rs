use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::agent::EnforcementSettings;

/// Which mechanism carried out network blocking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMethod {
    HostsFile,
    Firewall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOutcome {
    pub method: BlockMethod,
    /// Hosts lines written or firewall rules installed
    pub entries: usize,
    /// Domains that did not resolve or rules that could not be added
    pub skipped: usize,
}

/// Reconciles agent-owned network blocks with the current domain set
///
/// Every call replaces all previously installed agent blocks; calling it
/// twice with the same domains leaves the same final state.
pub trait NetworkBlocker: Send + Sync {
    fn apply(&self, domains: &BTreeSet<String>) -> Result<BlockOutcome>;
}

/// Blocks domains by pointing them at 0.0.0.0 in a hosts file
pub struct HostsFileBlocker {
    path: PathBuf,
    marker: String,
}

impl HostsFileBlocker {
    pub fn new(path: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            marker: marker.into(),
        }
    }
}

/// Drop every line carrying `marker`, then append one block line per domain
///
/// Works on raw bytes: hosts files are not guaranteed to be UTF-8, and
/// foreign lines are copied through unchanged apart from a missing final
/// newline. Domains that could split a line are never written.
pub fn render_hosts(existing: &[u8], domains: &BTreeSet<String>, marker: &str) -> Vec<u8> {
    let marker = marker.as_bytes();
    let mut out = Vec::with_capacity(existing.len() + domains.len() * 48);

    for line in existing.split_inclusive(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        if contains_bytes(line, marker) {
            continue;
        }
        out.extend_from_slice(line);
        out.push(b'\n');
    }

    for domain in domains.iter().filter(|d| is_single_token(d)) {
        out.extend_from_slice(format!("0.0.0.0 {} ", domain).as_bytes());
        out.extend_from_slice(marker);
        out.push(b'\n');
    }

    out
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

fn is_single_token(domain: &str) -> bool {
    !domain.is_empty() && !domain.chars().any(|c| c.is_whitespace() || c.is_control())
}

impl NetworkBlocker for HostsFileBlocker {
    fn apply(&self, domains: &BTreeSet<String>) -> Result<BlockOutcome> {
        let existing = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read hosts file: {}", self.path.display())
                });
            }
        };

        let rendered = render_hosts(&existing, domains, &self.marker);

        // Written in place; the hosts file is often a bind mount that cannot be renamed over
        std::fs::write(&self.path, rendered)
            .with_context(|| format!("Failed to write hosts file: {}", self.path.display()))?;

        info!(
            "Applied website blocking for {} domain(s) via {}",
            domains.len(),
            self.path.display()
        );

        Ok(BlockOutcome {
            method: BlockMethod::HostsFile,
            entries: domains.len(),
            skipped: 0,
        })
    }
}

/// Forward DNS lookups for firewall blocking
pub trait DomainResolver: Send + Sync {
    fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>>;
}

#[derive(Debug, Default)]
pub struct SystemDnsResolver;

impl DomainResolver for SystemDnsResolver {
    fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        let addrs = (domain, 0)
            .to_socket_addrs()
            .with_context(|| format!("DNS resolution failed for {}", domain))?;

        Ok(addrs
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .collect())
    }
}

/// Named outbound-block rules in a host firewall
pub trait FirewallRules: Send + Sync {
    /// Remove every rule carrying `rule_name`; succeeds when none exist
    fn delete_rules(&self, rule_name: &str) -> Result<()>;

    fn add_block_rule(&self, rule_name: &str, ip: Ipv4Addr) -> Result<()>;
}

/// Blocks domains by resolving them and installing one firewall rule per IPv4
pub struct FirewallBlocker {
    resolver: Box<dyn DomainResolver>,
    rules: Box<dyn FirewallRules>,
    rule_name: String,
}

impl FirewallBlocker {
    pub fn new(
        resolver: Box<dyn DomainResolver>,
        rules: Box<dyn FirewallRules>,
        rule_name: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            rules,
            rule_name: rule_name.into(),
        }
    }

    fn resolve_all(&self, domains: &BTreeSet<String>) -> (BTreeSet<Ipv4Addr>, usize) {
        let mut ips = BTreeSet::new();
        let mut unresolved = 0;

        for domain in domains {
            match self.resolver.resolve_ipv4(domain) {
                Ok(found) if !found.is_empty() => ips.extend(found),
                Ok(_) => {
                    unresolved += 1;
                    warn!("No IPv4 address for blocked domain {}", domain);
                }
                Err(e) => {
                    unresolved += 1;
                    warn!("{:#}", e);
                }
            }
        }

        (ips, unresolved)
    }
}

impl NetworkBlocker for FirewallBlocker {
    fn apply(&self, domains: &BTreeSet<String>) -> Result<BlockOutcome> {
        let (ips, unresolved) = self.resolve_all(domains);

        if ips.is_empty() {
            warn!("No IPs resolved for blocked domains; leaving firewall rules unchanged");
            return Ok(BlockOutcome {
                method: BlockMethod::Firewall,
                entries: 0,
                skipped: unresolved,
            });
        }

        // Full replace: stale rules for domains no longer on the policy go away here
        self.rules
            .delete_rules(&self.rule_name)
            .with_context(|| format!("Failed to remove existing {} rules", self.rule_name))?;

        let mut added = 0;
        let mut failed = 0;
        for ip in &ips {
            match self.rules.add_block_rule(&self.rule_name, *ip) {
                Ok(()) => added += 1,
                Err(e) => {
                    failed += 1;
                    warn!("Failed to add firewall rule for {}: {:#}", ip, e);
                }
            }
        }

        if added > 0 {
            info!(
                "Applied firewall blocks for {} IP(s) from {} domain(s)",
                added,
                domains.len()
            );
        } else {
            warn!("No firewall rules were added for blocked websites");
        }

        Ok(BlockOutcome {
            method: BlockMethod::Firewall,
            entries: added,
            skipped: unresolved + failed,
        })
    }
}

/// Firewall on Windows, hosts file everywhere else
pub fn platform_network_blocker(settings: &EnforcementSettings) -> Box<dyn NetworkBlocker> {
    #[cfg(target_os = "windows")]
    {
        Box::new(FirewallBlocker::new(
            Box::new(SystemDnsResolver),
            Box::new(crate::platform::windows::NetshFirewall),
            settings.firewall_rule_name.clone(),
        ))
    }

    #[cfg(not(target_os = "windows"))]
    {
        Box::new(HostsFileBlocker::new(
            settings.hosts_path.clone(),
            settings.hosts_marker.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const MARKER: &str = "# finecons-agent-block";

    fn domains(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn render_preserves_foreign_lines_in_order() {
        let existing = b"127.0.0.1 localhost\n# comment\n::1 localhost\n";
        let rendered = render_hosts(existing, &domains(&["a.com"]), MARKER);

        assert_eq!(
            String::from_utf8(rendered).unwrap(),
            "127.0.0.1 localhost\n# comment\n::1 localhost\n0.0.0.0 a.com # finecons-agent-block\n"
        );
    }

    #[test]
    fn render_replaces_stale_agent_lines() {
        let existing = b"127.0.0.1 localhost\n0.0.0.0 old.com # finecons-agent-block\n10.0.0.2 nas\n";
        let rendered = String::from_utf8(render_hosts(existing, &domains(&["new.com"]), MARKER)).unwrap();

        assert!(!rendered.contains("old.com"));
        assert!(rendered.starts_with("127.0.0.1 localhost\n10.0.0.2 nas\n"));
        assert!(rendered.ends_with("0.0.0.0 new.com # finecons-agent-block\n"));
    }

    #[test]
    fn render_keeps_crlf_and_terminates_last_line() {
        let rendered = render_hosts(b"127.0.0.1 localhost\r\n10.0.0.2 nas", &BTreeSet::new(), MARKER);
        assert_eq!(rendered, b"127.0.0.1 localhost\r\n10.0.0.2 nas\n");
    }

    #[test]
    fn non_utf8_hosts_lines_survive_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        std::fs::write(&hosts, b"127.0.0.1 localhost # caf\xe9\n").unwrap();

        let blocker = HostsFileBlocker::new(&hosts, MARKER);
        blocker.apply(&domains(&["a.com"])).unwrap();
        blocker.apply(&domains(&["a.com"])).unwrap();

        assert_eq!(
            std::fs::read(&hosts).unwrap(),
            b"127.0.0.1 localhost # caf\xe9\n0.0.0.0 a.com # finecons-agent-block\n"
        );
    }

    #[test]
    fn multiline_policy_entry_does_not_accumulate_lines() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        std::fs::write(&hosts, "127.0.0.1 localhost\n").unwrap();

        let policy = crate::policy::WebsitePolicy::normalize(serde_json::json!(["a.com\nb.com", "c.com"]))
            .into_policy();
        let blocker = HostsFileBlocker::new(&hosts, MARKER);
        for _ in 0..3 {
            blocker.apply(policy.domains()).unwrap();
        }

        assert_eq!(
            std::fs::read_to_string(&hosts).unwrap(),
            "127.0.0.1 localhost\n0.0.0.0 c.com # finecons-agent-block\n"
        );
    }

    #[test]
    fn domains_that_would_split_a_line_are_not_written() {
        let rendered = render_hosts(b"", &domains(&["a.com\nb.com", "c.com"]), MARKER);
        assert_eq!(rendered, b"0.0.0.0 c.com # finecons-agent-block\n");
    }

    #[test]
    fn hosts_blocking_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        std::fs::write(&hosts, "127.0.0.1 localhost\n").unwrap();

        let blocker = HostsFileBlocker::new(&hosts, MARKER);
        let set = domains(&["facebook.com", "tiktok.com"]);

        blocker.apply(&set).unwrap();
        let first = std::fs::read_to_string(&hosts).unwrap();
        blocker.apply(&set).unwrap();
        let second = std::fs::read_to_string(&hosts).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.matches(MARKER).count(), 2);
    }

    #[test]
    fn hosts_blocking_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");

        let outcome = HostsFileBlocker::new(&hosts, MARKER)
            .apply(&domains(&["a.com"]))
            .unwrap();

        assert_eq!(outcome.entries, 1);
        assert_eq!(
            std::fs::read_to_string(&hosts).unwrap(),
            "0.0.0.0 a.com # finecons-agent-block\n"
        );
    }

    #[test]
    fn unwritable_hosts_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be read or written as a file
        let blocker = HostsFileBlocker::new(dir.path(), MARKER);
        assert!(blocker.apply(&domains(&["a.com"])).is_err());
    }

    struct FakeDns(pub HashMap<String, Vec<Ipv4Addr>>);

    impl DomainResolver for FakeDns {
        fn resolve_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
            self.0
                .get(domain)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("NXDOMAIN {}", domain))
        }
    }

    /// Shared rule table so tests can inspect it after handing the fake to a blocker
    #[derive(Clone, Default)]
    struct FakeFirewall {
        pub rules: std::sync::Arc<Mutex<Vec<(String, Ipv4Addr)>>>,
        pub refuse: Option<Ipv4Addr>,
    }

    impl FirewallRules for FakeFirewall {
        fn delete_rules(&self, rule_name: &str) -> Result<()> {
            self.rules.lock().unwrap().retain(|(name, _)| name != rule_name);
            Ok(())
        }

        fn add_block_rule(&self, rule_name: &str, ip: Ipv4Addr) -> Result<()> {
            if self.refuse == Some(ip) {
                anyhow::bail!("access denied");
            }
            self.rules.lock().unwrap().push((rule_name.to_string(), ip));
            Ok(())
        }
    }

    fn dns(entries: &[(&str, &[Ipv4Addr])]) -> FakeDns {
        FakeDns(
            entries
                .iter()
                .map(|(d, ips)| (d.to_string(), ips.to_vec()))
                .collect(),
        )
    }

    #[test]
    fn firewall_blocking_is_idempotent() {
        let firewall = FakeFirewall::default();
        let blocker = FirewallBlocker::new(
            Box::new(dns(&[
                ("a.com", &[Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(1, 1, 1, 2)]),
                ("b.com", &[Ipv4Addr::new(1, 1, 1, 2)]),
            ])),
            Box::new(firewall.clone()),
            "FineconsAgentBlock",
        );
        let set = domains(&["a.com", "b.com"]);

        blocker.apply(&set).unwrap();
        let first = firewall.rules.lock().unwrap().clone();
        let outcome = blocker.apply(&set).unwrap();
        let second = firewall.rules.lock().unwrap().clone();

        assert_eq!(first, second);
        assert_eq!(second.len(), 2);
        assert_eq!(outcome.entries, 2);
    }

    #[test]
    fn firewall_removes_rules_for_dropped_domains_and_keeps_foreign_rules() {
        let firewall = FakeFirewall::default();
        firewall
            .rules
            .lock()
            .unwrap()
            .extend([
                ("FineconsAgentBlock".to_string(), Ipv4Addr::new(9, 9, 9, 9)),
                ("CorpVpn".to_string(), Ipv4Addr::new(10, 8, 0, 1)),
            ]);

        let blocker = FirewallBlocker::new(
            Box::new(dns(&[("a.com", &[Ipv4Addr::new(1, 1, 1, 1)])])),
            Box::new(firewall.clone()),
            "FineconsAgentBlock",
        );
        blocker.apply(&domains(&["a.com"])).unwrap();

        let rules = firewall.rules.lock().unwrap().clone();
        assert_eq!(
            rules,
            vec![
                ("CorpVpn".to_string(), Ipv4Addr::new(10, 8, 0, 1)),
                ("FineconsAgentBlock".to_string(), Ipv4Addr::new(1, 1, 1, 1)),
            ]
        );
    }

    #[test]
    fn firewall_skips_when_nothing_resolves() {
        let firewall = FakeFirewall::default();
        firewall
            .rules
            .lock()
            .unwrap()
            .push(("FineconsAgentBlock".to_string(), Ipv4Addr::new(9, 9, 9, 9)));

        let blocker = FirewallBlocker::new(
            Box::new(dns(&[])),
            Box::new(firewall.clone()),
            "FineconsAgentBlock",
        );
        let outcome = blocker.apply(&domains(&["gone.example"])).unwrap();

        assert_eq!(outcome.entries, 0);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(firewall.rules.lock().unwrap().len(), 1);
    }

    #[test]
    fn firewall_rule_failure_does_not_stop_remaining_rules() {
        let firewall = FakeFirewall {
            refuse: Some(Ipv4Addr::new(1, 1, 1, 1)),
            ..Default::default()
        };
        let blocker = FirewallBlocker::new(
            Box::new(dns(&[(
                "a.com",
                &[Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2)],
            )])),
            Box::new(firewall.clone()),
            "FineconsAgentBlock",
        );

        let outcome = blocker.apply(&domains(&["a.com"])).unwrap();

        assert_eq!(outcome.entries, 1);
        assert_eq!(outcome.skipped, 1);
    }
}
