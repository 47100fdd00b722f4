use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::agent::CacheSettings;
use crate::platform::common::atomic_write;

/// Deduplication identity of a reported device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Derive the key from the device name and IP address
    pub fn new(name: &str, ip_address: &str) -> Self {
        Self(format!("nameip:{}|{}", name, ip_address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persistent record of which devices were already delivered to the backend
///
/// Entries older than the retention window are dropped by [`prune`], and
/// when more than `max_entries` remain only the most recently sent survive.
/// Eviction only happens during pruning, never on access.
///
/// [`prune`]: DeliveryCache::prune
#[derive(Debug)]
pub struct DeliveryCache {
    path: PathBuf,
    retention: Duration,
    max_entries: usize,
    entries: HashMap<DeviceKey, DateTime<Utc>>,
}

impl DeliveryCache {
    /// Empty cache persisted at `path`
    pub fn new(path: impl Into<PathBuf>, retention: Duration, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            retention,
            max_entries,
            entries: HashMap::new(),
        }
    }

    /// Load the cache from disk and prune it
    ///
    /// A missing, unreadable or corrupt file yields an empty cache.
    pub fn load(settings: &CacheSettings) -> Self {
        let mut cache = Self::new(
            settings.path.clone(),
            Duration::days(settings.ttl_days),
            settings.max_entries,
        );

        match read_entries(&cache.path) {
            Ok(entries) => cache.entries = entries,
            Err(e) => {
                tracing::warn!("Ignoring unreadable delivery cache: {:#}", e);
            }
        }

        tracing::debug!(
            "Loaded {} delivery cache entries from {}",
            cache.entries.len(),
            cache.path.display()
        );

        if let Err(e) = cache.prune() {
            tracing::warn!("Could not save delivery cache: {:#}", e);
        }

        cache
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` was delivered within the retention window
    pub fn already_sent(&self, key: &DeviceKey) -> bool {
        self.already_sent_at(key, Utc::now())
    }

    fn already_sent_at(&self, key: &DeviceKey, now: DateTime<Utc>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|sent| *sent >= now - self.retention)
    }

    /// Record a delivery of `key` now and persist immediately
    pub fn mark_sent(&mut self, key: DeviceKey) -> Result<()> {
        self.mark_sent_at(key, Utc::now())
    }

    fn mark_sent_at(&mut self, key: DeviceKey, now: DateTime<Utc>) -> Result<()> {
        self.entries.insert(key, now);
        self.save()
    }

    /// Drop expired entries, enforce the size cap, then persist
    ///
    /// Returns the number of entries removed.
    pub fn prune(&mut self) -> Result<usize> {
        self.prune_at(Utc::now())
    }

    fn prune_at(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.entries.len();
        let cutoff = now - self.retention;

        self.entries.retain(|_, sent| *sent >= cutoff);

        if self.entries.len() > self.max_entries {
            let mut newest: Vec<(DeviceKey, DateTime<Utc>)> = self.entries.drain().collect();
            // Chronological order; the key only breaks ties so eviction is deterministic
            newest.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            newest.truncate(self.max_entries);
            self.entries = newest.into_iter().collect();
        }

        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!("Pruned {} delivery cache entries", removed);
        }

        self.save()?;
        Ok(removed)
    }

    /// Write the cache as a `key -> RFC 3339 timestamp` JSON object
    pub fn save(&self) -> Result<()> {
        let serialized: BTreeMap<&str, String> = self
            .entries
            .iter()
            .map(|(key, sent)| (key.as_str(), sent.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .collect();

        let content = serde_json::to_string(&serialized).context("Failed to serialize delivery cache")?;

        atomic_write(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write delivery cache: {}", self.path.display()))
    }
}

fn read_entries(path: &Path) -> Result<HashMap<DeviceKey, DateTime<Utc>>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read delivery cache: {}", path.display()))?;

    let raw: HashMap<String, String> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse delivery cache: {}", path.display()))?;

    let mut entries = HashMap::with_capacity(raw.len());
    for (key, stamp) in raw {
        match parse_timestamp(&stamp) {
            Some(sent) => {
                entries.insert(DeviceKey(key), sent);
            }
            None => tracing::debug!("Dropping cache entry {} with bad timestamp {:?}", key, stamp),
        }
    }

    Ok(entries)
}

/// Accept RFC 3339 and the older naive local `YYYY-MM-DDTHH:MM:SS` form
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings(path: PathBuf, max_entries: usize) -> CacheSettings {
        CacheSettings {
            path,
            ttl_days: 30,
            max_entries,
        }
    }

    fn key(n: u32) -> DeviceKey {
        DeviceKey::new(&format!("device-{}", n), &format!("10.0.0.{}", n))
    }

    #[test]
    fn device_key_combines_name_and_ip() {
        let key = DeviceKey::new("printer", "10.0.0.9");
        assert_eq!(key.as_str(), "nameip:printer|10.0.0.9");
        assert_eq!(key, DeviceKey::new("printer", "10.0.0.9"));
        assert_ne!(key, DeviceKey::new("printer", "10.0.0.10"));
    }

    #[test]
    fn mark_sent_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut cache = DeliveryCache::new(dir.path().join("sent.json"), Duration::days(30), 10);
        let first = Utc::now() - Duration::hours(2);
        let second = Utc::now();

        cache.mark_sent_at(key(1), first).unwrap();
        cache.mark_sent_at(key(1), second).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entries[&key(1)], second);
        assert!(cache.already_sent(&key(1)));
        assert!(!cache.already_sent(&key(2)));
    }

    #[test]
    fn mark_sent_persists_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sent.json");
        let mut cache = DeliveryCache::new(&path, Duration::days(30), 10);

        cache.mark_sent(key(3)).unwrap();

        let reloaded = DeliveryCache::load(&settings(path, 10));
        assert!(reloaded.already_sent(&key(3)));
    }

    #[test]
    fn prune_drops_entries_outside_retention() {
        let dir = tempdir().unwrap();
        let mut cache = DeliveryCache::new(dir.path().join("sent.json"), Duration::days(30), 10);
        let now = Utc::now();

        cache.entries.insert(key(1), now - Duration::days(31));
        cache.entries.insert(key(2), now - Duration::days(29));

        let removed = cache.prune_at(now).unwrap();

        assert_eq!(removed, 1);
        assert!(!cache.entries.contains_key(&key(1)));
        assert!(cache.entries.contains_key(&key(2)));
        assert!(cache.entries.values().all(|sent| *sent >= now - Duration::days(30)));
    }

    #[test]
    fn prune_keeps_only_most_recent_over_cap() {
        let dir = tempdir().unwrap();
        let mut cache = DeliveryCache::new(dir.path().join("sent.json"), Duration::days(30), 3);
        let now = Utc::now();

        for n in 1..=6 {
            cache.entries.insert(key(n), now - Duration::hours(i64::from(10 - n)));
        }

        cache.prune_at(now).unwrap();

        assert_eq!(cache.len(), 3);
        for n in 4..=6 {
            assert!(cache.entries.contains_key(&key(n)), "newest entry {} evicted", n);
        }
    }

    #[test]
    fn expired_entry_is_not_considered_sent() {
        let dir = tempdir().unwrap();
        let mut cache = DeliveryCache::new(dir.path().join("sent.json"), Duration::days(30), 10);
        cache.entries.insert(key(1), Utc::now() - Duration::days(45));

        assert!(!cache.already_sent(&key(1)));
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sent.json");
        std::fs::write(&path, "{ not json").unwrap();

        let cache = DeliveryCache::load(&settings(path, 10));

        assert!(cache.is_empty());
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let cache = DeliveryCache::load(&settings(dir.path().join("absent.json"), 10));
        assert!(cache.is_empty());
    }

    #[test]
    fn load_accepts_naive_timestamps_and_drops_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sent.json");
        let recent = Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S").to_string();
        let content = serde_json::json!({
            "nameip:nas|10.0.0.2": recent,
            "nameip:tv|10.0.0.3": "yesterday-ish",
        });
        std::fs::write(&path, content.to_string()).unwrap();

        let cache = DeliveryCache::load(&settings(path, 10));

        assert!(cache.already_sent(&DeviceKey::new("nas", "10.0.0.2")));
        assert!(!cache.already_sent(&DeviceKey::new("tv", "10.0.0.3")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn saved_file_uses_rfc3339_timestamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sent.json");
        let mut cache = DeliveryCache::new(&path, Duration::days(30), 10);

        cache.mark_sent(key(7)).unwrap();

        let raw: HashMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let stamp = &raw["nameip:device-7|10.0.0.7"];
        assert!(DateTime::parse_from_rfc3339(stamp).is_ok());
    }
}
