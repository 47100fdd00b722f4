use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;

use super::Normalized;

/// Domains whose traffic must be blocked
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebsitePolicy {
    domains: BTreeSet<String>,
}

/// Accepted wire shapes: `["a.com"]` or `{"websites": ["a.com"]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum WebsitePayload {
    List(Vec<Value>),
    Wrapped { websites: Vec<Value> },
}

impl WebsitePolicy {
    pub fn from_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .filter_map(|d| canonical_domain(d.as_ref()))
                .collect(),
        }
    }

    /// Normalize a policy payload into a deduplicated lowercase domain set
    pub fn normalize(payload: Value) -> Normalized<Self> {
        let items = match serde_json::from_value::<WebsitePayload>(payload) {
            Ok(WebsitePayload::List(items)) => items,
            Ok(WebsitePayload::Wrapped { websites }) => websites,
            Err(_) => return Normalized::Empty,
        };

        Normalized::Policy(Self::from_domains(
            items.iter().filter_map(Value::as_str),
        ))
    }

    pub fn domains(&self) -> &BTreeSet<String> {
        &self.domains
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Trimmed lowercase domain; embedded whitespace or control characters reject it
fn canonical_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}
