use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use super::Normalized;

/// One prohibited application as described by the backend
///
/// Only `name` and `executableName` drive enforcement; every other field
/// (category, risk level, flags) is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SoftwareDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "executableName", default, skip_serializing_if = "Option::is_none")]
    pub executable_name: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SoftwareDescriptor {
    pub fn new(name: &str, executable_name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            executable_name: Some(executable_name.to_string()),
            extra: Map::new(),
        }
    }

    /// Build from a JSON object, ignoring non-string name fields
    fn from_object(mut object: Map<String, Value>) -> Self {
        let mut take_string = |key: &str| match object.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        let name = take_string("name");
        let executable_name = take_string("executableName");

        Self {
            name,
            executable_name,
            extra: object,
        }
    }

    /// Lowercased name, executable name, and executable name without extension
    pub fn tokens(&self) -> Vec<String> {
        let mut tokens = Vec::with_capacity(3);

        if let Some(name) = self.name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            tokens.push(name.to_lowercase());
        }

        if let Some(exe) = self
            .executable_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let exe = exe.to_lowercase();
            let base = strip_extension(&exe).to_string();
            tokens.push(exe);
            if !base.is_empty() {
                tokens.push(base);
            }
        }

        tokens
    }
}

/// `setup.exe` -> `setup`; names without an extension or with only a
/// leading dot are returned unchanged
fn strip_extension(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((base, _)) if !base.is_empty() && !base.ends_with(['/', '\\']) => base,
        _ => file_name,
    }
}

/// Union of the tokens of every descriptor
pub fn descriptor_tokens(descriptors: &[SoftwareDescriptor]) -> BTreeSet<String> {
    descriptors.iter().flat_map(SoftwareDescriptor::tokens).collect()
}

/// Prohibited software in the two forms enforcement needs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SoftwarePolicy {
    /// Matched against running processes
    tokens: BTreeSet<String>,
    /// Kept for installer cleanup, which only trusts full descriptors
    descriptors: Vec<SoftwareDescriptor>,
}

/// Accepted wire shapes: a list (of descriptors or plain names) or
/// `{"software": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum SoftwarePayload {
    List(Vec<Value>),
    Wrapped { software: Vec<Value> },
}

impl SoftwarePolicy {
    pub fn from_descriptors(descriptors: Vec<SoftwareDescriptor>) -> Self {
        Self {
            tokens: descriptor_tokens(&descriptors),
            descriptors,
        }
    }

    pub fn normalize(payload: Value) -> Normalized<Self> {
        let items = match serde_json::from_value::<SoftwarePayload>(payload) {
            Ok(SoftwarePayload::List(items)) => items,
            Ok(SoftwarePayload::Wrapped { software }) => software,
            Err(_) => return Normalized::Empty,
        };

        let mut tokens = BTreeSet::new();
        let mut descriptors = Vec::new();

        for item in items {
            match item {
                Value::Object(object) => {
                    let descriptor = SoftwareDescriptor::from_object(object);
                    tokens.extend(descriptor.tokens());
                    descriptors.push(descriptor);
                }
                Value::String(name) => {
                    let token = name.trim().to_lowercase();
                    if !token.is_empty() {
                        tokens.insert(token);
                    }
                }
                _ => {}
            }
        }

        Normalized::Policy(Self { tokens, descriptors })
    }

    pub fn tokens(&self) -> &BTreeSet<String> {
        &self.tokens
    }

    pub fn descriptors(&self) -> &[SoftwareDescriptor] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bittorrent_descriptor_yields_expected_tokens() {
        let policy = SoftwarePolicy::normalize(json!([
            {"name": "BitTorrent", "executableName": "bittorrent.exe"}
        ]))
        .into_policy();

        assert_eq!(policy.tokens(), &set(&["bittorrent", "bittorrent.exe"]));
        assert_eq!(policy.descriptors().len(), 1);
    }

    #[test]
    fn extra_fields_pass_through() {
        let policy = SoftwarePolicy::normalize(json!([{
            "id": 1,
            "name": "uTorrent",
            "executableName": "uTorrent.exe",
            "category": "File Sharing",
            "blockExecution": true
        }]))
        .into_policy();

        let descriptor = &policy.descriptors()[0];
        assert_eq!(descriptor.name.as_deref(), Some("uTorrent"));
        assert_eq!(descriptor.extra["category"], "File Sharing");
        assert_eq!(descriptor.extra["id"], 1);
        assert!(!descriptor.extra.contains_key("name"));
    }

    #[test]
    fn missing_and_empty_fields_are_skipped() {
        let policy = SoftwarePolicy::normalize(json!([
            {"name": "  ", "executableName": "steam.exe"},
            {"executableName": null, "name": "Tor Browser"},
            {"category": "nothing useful"}
        ]))
        .into_policy();

        assert_eq!(policy.tokens(), &set(&["steam", "steam.exe", "tor browser"]));
        assert_eq!(policy.descriptors().len(), 3);
    }

    #[test]
    fn plain_string_list_produces_tokens_but_no_descriptors() {
        let policy = SoftwarePolicy::normalize(json!(["Steam", " ", "Discord"])).into_policy();

        assert_eq!(policy.tokens(), &set(&["discord", "steam"]));
        assert!(policy.descriptors().is_empty());
    }

    #[test]
    fn wrapper_object_is_unwrapped() {
        let policy = SoftwarePolicy::normalize(json!({
            "software": [{"name": "AnyDesk", "executableName": "AnyDesk.exe"}]
        }))
        .into_policy();

        assert_eq!(policy.tokens(), &set(&["anydesk", "anydesk.exe"]));
    }

    #[test]
    fn unexpected_shapes_are_empty() {
        assert!(matches!(SoftwarePolicy::normalize(json!({"apps": []})), Normalized::Empty));
        assert!(matches!(SoftwarePolicy::normalize(json!(17)), Normalized::Empty));
    }

    #[test]
    fn strip_extension_matches_file_name_semantics() {
        assert_eq!(strip_extension("bittorrent.exe"), "bittorrent");
        assert_eq!(strip_extension("archive.tar.gz"), "archive.tar");
        assert_eq!(strip_extension("noext"), "noext");
        assert_eq!(strip_extension(".hidden"), ".hidden");
    }
}
