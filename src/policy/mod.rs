// Remote policy retrieval
//
// Two policies are served by the backend: domains to block and prohibited
// software. Both are fetched fresh every cycle and normalized into canonical
// sets before enforcement sees them; raw JSON never leaves this module.

pub mod software;
pub mod website;

use std::sync::Arc;

use serde_json::Value;

use crate::transport::Transport;

pub use software::{SoftwareDescriptor, SoftwarePolicy, descriptor_tokens};
pub use website::WebsitePolicy;

/// Outcome of normalizing a policy payload
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized<T> {
    /// Payload had an accepted shape
    Policy(T),
    /// Payload had any other shape; treated as "no policy"
    Empty,
}

impl<T: Default> Normalized<T> {
    pub fn into_policy(self) -> T {
        match self {
            Normalized::Policy(policy) => policy,
            Normalized::Empty => T::default(),
        }
    }
}

/// Both policies as fetched in one cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicySnapshot {
    pub websites: WebsitePolicy,
    pub software: SoftwarePolicy,
}

/// Fetches and normalizes the remote policies
pub struct PolicyStore {
    transport: Arc<dyn Transport>,
    websites_endpoint: String,
    software_endpoint: String,
}

impl PolicyStore {
    pub fn new(
        transport: Arc<dyn Transport>,
        websites_endpoint: impl Into<String>,
        software_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            websites_endpoint: websites_endpoint.into(),
            software_endpoint: software_endpoint.into(),
        }
    }

    /// Blocked domains; empty when the fetch fails or the payload is unrecognized
    pub async fn fetch_website_policy(&self) -> WebsitePolicy {
        let Some(payload) = self.fetch("website", &self.websites_endpoint).await else {
            return WebsitePolicy::default();
        };

        match WebsitePolicy::normalize(payload) {
            Normalized::Policy(policy) => {
                tracing::info!("Website policy: {} blocked domain(s)", policy.len());
                policy
            }
            Normalized::Empty => {
                tracing::warn!("Website policy payload has an unexpected shape, treating as empty");
                WebsitePolicy::default()
            }
        }
    }

    /// Prohibited software tokens and descriptors; empty on any failure
    pub async fn fetch_software_policy(&self) -> SoftwarePolicy {
        let Some(payload) = self.fetch("software", &self.software_endpoint).await else {
            return SoftwarePolicy::default();
        };

        match SoftwarePolicy::normalize(payload) {
            Normalized::Policy(policy) => {
                tracing::info!(
                    "Software policy: {} token(s) from {} descriptor(s)",
                    policy.tokens().len(),
                    policy.descriptors().len()
                );
                tracing::debug!("Software tokens: {:?}", policy.tokens());
                policy
            }
            Normalized::Empty => {
                tracing::warn!("Software policy payload has an unexpected shape, treating as empty");
                SoftwarePolicy::default()
            }
        }
    }

    /// Fetch both policies, websites first
    pub async fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            websites: self.fetch_website_policy().await,
            software: self.fetch_software_policy().await,
        }
    }

    async fn fetch(&self, kind: &str, endpoint: &str) -> Option<Value> {
        match self.transport.get_json(endpoint).await {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!("Failed to fetch {} policy: {}", kind, e);
                None
            }
        }
    }
}
