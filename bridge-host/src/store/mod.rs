//! Persisted host state.
//!
//! Trust decisions, cached certificates, learned PKCS#11 modules and paired
//! devices. The traits are the seams the router and authorization gate use;
//! [`StateStore`] backs all of them.

mod state;

pub use state::StateStore;

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use signbridge_types::{CertificateSummary, Domain, Thumbprint};

/// Per-domain certificate trust ("don't ask again").
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Whether `domain` may sign with `thumbprint` without a prompt.
    async fn is_trusted(&self, domain: &Domain, thumbprint: &Thumbprint) -> Result<bool, StoreError>;

    /// Remember that `domain` may sign with `certificate`.
    async fn set_trusted(
        &self,
        domain: &Domain,
        certificate: &CertificateSummary,
    ) -> Result<(), StoreError>;

    /// Forget the trust decision for `(domain, thumbprint)`.
    async fn clear_trusted(&self, domain: &Domain, thumbprint: &Thumbprint) -> Result<(), StoreError>;
}

/// Caches and learned settings sent along with agent calls.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// A certificate read earlier.
    async fn cached_certificate(&self, thumbprint: &Thumbprint) -> Result<Option<Value>, StoreError>;

    /// Remember a certificate read from the agent.
    async fn cache_certificate(&self, thumbprint: &Thumbprint, content: Value) -> Result<(), StoreError>;

    /// PKCS#11 module paths sent with every agent message.
    async fn pkcs11_modules(&self) -> Result<Vec<String>, StoreError>;

    /// Add module paths, skipping case-insensitive duplicates.
    async fn add_pkcs11_modules(&self, modules: &[String]) -> Result<(), StoreError>;
}
