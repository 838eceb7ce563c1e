//! Client session state.
//!
//! One [`ClientSession`] per connected caller. It carries the caller's
//! domain, the options of its latest request, the opaque path handles
//! issued to it and its preauthorized signature credit.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use signbridge_core::CreditLedger;
use signbridge_types::{BridgeError, ClientId, ClientRequest, Domain, Thumbprint};

use crate::pool::ChannelMode;

/// What an opaque path handle is expected to point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// A file.
    File,
    /// A folder.
    Folder,
}

impl PathKind {
    /// Name used in error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            PathKind::File => "File",
            PathKind::Folder => "Folder",
        }
    }
}

#[derive(Default)]
struct SessionState {
    license: Option<Value>,
    use_pool: bool,
    paths: HashMap<String, String>,
    credit: CreditLedger,
    disconnected: bool,
}

/// A connected caller.
pub struct ClientSession {
    id: ClientId,
    domain: Domain,
    state: Mutex<SessionState>,
}

impl ClientSession {
    /// Create a session for `domain`.
    pub fn new(id: ClientId, domain: Domain) -> Self {
        Self {
            id,
            domain,
            state: Mutex::new(SessionState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Session id.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Caller domain.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Whether the caller is the bridge's own UI.
    pub fn is_popup(&self) -> bool {
        self.domain.is_popup()
    }

    /// Take the license and pooling choice of the latest request.
    pub fn apply_request_options(&self, request: &ClientRequest) {
        let mut state = self.lock();
        state.license = request.license.clone();
        state.use_pool = request.use_domain_native_pool;
    }

    /// License of the latest request.
    pub fn license(&self) -> Option<Value> {
        self.lock().license.clone()
    }

    /// Channel mode requested by the latest request.
    pub fn channel_mode(&self) -> ChannelMode {
        if self.lock().use_pool {
            ChannelMode::Pooled
        } else {
            ChannelMode::Private
        }
    }

    // ===========================================
    // Opaque paths
    // ===========================================

    /// Issue a handle for an agent-supplied path.
    pub fn register_path(&self, path: impl Into<String>) -> String {
        let handle = uuid::Uuid::new_v4().to_string();
        self.lock().paths.insert(handle.clone(), path.into());
        handle
    }

    /// Resolve a handle issued by [`register_path`](Self::register_path).
    pub fn resolve_path(&self, handle: &str, kind: PathKind) -> Result<String, BridgeError> {
        self.lock()
            .paths
            .get(handle)
            .cloned()
            .ok_or_else(|| BridgeError::PathNotFound {
                kind: kind.as_str(),
                handle: handle.to_string(),
            })
    }

    // ===========================================
    // Preauthorized credit
    // ===========================================

    /// Consume credit for `count` signatures if enough remains.
    pub fn try_consume_credit(&self, thumbprint: &Thumbprint, count: u64) -> bool {
        self.lock().credit.try_consume(thumbprint, count)
    }

    /// Set the credit for `thumbprint`.
    pub fn grant_credit(&self, thumbprint: &Thumbprint, count: u64) {
        self.lock().credit.grant(thumbprint, count);
    }

    /// Drop any credit for `thumbprint`.
    pub fn reset_credit(&self, thumbprint: &Thumbprint) {
        self.lock().credit.reset(thumbprint);
    }

    /// Remaining credit for `thumbprint`.
    pub fn remaining_credit(&self, thumbprint: &Thumbprint) -> u64 {
        self.lock().credit.remaining(thumbprint)
    }

    // ===========================================
    // Lifecycle
    // ===========================================

    /// Mark the caller gone.
    pub fn mark_disconnected(&self) {
        self.lock().disconnected = true;
    }

    /// Whether the caller is gone.
    pub fn is_disconnected(&self) -> bool {
        self.lock().disconnected
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
