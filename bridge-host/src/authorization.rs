//! Authorization gate for signing commands.
//!
//! Checks, in order:
//!
//! 1. Preauthorized credit held by the session for the certificate
//! 2. A remembered trust decision for (domain, certificate)
//! 3. The agent's interactive consent prompt (`authorizeSignatures`)

use std::sync::Arc;

use signbridge_types::{AuthorizationRequest, AuthorizationResponse, BridgeError, Thumbprint};
use tracing::{debug, info};

use crate::dispatch::{CallOptions, Dispatcher};
use crate::session::ClientSession;
use crate::store::TrustStore;

/// Decides whether a session may produce signatures with a certificate.
pub struct AuthorizationGate {
    trust: Arc<dyn TrustStore>,
}

impl AuthorizationGate {
    /// Create a gate backed by `trust`.
    pub fn new(trust: Arc<dyn TrustStore>) -> Self {
        Self { trust }
    }

    /// Authorize `count` signatures with `thumbprint`.
    ///
    /// Fails with `UserCancelled` when the user declines the prompt.
    pub async fn authorize(
        &self,
        dispatcher: &Dispatcher,
        session: &ClientSession,
        thumbprint: &Thumbprint,
        count: u64,
    ) -> Result<(), BridgeError> {
        if session.try_consume_credit(thumbprint, count) {
            debug!(
                %thumbprint,
                remaining = session.remaining_credit(thumbprint),
                "signatures covered by preauthorization"
            );
            tokio::task::yield_now().await;
            return Ok(());
        }

        let domain = session.domain();
        if self.trust.is_trusted(domain, thumbprint).await? {
            debug!(%domain, %thumbprint, "certificate trusted for domain");
            return Ok(());
        }

        info!(%domain, %thumbprint, count, "requesting signature authorization");
        let prompt = AuthorizationRequest {
            certificate_thumbprint: thumbprint.clone(),
            signature_count: count,
            enable_dont_ask_again: None,
        };
        let request =
            serde_json::to_value(&prompt).map_err(|e| BridgeError::Internal(e.to_string()))?;
        let response = dispatcher
            .call(session, "authorizeSignatures", request, CallOptions::default())
            .await?;
        let outcome: AuthorizationResponse = serde_json::from_value(response)
            .map_err(|e| BridgeError::Internal(format!("invalid authorization response: {e}")))?;

        if !outcome.authorized {
            info!(%domain, %thumbprint, "signature authorization declined");
            return Err(BridgeError::UserCancelled);
        }
        if outcome.dont_ask_again {
            if let Some(certificate) = &outcome.certificate {
                self.trust.set_trusted(domain, certificate).await?;
                info!(%domain, %thumbprint, "certificate trust remembered");
            }
        }
        Ok(())
    }

    /// Authorize `count` signatures now and hold them as credit.
    ///
    /// Existing credit for the certificate is discarded first, so the
    /// prompt (or trust check) always covers the full count.
    pub async fn preauthorize(
        &self,
        dispatcher: &Dispatcher,
        session: &ClientSession,
        thumbprint: &Thumbprint,
        count: u64,
    ) -> Result<(), BridgeError> {
        session.reset_credit(thumbprint);
        self.authorize(dispatcher, session, thumbprint, count).await?;
        session.grant_credit(thumbprint, count);
        Ok(())
    }
}

impl std::fmt::Debug for AuthorizationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationGate").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{reply_ok, MockAgentConnector};
    use crate::blocklist::{BlockListService, StaticBlockListSource};
    use crate::config::{AgentConfig, PoolConfig};
    use crate::pool::NativeConnectionPool;
    use crate::store::StateStore;
    use serde_json::json;
    use signbridge_types::{ClientId, Domain};
    use std::time::Duration;

    struct Fixture {
        mock: MockAgentConnector,
        store: Arc<StateStore>,
        dispatcher: Dispatcher,
        gate: AuthorizationGate,
        session: ClientSession,
    }

    fn fixture(answer: serde_json::Value) -> Fixture {
        let mock = MockAgentConnector::with_handler(move |m| Some(reply_ok(m, answer.clone())));
        let store = Arc::new(StateStore::in_memory());
        let pool = NativeConnectionPool::new(Arc::new(mock.clone()), &PoolConfig::default(), "en");
        let blocklist = Arc::new(BlockListService::new(
            Arc::new(StaticBlockListSource::default()),
            Duration::from_millis(100),
        ));
        let dispatcher = Dispatcher::new(pool, None, store.clone(), blocklist, &AgentConfig::default());
        Fixture {
            mock,
            gate: AuthorizationGate::new(store.clone()),
            store,
            dispatcher,
            session: ClientSession::new(ClientId::new(1), Domain::new("example.com")),
        }
    }

    #[tokio::test]
    async fn credit_skips_prompt() {
        let f = fixture(json!({"authorized": false}));
        let cert = Thumbprint::new("aa");
        f.session.grant_credit(&cert, 2);

        f.gate.authorize(&f.dispatcher, &f.session, &cert, 2).await.unwrap();

        assert!(f.mock.received().is_empty());
        assert_eq!(f.session.remaining_credit(&cert), 0);
    }

    #[tokio::test]
    async fn trusted_certificate_skips_prompt() {
        let f = fixture(json!({"authorized": false}));
        let cert = Thumbprint::new("aa");
        f.store
            .set_trusted(
                &Domain::new("example.com"),
                &signbridge_types::CertificateSummary {
                    thumbprint: cert.clone(),
                    subject_name: None,
                    issuer_name: None,
                },
            )
            .await
            .unwrap();

        f.gate.authorize(&f.dispatcher, &f.session, &cert, 1).await.unwrap();

        assert!(f.mock.received().is_empty());
    }

    #[tokio::test]
    async fn prompt_sends_count_and_thumbprint() {
        let f = fixture(json!({"authorized": true}));
        let cert = Thumbprint::new("aa");

        f.gate.authorize(&f.dispatcher, &f.session, &cert, 3).await.unwrap();

        let sent = &f.mock.received()[0];
        assert_eq!(sent["command"], "authorizeSignatures");
        assert_eq!(sent["request"]["certificateThumbprint"], "aa");
        assert_eq!(sent["request"]["signatureCount"], 3);
        assert!(sent["request"]["enableDontAskAgain"].is_null());
    }

    #[tokio::test]
    async fn declined_prompt_is_user_cancelled() {
        let f = fixture(json!({"authorized": false}));
        let err = f
            .gate
            .authorize(&f.dispatcher, &f.session, &Thumbprint::new("aa"), 1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "user_cancelled");
    }

    #[tokio::test]
    async fn dont_ask_again_persists_trust() {
        let f = fixture(json!({
            "authorized": true,
            "dontAskAgain": true,
            "certificate": {"thumbprint": "aa", "subjectName": "Alice"},
        }));
        let cert = Thumbprint::new("aa");

        f.gate.authorize(&f.dispatcher, &f.session, &cert, 1).await.unwrap();

        assert!(f
            .store
            .is_trusted(&Domain::new("example.com"), &cert)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn preauthorize_replaces_credit() {
        let f = fixture(json!({"authorized": true}));
        let cert = Thumbprint::new("aa");
        f.session.grant_credit(&cert, 10);

        f.gate.preauthorize(&f.dispatcher, &f.session, &cert, 4).await.unwrap();

        assert_eq!(f.session.remaining_credit(&cert), 4);
        assert_eq!(f.mock.commands(), vec!["authorizeSignatures"]);
    }
}
