//! AuthGateway - uniform access to the identity provider
//!
//! Wraps every identity-provider network operation behind a typed result;
//! nothing throws across this boundary. Successful sign-in/up/refresh/
//! exchange calls persist the new session through `SessionStore`; sign-out
//! clears it.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;
use crate::pkce::{generate_flow_state, PkcePair};
use crate::session::{Session, SessionStore, User};
use crate::storage::{KeyValueStore, StorageKeys};
use crate::Result;

/// Raw success payload of a token-granting backend call
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in_secs: i64,
}

impl TokenGrant {
    /// Convert the relative expiry into an absolute session
    pub fn into_session(self) -> Session {
        Session {
            user: self.user,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: Utc::now() + ChronoDuration::seconds(self.expires_in_secs),
        }
    }
}

/// The identity provider's network operations
///
/// Implementations convert every transport failure into a typed [`Error`]
/// kind before returning; none panic or leak raw transport errors.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<TokenGrant>;

    /// May reject a duplicate email as a normal business error, so callers
    /// must not blindly retry it.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: HashMap<String, Value>,
    ) -> Result<TokenGrant>;

    async fn sign_out(&self, access_token: &str) -> Result<()>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenGrant>;
}

/// Gateway over the identity backend with session persistence side effects
pub struct AuthGateway {
    backend: Arc<dyn IdentityBackend>,
    sessions: Arc<SessionStore>,
    flow_store: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    base_url: String,
}

impl AuthGateway {
    pub fn new(
        backend: Arc<dyn IdentityBackend>,
        sessions: Arc<SessionStore>,
        flow_store: Arc<dyn KeyValueStore>,
        keys: StorageKeys,
        base_url: String,
    ) -> Self {
        Self {
            backend,
            sessions,
            flow_store,
            keys,
            base_url,
        }
    }

    /// Sign in with email and password; persists the session on success
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let grant = self.backend.sign_in(email, password).await?;
        let session = grant.into_session();
        self.sessions.save(&session)?;
        info!(user = %session.user.id, "Signed in");
        Ok(session)
    }

    /// Sign up with email, password, and profile metadata
    pub async fn sign_up_with_password(
        &self,
        email: &str,
        password: &str,
        profile: HashMap<String, Value>,
    ) -> Result<Session> {
        let grant = self.backend.sign_up(email, password, profile).await?;
        let session = grant.into_session();
        self.sessions.save(&session)?;
        info!(user = %session.user.id, "Signed up");
        Ok(session)
    }

    /// Start an OAuth authorization-code flow
    ///
    /// Generates a PKCE pair and flow state, persists both under every
    /// known storage key, and returns the URL to redirect the user to.
    /// The redirect itself is the network step; no backend call happens here.
    pub fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_to: &str,
        scopes: &[&str],
    ) -> Result<String> {
        let pkce = PkcePair::new();
        let flow_state = generate_flow_state();

        self.keys
            .write_verifier_everywhere(self.flow_store.as_ref(), &pkce.verifier)?;
        self.keys
            .write_flow_state_everywhere(self.flow_store.as_ref(), &flow_state)?;

        let mut url = Url::parse(&format!("{}/authorize", self.base_url))
            .map_err(|e| Error::Config(format!("Invalid auth base URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("provider", provider)
            .append_pair("redirect_to", redirect_to)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "s256")
            .append_pair("state", &flow_state);
        if !scopes.is_empty() {
            url.query_pairs_mut()
                .append_pair("scopes", &scopes.join(" "));
        }

        debug!(provider = provider, "OAuth flow started");
        Ok(url.to_string())
    }

    /// Sign out: clear the stored session and best-effort revoke the token
    ///
    /// Idempotent; signing out with no session is not an error.
    pub async fn sign_out(&self) -> Result<()> {
        let session = self.sessions.session();
        self.sessions.clear()?;

        if let Some(session) = session {
            // Revocation failure is logged, not surfaced: the client-side
            // session is already gone.
            if let Err(e) = self.backend.sign_out(&session.access_token).await {
                warn!("Backend sign-out failed: {}", e);
            }
        }
        Ok(())
    }

    /// Current unexpired session, if any
    ///
    /// An expired session found here is purged, never returned.
    pub fn get_session(&self) -> Option<Session> {
        let session = self.sessions.session()?;
        if session.is_expired(Utc::now()) {
            debug!("Current session expired, purging");
            let _ = self.sessions.clear();
            return None;
        }
        Some(session)
    }

    /// Exchange a refresh token for a new session; persists on success
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<Session> {
        let grant = self.backend.refresh(refresh_token).await?;
        let session = grant.into_session();
        self.sessions.save(&session)?;
        debug!(expires_at = %session.expires_at, "Session refreshed");
        Ok(session)
    }

    /// Redeem an OAuth authorization code using the stored code verifier
    ///
    /// An absent verifier fails with `CodeVerifierMissing` before any
    /// network round-trip. Flow keys are left in place; the recovery
    /// coordinator owns purging them when a flow ends.
    pub async fn exchange_code_for_session(&self, code: &str) -> Result<Session> {
        let verifier = self
            .keys
            .read_verifier(self.flow_store.as_ref())
            .ok_or(Error::CodeVerifierMissing)?;

        let grant = self.backend.exchange_code(code, &verifier).await?;
        let session = grant.into_session();
        self.sessions.save(&session)?;
        info!(user = %session.user.id, "OAuth code exchanged");
        Ok(session)
    }

    /// The store holding flow-recovery keys (shared with the recovery
    /// coordinator)
    pub fn flow_store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.flow_store)
    }

    /// The session store this gateway persists through
    pub fn session_store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.sessions)
    }

    /// The key registry this gateway writes under
    pub fn storage_keys(&self) -> &StorageKeys {
        &self.keys
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted outcome for one mock backend call
    #[derive(Debug, Clone)]
    pub enum MockOutcome {
        Grant { expires_in_secs: i64 },
        InvalidCredentials,
        FlowStateMismatch,
        NetworkFailure,
    }

    /// Scriptable identity backend for tests
    ///
    /// Each operation pops the next scripted outcome, or falls back to a
    /// plain grant when the script is empty. Call counts are recorded so
    /// tests can assert on exactly how many network calls happened.
    #[derive(Default)]
    pub struct MockBackend {
        pub sign_in_calls: AtomicUsize,
        pub refresh_calls: AtomicUsize,
        pub exchange_calls: AtomicUsize,
        pub sign_out_calls: AtomicUsize,
        grant_counter: AtomicUsize,
        exchange_script: Mutex<VecDeque<MockOutcome>>,
        refresh_script: Mutex<VecDeque<MockOutcome>>,
        /// Artificial latency so concurrent calls genuinely overlap
        pub latency: Option<Duration>,
        last_verifier: Mutex<Option<String>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_latency(latency: Duration) -> Self {
            Self {
                latency: Some(latency),
                ..Self::default()
            }
        }

        pub fn script_exchange(&self, outcomes: Vec<MockOutcome>) {
            *self.exchange_script.lock().unwrap() = outcomes.into();
        }

        pub fn script_refresh(&self, outcomes: Vec<MockOutcome>) {
            *self.refresh_script.lock().unwrap() = outcomes.into();
        }

        pub fn last_verifier(&self) -> Option<String> {
            self.last_verifier.lock().unwrap().clone()
        }

        fn grant(&self, expires_in_secs: i64) -> TokenGrant {
            let n = self.grant_counter.fetch_add(1, Ordering::SeqCst);
            TokenGrant {
                user: User {
                    id: "user-1".to_string(),
                    email: "user@example.com".to_string(),
                    metadata: HashMap::new(),
                },
                access_token: format!("access-{}", n),
                refresh_token: format!("refresh-{}", n),
                expires_in_secs,
            }
        }

        fn apply(&self, outcome: MockOutcome) -> Result<TokenGrant> {
            match outcome {
                MockOutcome::Grant { expires_in_secs } => Ok(self.grant(expires_in_secs)),
                MockOutcome::InvalidCredentials => Err(Error::InvalidCredentials),
                MockOutcome::FlowStateMismatch => {
                    Err(Error::FlowStateMismatch("flow_state_not_found".to_string()))
                }
                MockOutcome::NetworkFailure => {
                    Err(Error::Network("connection refused".to_string()))
                }
            }
        }

        async fn pause(&self) {
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
        }
    }

    #[async_trait]
    impl IdentityBackend for MockBackend {
        async fn sign_in(&self, _email: &str, password: &str) -> Result<TokenGrant> {
            self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
            self.pause().await;
            if password == "wrong" {
                return Err(Error::InvalidCredentials);
            }
            Ok(self.grant(3600))
        }

        async fn sign_up(
            &self,
            _email: &str,
            _password: &str,
            _metadata: HashMap<String, Value>,
        ) -> Result<TokenGrant> {
            self.pause().await;
            Ok(self.grant(3600))
        }

        async fn sign_out(&self, _access_token: &str) -> Result<()> {
            self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.pause().await;
            let next = self.refresh_script.lock().unwrap().pop_front();
            match next {
                Some(outcome) => self.apply(outcome),
                None => Ok(self.grant(3600)),
            }
        }

        async fn exchange_code(&self, _code: &str, verifier: &str) -> Result<TokenGrant> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_verifier.lock().unwrap() = Some(verifier.to_string());
            self.pause().await;
            let next = self.exchange_script.lock().unwrap().pop_front();
            match next {
                Some(outcome) => self.apply(outcome),
                None => Ok(self.grant(3600)),
            }
        }
    }
}
