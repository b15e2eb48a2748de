//! SessionProvider - composition root of the auth manager
//!
//! One explicit context object constructed at application start and passed
//! to consumers; no module-level singleton. Wires the session store, the
//! gateway, the refresh scheduler, the offline fallback, and the OAuth
//! recovery coordinator together, and is the only layer that turns an
//! error kind into user-visible text.
//!
//! Lifecycle: construct, `initialize()` once on mount, `shutdown()` on app
//! shutdown or test teardown (cancels the scheduler loop).

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AuthConfig;
use crate::error::Error;
use crate::gateway::{AuthGateway, IdentityBackend};
use crate::http::{HttpIdentityBackend, HttpRecoveryChannel};
use crate::offline::OfflineAuth;
use crate::recovery::{OAuthRecoveryCoordinator, RecoveryChannel, RecoveryOutcome};
use crate::scheduler::{PollOutcome, TokenRefreshScheduler};
use crate::session::{Session, SessionStore, User};
use crate::storage::{FileStore, KeyValueStore, MemoryStore, StorageKeys};
use crate::Result;

/// Process-wide authentication context
pub struct SessionProvider {
    sessions: Arc<SessionStore>,
    gateway: Arc<AuthGateway>,
    scheduler: Arc<TokenRefreshScheduler>,
    recovery: OAuthRecoveryCoordinator,
    offline: Option<OfflineAuth>,
    loading: AtomicBool,
    cancel: CancellationToken,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionProvider {
    /// Wire a provider from explicit collaborators
    ///
    /// `durable` holds both the session and the flow keys; the
    /// session-scoped store is created fresh per provider.
    pub fn new(
        config: &AuthConfig,
        backend: Arc<dyn IdentityBackend>,
        channel: Option<Arc<dyn RecoveryChannel>>,
        durable: Arc<dyn KeyValueStore>,
    ) -> Self {
        let keys = StorageKeys::new(&config.project_ref, &config.storage_namespace);
        let sessions = Arc::new(SessionStore::new(Arc::clone(&durable), keys.clone()));
        let gateway = Arc::new(AuthGateway::new(
            backend,
            Arc::clone(&sessions),
            durable,
            keys.clone(),
            config.base_url.clone(),
        ));
        let scheduler = Arc::new(TokenRefreshScheduler::new(
            Arc::clone(&sessions),
            Arc::clone(&gateway),
            config.poll_interval,
            config.refresh_threshold,
        ));
        let cancel = CancellationToken::new();
        let recovery = OAuthRecoveryCoordinator::new(
            Arc::clone(&gateway),
            channel,
            Arc::new(MemoryStore::new()),
            keys,
            config.settle_delay,
            cancel.clone(),
        );
        // The offline bypass only exists when the flag says so; with the
        // flag unset there is no code path that can reach it.
        let offline = config
            .offline_mode
            .then(|| OfflineAuth::new(Arc::clone(&sessions)));

        Self {
            sessions,
            gateway,
            scheduler,
            recovery,
            offline,
            loading: AtomicBool::new(true),
            cancel,
            scheduler_handle: Mutex::new(None),
        }
    }

    /// Production wiring: HTTP backend, HTTP recovery channel, file-backed
    /// storage under the default app directory
    pub fn connect(config: &AuthConfig) -> Result<Self> {
        if config.base_url.is_empty() || config.api_key.is_empty() {
            return Err(Error::Config(
                "Identity backend URL and API key are required".to_string(),
            ));
        }
        let backend: Arc<dyn IdentityBackend> = Arc::new(HttpIdentityBackend::new(
            config.base_url.clone(),
            config.api_key.clone(),
        ));
        let channel = config
            .recovery_endpoint
            .clone()
            .map(|endpoint| Arc::new(HttpRecoveryChannel::new(endpoint)) as Arc<dyn RecoveryChannel>);
        Ok(Self::new(
            config,
            backend,
            channel,
            Arc::new(FileStore::default_location()),
        ))
    }

    /// Initial session check, run once on mount
    ///
    /// Adopts a stored unexpired session and starts the refresh scheduler.
    /// The loading flag clears once the check completes, whatever the
    /// outcome.
    pub async fn initialize(&self) {
        match self.sessions.load() {
            Some(session) => {
                info!(user = %session.user.id, "Stored session adopted");
            }
            None => debug!("No stored session"),
        }

        let handle = Arc::clone(&self.scheduler).spawn(self.cancel.clone());
        if let Ok(mut slot) = self.scheduler_handle.lock() {
            *slot = Some(handle);
        }

        self.loading.store(false, Ordering::SeqCst);
    }

    /// Whether the initial session check is still running
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// The currently authenticated user, if any
    pub fn current_user(&self) -> Option<User> {
        self.sessions.session().map(|s| s.user)
    }

    /// Observe session changes from any component (sign-out, refresh,
    /// expiry)
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.sessions.subscribe()
    }

    /// Sign in with email and password
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        match &self.offline {
            Some(offline) => offline.sign_in(email, password),
            None => self.gateway.sign_in_with_password(email, password).await,
        }
    }

    /// Sign up with email, password, and profile metadata
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        profile: HashMap<String, Value>,
    ) -> Result<Session> {
        match &self.offline {
            Some(offline) => offline.sign_up(email, password, profile),
            None => {
                self.gateway
                    .sign_up_with_password(email, password, profile)
                    .await
            }
        }
    }

    /// Start an OAuth flow; returns the URL to redirect the user to
    pub fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_to: &str,
        scopes: &[&str],
    ) -> Result<String> {
        self.gateway.sign_in_with_oauth(provider, redirect_to, scopes)
    }

    /// Handle an OAuth redirect callback
    ///
    /// The recovery coordinator's first step is the normal exchange, so
    /// every callback goes through it; intact flows resolve on attempt one
    /// without any recovery machinery engaging. `None` means the session
    /// was established server-side and will be adopted on the next load.
    pub async fn handle_oauth_callback(
        &self,
        code: &str,
        state: Option<&str>,
    ) -> Result<Option<Session>> {
        let report = self.recovery.recover(code, state).await;
        match report.outcome {
            RecoveryOutcome::Recovered => Ok(report.session),
            RecoveryOutcome::Failed => Err(Error::Fatal(
                "OAuth sign-in could not be recovered".to_string(),
            )),
        }
    }

    /// Sign out; idempotent
    pub async fn sign_out(&self) -> Result<()> {
        match &self.offline {
            // No backend to revoke against in offline mode
            Some(_) => self.sessions.clear(),
            None => self.gateway.sign_out().await,
        }
    }

    /// On-demand expiry check before a protected call; also what tests use
    /// to drive the scheduler deterministically
    pub async fn poll_refresh(&self) -> PollOutcome {
        self.scheduler.poll_once().await
    }

    /// Map an error kind to the text shown to the user
    ///
    /// Lower layers return structured kinds only; rendering happens here.
    pub fn user_message(error: &Error) -> String {
        match error {
            Error::InvalidCredentials => "Invalid email or password.".to_string(),
            Error::Network(_) => {
                "Could not reach the sign-in service. Please try again.".to_string()
            }
            Error::SessionExpired => "Your session has expired. Please sign in again.".to_string(),
            Error::FlowStateMismatch(_) | Error::CodeVerifierMissing | Error::Fatal(_) => {
                "Sign-in could not be completed. Please sign in again.".to_string()
            }
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }

    /// Stop the scheduler loop and detach; safe to call more than once
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .scheduler_handle
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!("Session provider shut down");
    }
}
