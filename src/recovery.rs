//! OAuth PKCE recovery coordination
//!
//! Handles the redirect callback of an authorization-code flow when the
//! browser context cannot find the code verifier that started it (storage
//! partitioning, a different tab, a crashed flow). Each step is strictly
//! more invasive than the last, and at most three exchange round-trips are
//! ever made:
//!
//! 1. `ExchangeAttempt` with whatever verifier is stored
//! 2. `Regenerate` a verifier, write it under all known keys, retry once
//! 3. `ServerAssistedRecovery` through a privileged server-side channel
//! 4. `FullReset`: purge every flow key, regenerate, one final exchange

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::AuthGateway;
use crate::pkce::generate_code_verifier;
use crate::session::{Session, SessionStore};
use crate::storage::{KeyValueStore, StorageKeys};
use crate::Result;

/// States of the recovery machine; `Recovered` and `Failed` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    ExchangeAttempt,
    Regenerate,
    ServerAssistedRecovery,
    FullReset,
    Recovered,
    Failed,
}

/// Final verdict of a recovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    Failed,
}

/// How a single exchange attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure(String),
}

/// Transient per-attempt record, kept only to bound and explain the run
#[derive(Debug, Clone)]
pub struct RecoveryAttempt {
    pub attempt_number: u32,
    pub regenerated: bool,
    pub outcome: AttemptOutcome,
}

/// What a recovery run produced
///
/// `session` is `None` when recovery succeeded through the server-assisted
/// channel and the session will be adopted on the next load.
#[derive(Debug)]
pub struct RecoveryReport {
    pub outcome: RecoveryOutcome,
    pub session: Option<Session>,
    pub attempts: Vec<RecoveryAttempt>,
}

/// Response of the server-assisted recovery endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Privileged server-side fallback for step 3
#[async_trait]
pub trait RecoveryChannel: Send + Sync {
    async fn assist(&self, code: &str, state: Option<&str>) -> Result<RecoveryResponse>;
}

/// Drives the multi-step PKCE recovery sequence
pub struct OAuthRecoveryCoordinator {
    gateway: Arc<AuthGateway>,
    channel: Option<Arc<dyn RecoveryChannel>>,
    sessions: Arc<SessionStore>,
    /// Durable flow-key storage (the one the gateway reads the verifier from)
    durable: Arc<dyn KeyValueStore>,
    /// Session-scoped storage; purged alongside the durable one on reset
    ephemeral: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    settle_delay: Duration,
    /// Set when the owning page navigates away; gates all state writes
    cancel: CancellationToken,
}

impl OAuthRecoveryCoordinator {
    pub fn new(
        gateway: Arc<AuthGateway>,
        channel: Option<Arc<dyn RecoveryChannel>>,
        ephemeral: Arc<dyn KeyValueStore>,
        keys: StorageKeys,
        settle_delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let durable = gateway.flow_store();
        let sessions = gateway.session_store();
        Self {
            gateway,
            channel,
            sessions,
            durable,
            ephemeral,
            keys,
            settle_delay,
            cancel,
        }
    }

    /// Run the recovery sequence for one redirect callback
    ///
    /// Never hangs: the attempt count is bounded, every failure advances to
    /// the next step, and the terminal `Failed` leaves the flow keys purged
    /// so the user can start a clean sign-in.
    pub async fn recover(&self, code: &str, flow_state: Option<&str>) -> RecoveryReport {
        let mut attempts = Vec::new();

        if self.cancel.is_cancelled() {
            return self.failed(attempts);
        }

        // Step 1: exchange with whatever verifier is currently stored.
        let first_error = match self.try_exchange(code, false, &mut attempts).await {
            Ok(session) => return self.adopt(session, attempts),
            Err(e) => e,
        };

        // Step 2: a broken flow context gets one regenerate-and-retry.
        // A non-flow failure (plain network error) skips this: a fresh
        // verifier cannot fix a transport problem.
        if first_error.is_flow_error() && !self.cancel.is_cancelled() {
            info!(step = ?RecoveryState::Regenerate, "Regenerating code verifier");
            if let Err(e) = self.rewrite_verifier() {
                warn!("Failed to persist regenerated verifier: {}", e);
            }
            // Let the write flush before retrying.
            tokio::time::sleep(self.settle_delay).await;

            match self.try_exchange(code, true, &mut attempts).await {
                Ok(session) => return self.adopt(session, attempts),
                Err(e) => debug!("Retried exchange still failing: {}", e),
            }
        }

        // Step 3: delegate to the server-side channel, which is not subject
        // to client storage loss.
        if let Some(channel) = &self.channel {
            if self.cancel.is_cancelled() {
                return self.failed(attempts);
            }
            info!(step = ?RecoveryState::ServerAssistedRecovery, "Delegating to recovery endpoint");
            match channel.assist(code, flow_state).await {
                Ok(response) if response.success => {
                    if self.cancel.is_cancelled() {
                        return self.failed(attempts);
                    }
                    // The server established the session out of band; adopt
                    // the local copy if one is already visible.
                    return self.recovered(self.gateway.get_session(), attempts);
                }
                Ok(response) => {
                    warn!(
                        error = response.error.as_deref().unwrap_or("unspecified"),
                        "Server-assisted recovery rejected"
                    );
                }
                Err(e) => warn!("Server-assisted recovery failed: {}", e),
            }
        }

        // Step 4: full reset. Purge every flow key in both stores, start
        // from a fresh verifier, and try exactly once more.
        if self.cancel.is_cancelled() {
            return self.failed(attempts);
        }
        info!(step = ?RecoveryState::FullReset, "Purging flow state and retrying once");
        if let Err(e) = self.purge_all_flow_keys() {
            warn!("Flow key purge failed: {}", e);
        }
        if let Err(e) = self.rewrite_verifier() {
            warn!("Failed to persist reset verifier: {}", e);
        }

        match self.try_exchange(code, true, &mut attempts).await {
            Ok(session) => self.adopt(session, attempts),
            Err(e) => {
                warn!("Recovery exhausted: {}", e);
                self.failed(attempts)
            }
        }
    }

    /// Adopt an exchanged session, unless cancellation raced the exchange
    ///
    /// The gateway persists the session before the exchange future
    /// resolves, so a cancellation that lands mid-flight is undone here
    /// rather than surfaced as state nobody owns.
    fn adopt(&self, session: Session, attempts: Vec<RecoveryAttempt>) -> RecoveryReport {
        if self.cancel.is_cancelled() {
            warn!("Recovery cancelled mid-exchange, discarding session");
            let _ = self.sessions.clear();
            return self.failed(attempts);
        }
        self.recovered(Some(session), attempts)
    }

    async fn try_exchange(
        &self,
        code: &str,
        regenerated: bool,
        attempts: &mut Vec<RecoveryAttempt>,
    ) -> Result<Session> {
        let attempt_number = attempts.len() as u32 + 1;
        let result = self.gateway.exchange_code_for_session(code).await;

        let outcome = match &result {
            Ok(_) => AttemptOutcome::Success,
            Err(e) => AttemptOutcome::Failure(e.to_string()),
        };
        debug!(
            attempt = attempt_number,
            regenerated = regenerated,
            outcome = ?outcome,
            "Exchange attempt finished"
        );
        attempts.push(RecoveryAttempt {
            attempt_number,
            regenerated,
            outcome,
        });
        result
    }

    /// Write a fresh verifier under every known key name in both stores
    fn rewrite_verifier(&self) -> Result<()> {
        let verifier = generate_code_verifier();
        self.keys
            .write_verifier_everywhere(self.durable.as_ref(), &verifier)?;
        self.keys
            .write_verifier_everywhere(self.ephemeral.as_ref(), &verifier)?;
        Ok(())
    }

    fn purge_all_flow_keys(&self) -> Result<()> {
        self.keys
            .purge_flow_keys_all(&[Arc::clone(&self.durable), Arc::clone(&self.ephemeral)])
    }

    fn recovered(&self, session: Option<Session>, attempts: Vec<RecoveryAttempt>) -> RecoveryReport {
        info!(attempts = attempts.len(), "OAuth flow recovered");
        RecoveryReport {
            outcome: RecoveryOutcome::Recovered,
            session,
            attempts,
        }
    }

    fn failed(&self, attempts: Vec<RecoveryAttempt>) -> RecoveryReport {
        // Terminal: leave a clean slate for the next sign-in attempt.
        if !self.cancel.is_cancelled() {
            if let Err(e) = self.purge_all_flow_keys() {
                warn!("Final flow key purge failed: {}", e);
            }
        }
        RecoveryReport {
            outcome: RecoveryOutcome::Failed,
            session: None,
            attempts,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MockRecoveryChannel;
    use super::*;
    use crate::gateway::test_support::{MockBackend, MockOutcome};
    use crate::gateway::IdentityBackend;
    use crate::session::SessionStore;
    use crate::storage::MemoryStore;
    use std::sync::atomic::Ordering;

    struct Fixture {
        coordinator: OAuthRecoveryCoordinator,
        backend: Arc<MockBackend>,
        durable: Arc<dyn KeyValueStore>,
        keys: StorageKeys,
    }

    fn fixture(channel: Option<Arc<dyn RecoveryChannel>>) -> Fixture {
        let backend = Arc::new(MockBackend::new());
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let keys = StorageKeys::new("demo", "mesa");
        let sessions = Arc::new(SessionStore::new(Arc::clone(&durable), keys.clone()));
        let gateway = Arc::new(AuthGateway::new(
            Arc::clone(&backend) as Arc<dyn IdentityBackend>,
            sessions,
            Arc::clone(&durable),
            keys.clone(),
            "https://demo.example.com/auth/v1".to_string(),
        ));
        let coordinator = OAuthRecoveryCoordinator::new(
            gateway,
            channel,
            Arc::new(MemoryStore::new()),
            keys.clone(),
            Duration::ZERO,
            CancellationToken::new(),
        );
        Fixture {
            coordinator,
            backend,
            durable,
            keys,
        }
    }

    #[tokio::test]
    async fn test_intact_flow_recovers_on_first_attempt() {
        let f = fixture(None);
        f.keys
            .write_verifier_everywhere(f.durable.as_ref(), "stored-verifier")
            .unwrap();

        let report = f.coordinator.recover("abc", None).await;
        assert_eq!(report.outcome, RecoveryOutcome::Recovered);
        assert!(report.session.is_some());
        assert_eq!(report.attempts.len(), 1);
        assert!(!report.attempts[0].regenerated);
        assert_eq!(f.backend.exchange_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_verifier_recovers_after_one_regenerate() {
        // No verifier anywhere: attempt 1 fails client-side without a
        // network call, the regenerated verifier is accepted.
        let f = fixture(None);

        let report = f.coordinator.recover("abc", None).await;
        assert_eq!(report.outcome, RecoveryOutcome::Recovered);
        assert_eq!(report.attempts.len(), 2);
        assert!(report.attempts[1].regenerated);
        assert_eq!(f.backend.exchange_calls.load(Ordering::SeqCst), 1);

        // The backend saw the regenerated verifier, and it is what storage
        // now holds.
        let stored = f.keys.read_verifier(f.durable.as_ref()).unwrap();
        assert_eq!(f.backend.last_verifier().as_deref(), Some(stored.as_str()));
    }

    #[tokio::test]
    async fn test_server_assist_recovers_when_exchanges_fail() {
        let channel = Arc::new(MockRecoveryChannel::accepting());
        let f = fixture(Some(Arc::clone(&channel) as Arc<dyn RecoveryChannel>));
        f.keys
            .write_verifier_everywhere(f.durable.as_ref(), "stale-verifier")
            .unwrap();
        f.backend.script_exchange(vec![
            MockOutcome::FlowStateMismatch,
            MockOutcome::FlowStateMismatch,
        ]);

        let report = f.coordinator.recover("abc", Some("state-1")).await;
        assert_eq!(report.outcome, RecoveryOutcome::Recovered);
        assert!(report.session.is_none());
        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.backend.exchange_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_full_reset_is_the_last_resort() {
        let channel = Arc::new(MockRecoveryChannel::rejecting());
        let f = fixture(Some(channel as Arc<dyn RecoveryChannel>));
        f.keys
            .write_verifier_everywhere(f.durable.as_ref(), "stale-verifier")
            .unwrap();
        // Attempts 1 and 2 rejected, the post-reset attempt succeeds.
        f.backend.script_exchange(vec![
            MockOutcome::FlowStateMismatch,
            MockOutcome::FlowStateMismatch,
            MockOutcome::Grant {
                expires_in_secs: 3600,
            },
        ]);

        let report = f.coordinator.recover("abc", None).await;
        assert_eq!(report.outcome, RecoveryOutcome::Recovered);
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(f.backend.exchange_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejecting_backend_terminates_in_failed() {
        let channel = Arc::new(MockRecoveryChannel::rejecting());
        let f = fixture(Some(channel as Arc<dyn RecoveryChannel>));
        f.keys
            .write_verifier_everywhere(f.durable.as_ref(), "stale-verifier")
            .unwrap();
        f.backend.script_exchange(vec![
            MockOutcome::FlowStateMismatch,
            MockOutcome::FlowStateMismatch,
            MockOutcome::FlowStateMismatch,
        ]);

        let report = f.coordinator.recover("abc", None).await;
        assert_eq!(report.outcome, RecoveryOutcome::Failed);
        // Bounded: never more than three exchange round-trips
        assert_eq!(f.backend.exchange_calls.load(Ordering::SeqCst), 3);
        // Terminal failure leaves a clean slate
        assert!(f.keys.read_verifier(f.durable.as_ref()).is_none());
    }

    #[tokio::test]
    async fn test_network_failure_skips_regenerate() {
        let f = fixture(None);
        f.keys
            .write_verifier_everywhere(f.durable.as_ref(), "stored-verifier")
            .unwrap();
        f.backend.script_exchange(vec![
            MockOutcome::NetworkFailure,
            MockOutcome::Grant {
                expires_in_secs: 3600,
            },
        ]);

        let report = f.coordinator.recover("abc", None).await;
        // Straight to full reset: no regenerate retry happened in between
        assert_eq!(report.outcome, RecoveryOutcome::Recovered);
        assert_eq!(report.attempts.len(), 2);
        assert!(!report.attempts[0].regenerated);
        assert!(report.attempts[1].regenerated);
    }

    #[tokio::test]
    async fn test_cancelled_coordinator_makes_no_calls() {
        let backend = Arc::new(MockBackend::new());
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let keys = StorageKeys::new("demo", "mesa");
        let sessions = Arc::new(SessionStore::new(Arc::clone(&durable), keys.clone()));
        let gateway = Arc::new(AuthGateway::new(
            Arc::clone(&backend) as Arc<dyn IdentityBackend>,
            sessions,
            Arc::clone(&durable),
            keys.clone(),
            "https://demo.example.com/auth/v1".to_string(),
        ));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let coordinator = OAuthRecoveryCoordinator::new(
            gateway,
            None,
            Arc::new(MemoryStore::new()),
            keys,
            Duration::ZERO,
            cancel,
        );

        let report = coordinator.recover("abc", None).await;
        assert_eq!(report.outcome, RecoveryOutcome::Failed);
        assert!(report.attempts.is_empty());
        assert_eq!(backend.exchange_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_exchange_discards_the_session() {
        // Cancellation lands while the exchange round-trip is in flight:
        // the grant must not survive as a persisted session.
        let backend = Arc::new(MockBackend::with_latency(Duration::from_millis(50)));
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let keys = StorageKeys::new("demo", "mesa");
        let sessions = Arc::new(SessionStore::new(Arc::clone(&durable), keys.clone()));
        let gateway = Arc::new(AuthGateway::new(
            Arc::clone(&backend) as Arc<dyn IdentityBackend>,
            Arc::clone(&sessions),
            Arc::clone(&durable),
            keys.clone(),
            "https://demo.example.com/auth/v1".to_string(),
        ));
        keys.write_verifier_everywhere(durable.as_ref(), "stored-verifier")
            .unwrap();
        let cancel = CancellationToken::new();
        let coordinator = OAuthRecoveryCoordinator::new(
            gateway,
            None,
            Arc::new(MemoryStore::new()),
            keys,
            Duration::ZERO,
            cancel.clone(),
        );

        let (report, _) = tokio::join!(coordinator.recover("abc", None), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        assert_eq!(report.outcome, RecoveryOutcome::Failed);
        assert!(report.session.is_none());
        assert!(sessions.session().is_none());
        // The exchange itself did run, once
        assert_eq!(backend.exchange_calls.load(Ordering::SeqCst), 1);
    }
}
