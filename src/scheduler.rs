//! Proactive token refresh scheduling
//!
//! Polls the current session's expiry on a fixed cadence and refreshes the
//! token through the gateway shortly before it would die. A hard expiry is
//! terminal: the session is cleared and never resurrected. A failed refresh
//! is simply retried by the next poll; the threshold window gives several
//! poll opportunities before the token actually expires, so no separate
//! back-off timer is kept.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::AuthGateway;
use crate::session::SessionStore;

/// What a single scheduler poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No session, or the session is comfortably far from expiry
    Idle,
    /// The session was past expiry and has been cleared
    Expired,
    /// A refresh succeeded and the session was replaced
    Refreshed,
    /// A refresh attempt failed; the next poll will retry
    RefreshFailed,
    /// Another refresh was already in flight; this trigger was dropped
    AlreadyInFlight,
}

/// Keeps the access token valid ahead of expiry
pub struct TokenRefreshScheduler {
    sessions: Arc<SessionStore>,
    gateway: Arc<AuthGateway>,
    poll_interval: Duration,
    refresh_threshold: Duration,
    // Checked-and-set before the first await of a refresh; the only
    // mutual-exclusion mechanism in the manager.
    refresh_in_flight: AtomicBool,
}

impl TokenRefreshScheduler {
    pub fn new(
        sessions: Arc<SessionStore>,
        gateway: Arc<AuthGateway>,
        poll_interval: Duration,
        refresh_threshold: Duration,
    ) -> Self {
        Self {
            sessions,
            gateway,
            poll_interval,
            refresh_threshold,
            refresh_in_flight: AtomicBool::new(false),
        }
    }

    /// Inspect the current session once and act on its expiry
    ///
    /// Public so callers can force an on-demand check before a protected
    /// call, and so tests can drive the scheduler deterministically.
    pub async fn poll_once(&self) -> PollOutcome {
        let Some(session) = self.sessions.session() else {
            return PollOutcome::Idle;
        };

        let now = Utc::now();
        if session.is_expired(now) {
            // Terminal: subscribers observe the sign-out, nothing retries.
            info!("Session expired, signing out");
            if let Err(e) = self.sessions.clear() {
                warn!("Failed to clear expired session: {}", e);
            }
            return PollOutcome::Expired;
        }

        if !session.within_refresh_threshold(now, self.refresh_threshold) {
            return PollOutcome::Idle;
        }

        if self
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Refresh already in flight, ignoring trigger");
            return PollOutcome::AlreadyInFlight;
        }

        let outcome = match self.gateway.refresh_session(&session.refresh_token).await {
            Ok(refreshed) => {
                debug!(expires_at = %refreshed.expires_at, "Token refreshed ahead of expiry");
                PollOutcome::Refreshed
            }
            Err(e) => {
                // Transient failures degrade gracefully: the session stays
                // until the next poll retries or hard expiry clears it.
                warn!("Token refresh failed: {}", e);
                PollOutcome::RefreshFailed
            }
        };

        self.refresh_in_flight.store(false, Ordering::SeqCst);
        outcome
    }

    /// Run the polling loop until `cancel` fires
    ///
    /// The owning provider cancels this on shutdown so no poll acts on a
    /// disposed context.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(interval_secs = self.poll_interval.as_secs(), "Refresh scheduler started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Refresh scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                }
            }
        })
    }
}
