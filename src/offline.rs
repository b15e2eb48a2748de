//! Offline credential fallback
//!
//! When the offline flag is set, the manager behaves as if authenticated
//! without touching the network, keeping the app usable during identity
//! provider outages or disconnected development. This is a narrow,
//! auditable bypass gated by a single sentinel password, not a general
//! mock; the provider never constructs it when the flag is unset.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::Error;
use crate::session::{Session, SessionStore, User};
use crate::Result;

/// The one password the offline bypass accepts
const OFFLINE_SENTINEL: &str = "offline";

/// Synthetic sessions live long enough to outlast any outage
const OFFLINE_SESSION_DAYS: i64 = 30;

/// Synthesizes local sessions when the identity backend is unreachable
pub struct OfflineAuth {
    sessions: Arc<SessionStore>,
}

impl OfflineAuth {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }

    /// Sign in: any syntactically valid email with the sentinel password
    pub fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        self.synthesize(email, password, HashMap::new())
    }

    /// Sign up behaves identically to sign in offline
    pub fn sign_up(
        &self,
        email: &str,
        password: &str,
        profile: HashMap<String, Value>,
    ) -> Result<Session> {
        self.synthesize(email, password, profile)
    }

    fn synthesize(
        &self,
        email: &str,
        password: &str,
        mut metadata: HashMap<String, Value>,
    ) -> Result<Session> {
        if password != OFFLINE_SENTINEL || !is_valid_email(email) {
            return Err(Error::InvalidCredentials);
        }

        metadata.insert("offline".to_string(), Value::Bool(true));
        let session = Session {
            user: User {
                id: Uuid::new_v4().to_string(),
                email: email.to_string(),
                metadata,
            },
            access_token: format!("offline-access-{}", Uuid::new_v4()),
            refresh_token: format!("offline-refresh-{}", Uuid::new_v4()),
            expires_at: Utc::now() + ChronoDuration::days(OFFLINE_SESSION_DAYS),
        };

        self.sessions.save(&session)?;
        info!(email = email, "Offline session synthesized");
        Ok(session)
    }
}

/// Syntactic email check: one `@`, non-empty local part, dotted domain
fn is_valid_email(email: &str) -> bool {
    let mut parts = email.splitn(2, '@');
    let local = parts.next().unwrap_or("");
    let domain = parts.next().unwrap_or("");
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
