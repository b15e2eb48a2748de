//! Session entity and canonical session storage
//!
//! `SessionStore` owns the one in-memory copy of the authenticated session;
//! every other component reads it through the accessor and observes changes
//! through the watch channel, never caching a copy beyond a single operation.

use chrono::{serde::ts_milliseconds, DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::storage::{KeyValueStore, StorageKeys};
use crate::Result;

/// The authenticated user attached to a session
///
/// Immutable once attached; replaced only by replacing the whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    /// Arbitrary profile metadata (display name, etc.)
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// The authenticated session: user, tokens, and expiry
///
/// A session whose `expires_at` has passed is invalid and must be purged,
/// never silently reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry instant, stored as epoch milliseconds
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Whether the session is past its expiry at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Signed time remaining until expiry
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> ChronoDuration {
        self.expires_at - now
    }

    /// Whether the session is alive but inside the proactive refresh window
    pub fn within_refresh_threshold(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let remaining = self.time_until_expiry(now);
        remaining > ChronoDuration::zero()
            && remaining <= ChronoDuration::from_std(threshold).unwrap_or(ChronoDuration::zero())
    }
}

/// Serializes the session to/from the key-value store and owns the
/// canonical in-memory copy
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    current: RwLock<Option<Session>>,
    tx: watch::Sender<Option<Session>>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: StorageKeys) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            store,
            keys,
            current: RwLock::new(None),
            tx,
        }
    }

    /// Load the persisted session, if any
    ///
    /// Corrupt stored JSON is logged and discarded, never propagated as a
    /// crash. An already-expired stored session is purged instead of adopted.
    pub fn load(&self) -> Option<Session> {
        let raw = self.store.get(self.keys.session())?;

        let session: Session = match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(e) => {
                warn!("Discarding corrupt stored session: {}", e);
                let _ = self.store.remove(self.keys.session());
                return None;
            }
        };

        if session.is_expired(Utc::now()) {
            debug!("Stored session already expired, purging");
            let _ = self.store.remove(self.keys.session());
            return None;
        }

        self.adopt(session.clone());
        Some(session)
    }

    /// Persist `session` and make it the current one
    pub fn save(&self, session: &Session) -> Result<()> {
        let raw = serde_json::to_string(session)?;
        self.store.set(self.keys.session(), &raw)?;
        self.adopt(session.clone());
        Ok(())
    }

    /// Remove the stored session; idempotent
    ///
    /// The in-memory copy is dropped and subscribers notified before the
    /// durable remove, so even a failing store cannot leave an invalidated
    /// session visible to readers. The storage error still propagates.
    pub fn clear(&self) -> Result<()> {
        if let Ok(mut current) = self.current.write() {
            *current = None;
        }
        self.tx.send_replace(None);
        self.store.remove(self.keys.session())?;
        Ok(())
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Option<Session> {
        self.current.read().ok().and_then(|s| s.clone())
    }

    /// Observe session changes (save, clear, expiry-driven sign-out)
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }

    fn adopt(&self, session: Session) {
        if let Ok(mut current) = self.current.write() {
            *current = Some(session.clone());
        }
        self.tx.send_replace(Some(session));
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A well-formed session expiring `secs_from_now` seconds from now
    pub fn session_expiring_in(secs_from_now: i64) -> Session {
        let mut metadata = HashMap::new();
        metadata.insert(
            "display_name".to_string(),
            serde_json::Value::String("Test User".to_string()),
        );
        Session {
            user: User {
                id: "user-1".to_string(),
                email: "user@example.com".to_string(),
                metadata,
            },
            access_token: "access-token".to_string(),
            refresh_token: "refresh-token".to_string(),
            expires_at: Utc::now() + ChronoDuration::seconds(secs_from_now),
        }
    }
}
