//! Storage key registry
//!
//! The identity SDK has written the code verifier and flow state under
//! several key names across versions. Rather than scatter string literals,
//! every key this crate touches is enumerated here, with the canonical name
//! first and legacy aliases as read-compatibility fallbacks. Recovery's
//! "write to all known aliases" step is a single operation on this type.

use std::sync::Arc;
use tracing::debug;

use super::KeyValueStore;
use crate::Result;

/// Key under which the serialized session is stored
pub const SESSION_KEY: &str = "auth_session";

/// Registry of every flow-related storage key for one deployment
#[derive(Debug, Clone)]
pub struct StorageKeys {
    project_ref: String,
    namespace: String,
}

impl StorageKeys {
    pub fn new(project_ref: &str, namespace: &str) -> Self {
        Self {
            project_ref: project_ref.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Serialized session
    pub fn session(&self) -> &'static str {
        SESSION_KEY
    }

    /// Code verifier keys, canonical first
    pub fn verifier_keys(&self) -> Vec<String> {
        vec![
            format!("sb-{}-auth-token-code-verifier", self.project_ref),
            format!("{}.auth.code_verifier", self.namespace),
            "supabase.auth.code_verifier".to_string(),
        ]
    }

    /// Flow state keys, canonical first
    pub fn flow_state_keys(&self) -> Vec<String> {
        vec![
            format!("sb-{}-auth-flow-state", self.project_ref),
            format!("{}.auth.flow-state", self.namespace),
        ]
    }

    /// Read the code verifier, preferring the canonical key and falling
    /// back through the legacy aliases in order
    pub fn read_verifier(&self, store: &dyn KeyValueStore) -> Option<String> {
        for key in self.verifier_keys() {
            if let Some(value) = store.get(&key) {
                debug!(key = %key, "code verifier found");
                return Some(value);
            }
        }
        None
    }

    /// Read the flow state, canonical key first
    pub fn read_flow_state(&self, store: &dyn KeyValueStore) -> Option<String> {
        self.flow_state_keys()
            .iter()
            .find_map(|key| store.get(key))
    }

    /// Write the verifier under every known key name
    ///
    /// The compatibility surface (which SDK versions read which key) is not
    /// fully known, so writes still fan out to all aliases.
    pub fn write_verifier_everywhere(
        &self,
        store: &dyn KeyValueStore,
        verifier: &str,
    ) -> Result<()> {
        for key in self.verifier_keys() {
            store.set(&key, verifier)?;
        }
        Ok(())
    }

    /// Write the flow state under every known key name
    pub fn write_flow_state_everywhere(
        &self,
        store: &dyn KeyValueStore,
        flow_state: &str,
    ) -> Result<()> {
        for key in self.flow_state_keys() {
            store.set(&key, flow_state)?;
        }
        Ok(())
    }

    /// Remove every flow-related key (verifier and flow state, all aliases)
    pub fn purge_flow_keys(&self, store: &dyn KeyValueStore) -> Result<()> {
        for key in self.verifier_keys().into_iter().chain(self.flow_state_keys()) {
            store.remove(&key)?;
        }
        Ok(())
    }

    /// Purge flow keys across multiple stores (durable + session-scoped)
    pub fn purge_flow_keys_all(&self, stores: &[Arc<dyn KeyValueStore>]) -> Result<()> {
        for store in stores {
            self.purge_flow_keys(store.as_ref())?;
        }
        Ok(())
    }
}
