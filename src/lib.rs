//! mesa-auth - client-side authentication session and OAuth recovery manager
//!
//! Maintains the Mesa app's authenticated session across launches, refreshes
//! tokens ahead of expiry, falls back to an offline credential mode when the
//! identity backend is unreachable, and recovers broken OAuth PKCE redirect
//! flows when the code verifier is lost or mismatched.
//!
//! [`provider::SessionProvider`] is the entry point; everything else is the
//! machinery it composes.

pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod offline;
pub mod pkce;
pub mod provider;
pub mod recovery;
pub mod scheduler;
pub mod session;
pub mod storage;

pub use config::AuthConfig;
pub use error::{Error, Result};
pub use provider::SessionProvider;
pub use session::{Session, User};
