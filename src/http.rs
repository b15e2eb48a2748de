//! HTTP implementations of the identity backend and recovery channel
//!
//! Talks to a GoTrue-shaped identity API: password and refresh grants go
//! through `/token`, sign-up through `/signup`, PKCE redemption through
//! `/token?grant_type=pkce`. Every transport or protocol failure is
//! converted into a typed [`Error`](crate::error::Error) kind here; nothing
//! downstream sees a raw `reqwest` error.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::Error;
use crate::gateway::{IdentityBackend, TokenGrant};
use crate::recovery::{RecoveryChannel, RecoveryResponse};
use crate::session::User;
use crate::Result;

/// Token endpoint success payload
#[derive(Debug, Deserialize)]
struct GrantResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    user: UserResponse,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    email: String,
    #[serde(default)]
    user_metadata: HashMap<String, Value>,
}

/// Error payload shape the identity backend returns on 4xx
#[derive(Debug, Deserialize, Default)]
struct ApiError {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct SignUpRequest<'a> {
    email: &'a str,
    password: &'a str,
    data: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
struct PkceGrant<'a> {
    auth_code: &'a str,
    code_verifier: &'a str,
}

/// Identity backend over HTTP
pub struct HttpIdentityBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpIdentityBackend {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
        }
    }

    async fn grant(&self, response: Response) -> Result<TokenGrant> {
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        let body: GrantResponse = response.json().await?;
        Ok(TokenGrant {
            user: User {
                id: body.user.id,
                email: body.user.email,
                metadata: body.user.user_metadata,
            },
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_in_secs: body.expires_in,
        })
    }
}

/// Map an error response body into the error taxonomy
async fn classify(response: Response) -> Error {
    let status = response.status();
    let body: ApiError = response.json().await.unwrap_or_default();
    let code = body.error_code.as_deref().unwrap_or("");
    let message = body
        .msg
        .or(body.error_description)
        .unwrap_or_else(|| format!("HTTP {}", status));

    debug!(status = %status, code = code, "Identity backend error");

    match code {
        "invalid_credentials" | "invalid_grant" => Error::InvalidCredentials,
        "flow_state_not_found" | "flow_state_expired" | "bad_oauth_state" => {
            Error::FlowStateMismatch(message)
        }
        "bad_code_verifier" => Error::CodeVerifierMissing,
        _ if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY => {
            // Credential-shaped 400s without a recognized code are still
            // user errors, not transport failures
            Error::InvalidCredentials
        }
        _ => Error::Network(message),
    }
}

#[async_trait]
impl IdentityBackend for HttpIdentityBackend {
    async fn sign_in(&self, email: &str, password: &str) -> Result<TokenGrant> {
        let response = self
            .client
            .post(format!("{}/token?grant_type=password", self.base_url))
            .header("apikey", &self.api_key)
            .json(&PasswordGrant { email, password })
            .send()
            .await?;
        self.grant(response).await
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: HashMap<String, Value>,
    ) -> Result<TokenGrant> {
        let response = self
            .client
            .post(format!("{}/signup", self.base_url))
            .header("apikey", &self.api_key)
            .json(&SignUpRequest {
                email,
                password,
                data: metadata,
            })
            .send()
            .await?;
        self.grant(response).await
    }

    async fn sign_out(&self, access_token: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/logout", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let response = self
            .client
            .post(format!("{}/token?grant_type=refresh_token", self.base_url))
            .header("apikey", &self.api_key)
            .json(&RefreshGrant { refresh_token })
            .send()
            .await?;
        self.grant(response).await
    }

    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenGrant> {
        let response = self
            .client
            .post(format!("{}/token?grant_type=pkce", self.base_url))
            .header("apikey", &self.api_key)
            .json(&PkceGrant {
                auth_code: code,
                code_verifier: verifier,
            })
            .send()
            .await?;
        self.grant(response).await
    }
}

/// Server-assisted recovery over a narrow HTTP GET
///
/// The server side holds a privileged channel that is not subject to
/// client-side storage loss; this client only reports whether it succeeded.
pub struct HttpRecoveryChannel {
    client: Client,
    endpoint: String,
}

impl HttpRecoveryChannel {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl RecoveryChannel for HttpRecoveryChannel {
    async fn assist(&self, code: &str, state: Option<&str>) -> Result<RecoveryResponse> {
        let mut request = self.client.get(&self.endpoint).query(&[("code", code)]);
        if let Some(state) = state {
            request = request.query(&[("state", state)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "Recovery endpoint returned an error status");
            return Err(Error::Network(format!(
                "Recovery endpoint HTTP {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}
