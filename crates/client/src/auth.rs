//! Bearer token acquisition via the OAuth2 client-credentials grant.

use serde::Deserialize;
use tracing::{debug, instrument};
use verdict_core::VerdictError;

/// Identity provider used by the public gateway.
pub const DEFAULT_TOKEN_ENDPOINT: &str =
    "https://account.gdata.de/realms/vaas-production/protocol/openid-connect/token";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Client id and secret issued by the service operator.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    client: reqwest::Client,
}

impl ClientCredentials {
    #[must_use]
    pub fn new(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Fetch a fresh access token.
    ///
    /// # Errors
    ///
    /// `Authentication` if the endpoint is unreachable, rejects the
    /// credentials, or answers without an `access_token`.
    #[instrument(skip(self), fields(endpoint = %self.token_endpoint, client_id = %self.client_id))]
    pub async fn token(&self) -> Result<String, VerdictError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let resp = self
            .client
            .post(&self.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| VerdictError::Authentication(format!("token request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(VerdictError::Authentication(format!(
                "token endpoint answered {status}"
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| VerdictError::Authentication(format!("invalid token response: {e}")))?;
        debug!("access token acquired");
        Ok(body.access_token)
    }
}
