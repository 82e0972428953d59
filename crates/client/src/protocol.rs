//! Wire protocol for the verdict service.
//!
//! Every message is a JSON text frame:
//! - Client: `AuthRequest`, `VerdictRequest`, `VerdictRequestForUrl`,
//!   `VerdictRequestForStream`, tagged by `kind`
//! - Server: an untagged auth result during the handshake, `VerdictResponse` afterwards

use serde::{Deserialize, Serialize};
use verdict_core::{ScanVerdict, Verdict, VerdictError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum ClientMessage {
    AuthRequest { token: String },
    VerdictRequest(VerdictRequest),
    VerdictRequestForUrl(VerdictRequestForUrl),
    VerdictRequestForStream(VerdictRequestForStream),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerdictRequest {
    pub session_id: String,
    pub sha256: String,
    pub guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_hash_lookup: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerdictRequestForUrl {
    pub session_id: String,
    pub url: String,
    pub guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_hash_lookup: Option<bool>,
}

/// Announces a sample that will be uploaded without a known digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerdictRequestForStream {
    pub session_id: String,
    pub guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_hash_lookup: Option<bool>,
}

impl ClientMessage {
    /// Correlation id carried by verdict requests.
    #[must_use]
    pub fn guid(&self) -> Option<&str> {
        match self {
            Self::AuthRequest { .. } => None,
            Self::VerdictRequest(r) => Some(&r.guid),
            Self::VerdictRequestForUrl(r) => Some(&r.guid),
            Self::VerdictRequestForStream(r) => Some(&r.guid),
        }
    }
}

/// Handshake result. Absent or false `success` means the token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Human-readable reason some gateways attach to a rejection.
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind")]
pub enum ServerMessage {
    VerdictResponse(VerdictResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerdictResponse {
    pub guid: String,
    #[serde(default)]
    pub sha256: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub detection: Option<String>,
    /// Presigned upload endpoint, only present on `Unknown`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub upload_token: Option<String>,
}

impl VerdictResponse {
    /// Upload url and token, when the service asked for the sample.
    #[must_use]
    pub fn upload_target(&self) -> Option<(&str, &str)> {
        match (&self.url, &self.upload_token) {
            (Some(url), Some(token)) => Some((url, token)),
            _ => None,
        }
    }
}

impl From<VerdictResponse> for ScanVerdict {
    fn from(resp: VerdictResponse) -> Self {
        Self {
            sha256: resp.sha256,
            verdict: resp.verdict,
            detection: resp.detection,
        }
    }
}

// ─── Encoding / decoding ────────────────────────────────────────────────────

/// Serialize a client message into the text of a frame.
pub fn encode(msg: &ClientMessage) -> Result<String, VerdictError> {
    serde_json::to_string(msg).map_err(VerdictError::Encode)
}

/// Decode the handshake result.
pub fn decode_auth(text: &str) -> Result<AuthResponse, VerdictError> {
    serde_json::from_str(text).map_err(VerdictError::Decode)
}

/// Decode a post-handshake server message. Unknown kinds are rejected.
pub fn decode(text: &str) -> Result<ServerMessage, VerdictError> {
    serde_json::from_str(text).map_err(VerdictError::Decode)
}
