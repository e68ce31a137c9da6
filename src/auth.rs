//! Static API key check in front of every route.
//!
//! Authorization policy lives outside this server. When an operator key is
//! configured, requests must present it as `X-API-Key` or as an
//! `Authorization: Bearer` token; otherwise the server runs anonymously.

use sha2::{Digest, Sha256};

/// Header carrying the operator key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Hex SHA-256 digest of an API key. Raw keys are never kept in memory past
/// construction.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeyAuth {
    expected: Option<String>,
}

impl ApiKeyAuth {
    pub fn new(api_key: Option<&str>) -> Self {
        Self {
            expected: api_key.filter(|k| !k.is_empty()).map(hash_api_key),
        }
    }

    /// No key configured: every request is accepted.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }

    /// Check the credentials presented on a request.
    ///
    /// A bearer token is tried first, then the API key header.
    pub fn verify(&self, authorization: Option<&str>, api_key: Option<&str>) -> bool {
        let Some(expected) = &self.expected else {
            return true;
        };

        let presented = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .or(api_key);

        presented.is_some_and(|key| &hash_api_key(key.trim()) == expected)
    }
}
