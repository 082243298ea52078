//! Error taxonomy for the gate.
//!
//! Every rejection reason is its own variant so server-side diagnostics can
//! record exactly what failed, while the external mapping stays uniform:
//! everything is an HTTP 401 whose `WWW-Authenticate` challenge (RFC 6750
//! Section 3, with the `resource_metadata` parameter from RFC 9728) reveals
//! nothing beyond "no credential" vs "credential rejected".

use crate::condition::ConditionParseError;

/// Why a request failed authentication, or why the gate could not be set up.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// No bearer token or forwarded-claims header was present.
    #[error("missing credential")]
    MissingCredential,

    /// Signature, algorithm, issuer, audience, or temporal check failed.
    /// The detail is for logs only and is never sent to the caller.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The key source was unreachable or unparseable and no usable cached
    /// key exists.
    #[error("key lookup failed: {0}")]
    KeyLookup(String),

    /// One or more configured allow-conditions did not hold.
    #[error("denied by policy")]
    PolicyDenied,

    /// A condition expression failed to parse. Surfaces during
    /// configuration validation and aborts startup; never raised while
    /// serving traffic.
    #[error(transparent)]
    Eval(#[from] ConditionParseError),

    /// A referenced URI resolves outside the configured domain allow-list.
    #[error("host not in domain allow-list: {0}")]
    SsrfBlocked(String),
}

impl AuthError {
    /// HTTP status for the uniform external response.
    ///
    /// Authentication failures are indistinguishable to the caller, so
    /// every variant maps to 401 rather than leaking which check failed
    /// through the status code.
    pub fn status_code(&self) -> u16 {
        401
    }

    /// Build the `WWW-Authenticate` header value per RFC 6750 Section 3.
    ///
    /// When `resource_metadata_url` is provided, the `resource_metadata`
    /// parameter (RFC 9728) points clients at the discovery document. A
    /// request that carried no credential gets a bare challenge; anything
    /// else gets `error="invalid_token"` with no description.
    pub fn www_authenticate(&self, resource_metadata_url: Option<&str>) -> String {
        let mut parts = Vec::new();
        if let Some(url) = resource_metadata_url {
            parts.push(format!("resource_metadata=\"{url}\""));
        }

        match self {
            AuthError::MissingCredential => {
                // RFC 6750 Section 3: no error code when the request lacked
                // any authentication information.
                if parts.is_empty() {
                    return "Bearer".to_string();
                }
            }
            _ => {
                parts.push("error=\"invalid_token\"".to_string());
            }
        }

        format!("Bearer {}", parts.join(", "))
    }
}
