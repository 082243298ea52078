//! Token verification for both trust strategies.
//!
//! The two ways a deployment can trust an inbound identity are a closed
//! set, dispatched exactly once at the top of [`TokenVerifier::verify`]:
//!
//! - **Local**: the gate itself checks the bearer token cryptographically —
//!   signature against the issuer's JWKS, temporal claims with a clock-skew
//!   leeway, exact issuer and audience.
//! - **External**: an upstream proxy already validated the token and
//!   forwards the claims in a trusted header; the gate parses them without
//!   re-verifying.
//!
//! Everything after claim extraction (allow-conditions, filtering, context
//! installation) is strategy-agnostic, as is the outcome type.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, header};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde_json::{Map, Value};
use tracing::warn;

use crate::claims::ClaimSet;
use crate::condition::ConditionSet;
use crate::error::AuthError;
use crate::jwks::{HttpKeyFetcher, JwksKeySource, KeyFetcher};

/// Default clock-skew tolerance for temporal claims.
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(60);

/// The outcome of verifying one request. Never a bare boolean: a success
/// carries the verified claims, a failure carries the structured reason.
#[derive(Debug, Clone)]
pub enum VerificationOutcome {
    /// The request presented a valid identity.
    Verified(ClaimSet),
    /// The request was rejected; the reason stays server-side.
    Rejected(AuthError),
}

impl VerificationOutcome {
    /// Whether the request was verified.
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationOutcome::Verified(_))
    }
}

/// How inbound credentials are trusted.
pub enum TrustStrategy<F = HttpKeyFetcher> {
    /// Verify bearer tokens locally against the issuer's JWKS.
    Local(LocalValidation<F>),
    /// Trust claims forwarded by an upstream proxy in the named header.
    External {
        /// Header carrying the pre-validated token or claims object.
        forwarded_header: String,
    },
}

/// Parameters for local cryptographic verification.
pub struct LocalValidation<F = HttpKeyFetcher> {
    keys: Arc<JwksKeySource<F>>,
    issuer: String,
    audience: String,
    algorithms: Vec<Algorithm>,
    leeway: Duration,
}

/// Verifies one request's credential into a [`VerificationOutcome`].
pub struct TokenVerifier<F = HttpKeyFetcher> {
    strategy: TrustStrategy<F>,
    conditions: ConditionSet,
}

impl TokenVerifier<HttpKeyFetcher> {
    /// Build a verifier that trusts the named forwarded-claims header.
    pub fn external(forwarded_header: impl Into<String>) -> Self {
        Self {
            strategy: TrustStrategy::External {
                forwarded_header: forwarded_header.into(),
            },
            conditions: ConditionSet::default(),
        }
    }
}

impl<F: KeyFetcher> TokenVerifier<F> {
    /// Build a verifier that validates tokens against `keys`, requiring
    /// the exact `issuer` and `audience`. Allowed algorithms default to
    /// RS256.
    pub fn local(
        keys: Arc<JwksKeySource<F>>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            strategy: TrustStrategy::Local(LocalValidation {
                keys,
                issuer: issuer.into(),
                audience: audience.into(),
                algorithms: vec![Algorithm::RS256],
                leeway: DEFAULT_LEEWAY,
            }),
            conditions: ConditionSet::default(),
        }
    }

    /// Set the allow-conditions run against every verified claim set.
    pub fn conditions(mut self, conditions: ConditionSet) -> Self {
        self.conditions = conditions;
        self
    }

    /// Restrict the accepted signature algorithms (local strategy).
    /// `none` can never be accepted; it is not an expressible algorithm.
    pub fn algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        if let TrustStrategy::Local(local) = &mut self.strategy
            && !algorithms.is_empty()
        {
            local.algorithms = algorithms;
        }
        self
    }

    /// Clock-skew tolerance for `exp`/`nbf` (local strategy).
    pub fn leeway(mut self, leeway: Duration) -> Self {
        if let TrustStrategy::Local(local) = &mut self.strategy {
            local.leeway = leeway;
        }
        self
    }

    /// Verify the request's credential.
    ///
    /// Both strategies share the policy-evaluation step and the outcome
    /// type, so downstream code never needs to know which one ran. Every
    /// rejection is logged here with its precise reason; callers surface
    /// only the uniform response.
    pub async fn verify(&self, headers: &HeaderMap) -> VerificationOutcome {
        let claims = match &self.strategy {
            TrustStrategy::External { forwarded_header } => {
                forwarded_claims(headers, forwarded_header)
            }
            TrustStrategy::Local(local) => local.verify_bearer(headers).await,
        };

        let claims = match claims {
            Ok(claims) => claims,
            Err(error) => {
                warn!(error = %error, "token verification failed");
                return VerificationOutcome::Rejected(error);
            }
        };

        if !self.conditions.allows(&claims) {
            if let Some(condition) = self.conditions.first_failing(&claims) {
                warn!(condition = %condition, "request denied by allow-conditions");
            } else {
                warn!("request denied by allow-conditions");
            }
            return VerificationOutcome::Rejected(AuthError::PolicyDenied);
        }

        VerificationOutcome::Verified(claims)
    }
}

impl<F: KeyFetcher> LocalValidation<F> {
    async fn verify_bearer(&self, headers: &HeaderMap) -> Result<ClaimSet, AuthError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer_token)
            .ok_or(AuthError::MissingCredential)?;

        let token_header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("unparseable token header: {e}")))?;

        if !self.algorithms.contains(&token_header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "algorithm {:?} not allowed",
                token_header.alg
            )));
        }

        let kid = token_header
            .kid
            .as_deref()
            .ok_or_else(|| AuthError::InvalidToken("token header has no kid".to_string()))?;

        let key = self.keys.get_key(kid).await?;

        let mut validation = Validation::new(self.algorithms[0]);
        validation.algorithms = self.algorithms.clone();
        validation.leeway = self.leeway.as_secs();
        validation.validate_nbf = true;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);

        let data = jsonwebtoken::decode::<Map<String, Value>>(token, &key, &validation)
            .map_err(|e| {
                let detail = match e.kind() {
                    ErrorKind::ExpiredSignature => "token expired".to_string(),
                    ErrorKind::ImmatureSignature => "token not yet valid".to_string(),
                    ErrorKind::InvalidAudience => "audience mismatch".to_string(),
                    ErrorKind::InvalidIssuer => "issuer mismatch".to_string(),
                    ErrorKind::InvalidSignature => "signature mismatch".to_string(),
                    _ => e.to_string(),
                };
                AuthError::InvalidToken(detail)
            })?;

        Ok(ClaimSet::new(data.claims))
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
/// Anything else (other schemes, empty token) is treated as no credential.
fn extract_bearer_token(value: &str) -> Option<&str> {
    value
        .trim()
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Parse a forwarded-claims header into a ClaimSet.
///
/// Upstream proxies forward either the validated compact JWT itself (we
/// decode the payload segment without re-verifying the signature — that is
/// the point of the external strategy) or a bare JSON object of claims.
fn forwarded_claims(headers: &HeaderMap, name: &str) -> Result<ClaimSet, AuthError> {
    let raw = headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(AuthError::MissingCredential)?;

    let map = if raw.starts_with('{') {
        serde_json::from_str::<Map<String, Value>>(raw)
            .map_err(|e| AuthError::InvalidToken(format!("forwarded claims object: {e}")))?
    } else {
        let mut segments = raw.split('.');
        let payload = match (segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_)) if segments.next().is_none() => payload,
            _ => {
                return Err(AuthError::InvalidToken(
                    "forwarded header is neither a claims object nor a compact token".to_string(),
                ));
            }
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| AuthError::InvalidToken(format!("forwarded token payload: {e}")))?;
        serde_json::from_slice::<Map<String, Value>>(&bytes)
            .map_err(|e| AuthError::InvalidToken(format!("forwarded token payload: {e}")))?
    };

    Ok(ClaimSet::new(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Combine;
    use jsonwebtoken::jwk::JwkSet;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"test-secret-for-hs256";
    const ISSUER: &str = "https://auth.example.com/";
    const AUDIENCE: &str = "https://mcp.example.com";

    #[derive(Clone)]
    struct StaticKeys(JwkSet);

    impl KeyFetcher for StaticKeys {
        async fn fetch_keys(&self, _uri: &str) -> Result<JwkSet, crate::jwks::FetchError> {
            Ok(self.0.clone())
        }
    }

    fn test_jwks() -> JwkSet {
        let k = URL_SAFE_NO_PAD.encode(SECRET);
        serde_json::from_value(json!({"keys": [{"kty": "oct", "kid": "k1", "k": k}]})).unwrap()
    }

    fn test_verifier() -> TokenVerifier<StaticKeys> {
        let keys = Arc::new(
            JwksKeySource::builder("https://auth.example.com/jwks")
                .fetcher(StaticKeys(test_jwks()))
                .build(),
        );
        TokenVerifier::local(keys, ISSUER, AUDIENCE).algorithms(vec![Algorithm::HS256])
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn make_token(extra: serde_json::Value) -> String {
        let mut claims = json!({
            "iss": ISSUER,
            "aud": AUDIENCE,
            "exp": now_secs() + 3600,
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut claims, extra) {
            base.extend(extra);
        }
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("k1".to_string());
        jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        headers
    }

    fn rejected_with(outcome: VerificationOutcome) -> AuthError {
        match outcome {
            VerificationOutcome::Rejected(e) => e,
            VerificationOutcome::Verified(c) => panic!("expected rejection, got {c:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_valid_token_verifies() {
        let outcome = test_verifier()
            .verify(&bearer(&make_token(json!({"sub": "u1"}))))
            .await;
        let VerificationOutcome::Verified(claims) = outcome else {
            panic!("expected verified");
        };
        assert_eq!(claims.subject(), Some("u1"));
    }

    #[tokio::test]
    async fn test_local_missing_or_malformed_header_is_missing_credential() {
        let verifier = test_verifier();

        let cases = [
            None,
            Some(""),
            Some("Bearer"),
            Some("Bearer "),
            Some("bearer token"),
            Some("Basic dXNlcjpwYXNz"),
            Some("token-without-scheme"),
        ];
        for value in cases {
            let mut headers = HeaderMap::new();
            if let Some(v) = value {
                headers.insert(header::AUTHORIZATION, v.parse().unwrap());
            }
            let err = rejected_with(verifier.verify(&headers).await);
            assert!(
                matches!(err, AuthError::MissingCredential),
                "expected MissingCredential for {value:?}, got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_local_garbage_token_is_invalid() {
        let err = rejected_with(test_verifier().verify(&bearer("not.a.jwt")).await);
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_alg_none_rejected_regardless_of_claims() {
        // hand-assembled unsigned token; no library will mint one
        let head = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","kid":"k1","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({
                "iss": ISSUER,
                "aud": AUDIENCE,
                "exp": now_secs() + 3600,
                "sub": "attacker"
            }))
            .unwrap(),
        );
        let token = format!("{head}.{body}.");

        let err = rejected_with(test_verifier().verify(&bearer(&token)).await);
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_unexpected_algorithm_rejected() {
        // HS384 signature, verifier only allows HS256
        let mut header = Header::new(Algorithm::HS384);
        header.kid = Some("k1".to_string());
        let token = jsonwebtoken::encode(
            &header,
            &json!({"iss": ISSUER, "aud": AUDIENCE, "exp": now_secs() + 3600}),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let err = rejected_with(test_verifier().verify(&bearer(&token)).await);
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_missing_kid_rejected() {
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &json!({"iss": ISSUER, "aud": AUDIENCE, "exp": now_secs() + 3600}),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let err = rejected_with(test_verifier().verify(&bearer(&token)).await);
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let token = make_token(json!({"exp": 1}));
        let err = rejected_with(test_verifier().verify(&bearer(&token)).await);
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_wrong_audience_rejected() {
        let token = make_token(json!({"aud": "https://other.example.com"}));
        let err = rejected_with(test_verifier().verify(&bearer(&token)).await);
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_wrong_issuer_rejected() {
        let token = make_token(json!({"iss": "https://rogue.example.com/"}));
        let err = rejected_with(test_verifier().verify(&bearer(&token)).await);
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_wrong_signature_rejected() {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("k1".to_string());
        let token = jsonwebtoken::encode(
            &header,
            &json!({"iss": ISSUER, "aud": AUDIENCE, "exp": now_secs() + 3600}),
            &EncodingKey::from_secret(b"some-other-secret"),
        )
        .unwrap();

        let err = rejected_with(test_verifier().verify(&bearer(&token)).await);
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_conditions_gate_verified_claims() {
        let conditions = ConditionSet::parse(
            &[r#"payload.email.endswith("@corp.com")"#],
            Combine::All,
        )
        .unwrap();

        let verifier = test_verifier().conditions(conditions.clone());
        let token = make_token(json!({"email": "dev@corp.com"}));
        assert!(verifier.verify(&bearer(&token)).await.is_verified());

        let verifier = test_verifier().conditions(conditions);
        let token = make_token(json!({"email": "dev@other.com"}));
        let err = rejected_with(verifier.verify(&bearer(&token)).await);
        assert!(matches!(err, AuthError::PolicyDenied));
    }

    #[tokio::test]
    async fn test_external_missing_header_is_missing_credential() {
        let verifier = TokenVerifier::external("X-Validated-Jwt");
        let err = rejected_with(verifier.verify(&HeaderMap::new()).await);
        assert!(matches!(err, AuthError::MissingCredential));
    }

    #[tokio::test]
    async fn test_external_claims_object() {
        let verifier = TokenVerifier::external("X-Validated-Jwt");
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Validated-Jwt",
            r#"{"sub":"alice","role":"admin"}"#.parse().unwrap(),
        );

        let VerificationOutcome::Verified(claims) = verifier.verify(&headers).await else {
            panic!("expected verified");
        };
        assert_eq!(claims.subject(), Some("alice"));
        assert_eq!(claims.get("role"), Some(&json!("admin")));
    }

    #[tokio::test]
    async fn test_external_compact_token_payload() {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("whatever".to_string());
        // signed by the upstream proxy's issuer; we only read the payload
        let token = jsonwebtoken::encode(
            &header,
            &json!({"sub": "bob", "roles": ["ops"]}),
            &EncodingKey::from_secret(b"unrelated"),
        )
        .unwrap();

        let verifier = TokenVerifier::external("X-Validated-Jwt");
        let mut headers = HeaderMap::new();
        headers.insert("X-Validated-Jwt", token.parse().unwrap());

        let VerificationOutcome::Verified(claims) = verifier.verify(&headers).await else {
            panic!("expected verified");
        };
        assert_eq!(claims.subject(), Some("bob"));
        assert_eq!(claims.get("roles"), Some(&json!(["ops"])));
    }

    #[tokio::test]
    async fn test_external_garbage_header_is_invalid() {
        let verifier = TokenVerifier::external("X-Validated-Jwt");
        let mut headers = HeaderMap::new();
        headers.insert("X-Validated-Jwt", "neither-json-nor-jwt".parse().unwrap());

        let err = rejected_with(verifier.verify(&headers).await);
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_external_conditions_apply() {
        let conditions =
            ConditionSet::parse(&[r#""admin" in payload.roles"#], Combine::All).unwrap();
        let verifier = TokenVerifier::external("X-Validated-Jwt").conditions(conditions);

        let mut headers = HeaderMap::new();
        headers.insert("X-Validated-Jwt", r#"{"roles":["dev"]}"#.parse().unwrap());
        let err = rejected_with(verifier.verify(&headers).await);
        assert!(matches!(err, AuthError::PolicyDenied));
    }

    #[test]
    fn test_extract_bearer_token_shapes() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("  Bearer  abc  "), Some("abc"));
        assert_eq!(extract_bearer_token("bearer abc"), None);
        assert_eq!(extract_bearer_token("Bearer "), None);
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("abc"), None);
    }
}
