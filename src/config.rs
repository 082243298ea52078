//! Configuration data model and startup validation.
//!
//! The surrounding application owns reading the configuration file; this
//! module owns its shape and its validation. Everything is checked before
//! traffic is served — a malformed condition expression, an unknown
//! algorithm, or a URI outside the domain allow-list is fatal at startup,
//! never a per-request surprise.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Deserialize;

use crate::allowlist::DomainAllowList;
use crate::claims::ExposurePolicy;
use crate::condition::{Combine, Condition, ConditionParseError, ConditionSet};
use crate::error::AuthError;
use crate::jwks::JwksKeySource;
use crate::metadata::{
    AuthorizationServerMetadata, DiscoveryResponder, ProtectedResourceMetadata,
};
use crate::middleware::AuthGate;
use crate::verifier::TokenVerifier;

/// Default name of the forwarded-claims header.
pub const DEFAULT_FORWARDED_HEADER: &str = "X-Validated-Jwt";

fn default_forwarded_header() -> String {
    DEFAULT_FORWARDED_HEADER.to_string()
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_leeway_secs() -> u64 {
    60
}

fn default_algorithms() -> Vec<String> {
    vec!["RS256".to_string()]
}

/// Invalid configuration. Fatal before serving traffic.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field is missing, empty, or inconsistent.
    #[error("configuration: {0}")]
    Invalid(String),

    /// An allow-condition expression failed to parse.
    #[error("allow-condition {index}: {source}")]
    Condition {
        /// Zero-based position in the configured list.
        index: usize,
        /// The parse failure.
        #[source]
        source: ConditionParseError,
    },

    /// A configured URI falls outside the domain allow-list.
    #[error(transparent)]
    Blocked(#[from] AuthError),

    /// The TOML document could not be parsed.
    #[error("configuration parse: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Which trust strategy verifies inbound credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Verify bearer tokens locally against the issuer's JWKS.
    Local,
    /// Trust the forwarded-claims header set by an upstream proxy.
    #[default]
    External,
}

/// Top-level gate configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    /// Credential verification settings.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Which claims cross into tool logic: `"all"` or a list of names.
    #[serde(default)]
    pub exposed_claims: ExposurePolicy,

    /// Domain allow-list for outbound fetches and advertised URIs.
    /// Empty means unrestricted.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// OAuth discovery documents.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Verification settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Trust strategy. Defaults to `external`.
    #[serde(default)]
    pub strategy: Strategy,

    /// Header carrying pre-validated claims under the external strategy.
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,

    /// Settings for the local strategy.
    #[serde(default)]
    pub local: Option<LocalConfig>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            forwarded_header: default_forwarded_header(),
            local: None,
        }
    }
}

/// Settings for local cryptographic verification.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    /// The issuer's JWKS endpoint.
    pub jwks_uri: String,

    /// Expected `iss` claim, compared exactly.
    pub issuer: String,

    /// Expected `aud` claim, compared exactly.
    pub audience: String,

    /// Key cache TTL in seconds. Defaults to 300.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Clock-skew tolerance in seconds for `exp`/`nbf`. Defaults to 60.
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,

    /// Accepted signature algorithms. Defaults to `["RS256"]`.
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<String>,

    /// Ordered allow-conditions over the verified claims.
    #[serde(default)]
    pub allow_conditions: Vec<AllowCondition>,

    /// How the conditions combine. Defaults to `all`.
    #[serde(default)]
    pub combine: Combine,
}

/// One configured allow-condition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowCondition {
    /// The expression text; see the condition module for the dialect.
    pub expression: String,
}

/// Discovery document configuration. The metadata types double as the
/// configuration schema; both documents are optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// RFC 8414 Authorization Server Metadata.
    #[serde(default)]
    pub authorization_server: Option<AuthorizationServerMetadata>,

    /// RFC 9728 Protected Resource Metadata.
    #[serde(default)]
    pub protected_resource: Option<ProtectedResourceMetadata>,
}

impl LocalConfig {
    /// Parse the configured algorithm names.
    pub fn parsed_algorithms(&self) -> Result<Vec<Algorithm>, ConfigError> {
        if self.algorithms.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one signature algorithm is required".to_string(),
            ));
        }
        self.algorithms
            .iter()
            .map(|name| {
                Algorithm::from_str(name).map_err(|_| {
                    ConfigError::Invalid(format!("unknown signature algorithm {name:?}"))
                })
            })
            .collect()
    }

    /// Parse the configured conditions, failing fast on the first
    /// malformed expression.
    pub fn condition_set(&self) -> Result<ConditionSet, ConfigError> {
        let mut conditions = Vec::with_capacity(self.allow_conditions.len());
        for (index, condition) in self.allow_conditions.iter().enumerate() {
            let parsed = Condition::parse(&condition.expression)
                .map_err(|source| ConfigError::Condition { index, source })?;
            conditions.push(parsed);
        }
        Ok(ConditionSet::new(conditions, self.combine))
    }

    fn validate(&self, allowlist: &DomainAllowList) -> Result<(), ConfigError> {
        for (field, value) in [
            ("jwks_uri", &self.jwks_uri),
            ("issuer", &self.issuer),
            ("audience", &self.audience),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "validation.local.{field} must not be empty"
                )));
            }
        }
        allowlist.check(&self.jwks_uri)?;
        self.parsed_algorithms()?;
        self.condition_set()?;
        Ok(())
    }
}

impl GateConfig {
    /// Parse a TOML document the external loader handed over.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// The configured domain allow-list.
    pub fn allowlist(&self) -> DomainAllowList {
        DomainAllowList::new(self.allowed_domains.iter().cloned())
    }

    /// Validate everything that must hold before serving traffic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let allowlist = self.allowlist();

        match self.validation.strategy {
            Strategy::External => {
                if self.validation.forwarded_header.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "external strategy requires a forwarded header name".to_string(),
                    ));
                }
            }
            Strategy::Local => {
                let Some(local) = self.validation.local.as_ref() else {
                    return Err(ConfigError::Invalid(
                        "local strategy requires a [validation.local] block".to_string(),
                    ));
                };
                local.validate(&allowlist)?;
            }
        }

        if let Some(doc) = &self.discovery.authorization_server {
            doc.checked(&allowlist)?;
        }
        if let Some(doc) = &self.discovery.protected_resource {
            doc.checked(&allowlist)?;
        }

        Ok(())
    }

    /// Build the runtime gate from this configuration.
    pub fn build_gate(&self) -> Result<AuthGate, ConfigError> {
        self.validate()?;
        let allowlist = self.allowlist();

        let verifier = match self.validation.strategy {
            Strategy::External => {
                TokenVerifier::external(self.validation.forwarded_header.clone())
            }
            Strategy::Local => {
                let Some(local) = self.validation.local.as_ref() else {
                    return Err(ConfigError::Invalid(
                        "local strategy requires a [validation.local] block".to_string(),
                    ));
                };
                let keys = Arc::new(
                    JwksKeySource::builder(local.jwks_uri.clone())
                        .ttl(Duration::from_secs(local.cache_ttl_secs))
                        .allowlist(allowlist.clone())
                        .build(),
                );
                TokenVerifier::local(keys, local.issuer.clone(), local.audience.clone())
                    .algorithms(local.parsed_algorithms()?)
                    .leeway(Duration::from_secs(local.leeway_secs))
                    .conditions(local.condition_set()?)
            }
        };

        let mut gate = AuthGate::new(verifier).exposure_policy(self.exposed_claims.clone());
        if let Some(doc) = &self.discovery.protected_resource {
            gate = gate.resource(doc.resource.clone());
        }
        Ok(gate)
    }

    /// Build the discovery responder, when any document is configured.
    pub fn build_discovery(&self) -> Result<Option<DiscoveryResponder>, ConfigError> {
        if self.discovery.authorization_server.is_none()
            && self.discovery.protected_resource.is_none()
        {
            return Ok(None);
        }

        let allowlist = self.allowlist();
        let mut responder = DiscoveryResponder::new(allowlist.clone());
        if let Some(doc) = &self.discovery.authorization_server {
            responder = responder.authorization_server(doc.checked(&allowlist)?);
        }
        if let Some(doc) = &self.discovery.protected_resource {
            responder = responder.protected_resource(doc.checked(&allowlist)?);
        }
        Ok(Some(responder))
    }
}
