//! OAuth discovery documents (RFC 8414 and RFC 9728).
//!
//! The gate serves two static-but-computed metadata documents so OAuth
//! clients can discover the authorization server and the scopes this
//! resource supports: Authorization Server Metadata at
//! `/.well-known/oauth-authorization-server` and Protected Resource
//! Metadata at `/.well-known/oauth-protected-resource`.
//!
//! Both are pure functions of static configuration. Every URI a document
//! references is checked against the same domain allow-list that guards
//! JWKS fetches before it is embedded in a response, so a misconfigured
//! deployment cannot advertise (or chain clients into) untrusted hosts.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::allowlist::DomainAllowList;
use crate::error::AuthError;

/// Well-known path for RFC 8414 Authorization Server Metadata.
pub const AUTHORIZATION_SERVER_METADATA_PATH: &str = "/.well-known/oauth-authorization-server";
/// Well-known path for RFC 9728 Protected Resource Metadata.
pub const PROTECTED_RESOURCE_METADATA_PATH: &str = "/.well-known/oauth-protected-resource";

fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}

fn default_bearer_methods() -> Vec<String> {
    vec!["header".to_string()]
}

/// Authorization Server Metadata per RFC 8414 Section 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// The authorization server's issuer identifier URL.
    pub issuer: String,

    /// URL of the authorization endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    /// URL of the token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    /// URL of the server's JWK Set document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// OAuth scopes the server supports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,

    /// Supported `response_type` values. Defaults to `["code"]`.
    #[serde(default = "default_response_types")]
    pub response_types_supported: Vec<String>,
}

impl AuthorizationServerMetadata {
    /// Create metadata for the given issuer identifier.
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            authorization_endpoint: None,
            token_endpoint: None,
            jwks_uri: None,
            scopes_supported: Vec::new(),
            response_types_supported: default_response_types(),
        }
    }

    /// Set the authorization endpoint URL.
    pub fn authorization_endpoint(mut self, url: impl Into<String>) -> Self {
        self.authorization_endpoint = Some(url.into());
        self
    }

    /// Set the token endpoint URL.
    pub fn token_endpoint(mut self, url: impl Into<String>) -> Self {
        self.token_endpoint = Some(url.into());
        self
    }

    /// Set the JWK Set document URL.
    pub fn jwks_uri(mut self, url: impl Into<String>) -> Self {
        self.jwks_uri = Some(url.into());
        self
    }

    /// Add a supported scope.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes_supported.push(scope.into());
        self
    }

    /// Every URI this document would advertise.
    fn referenced_uris(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.issuer.as_str())
            .chain(self.authorization_endpoint.as_deref())
            .chain(self.token_endpoint.as_deref())
            .chain(self.jwks_uri.as_deref())
    }

    /// Validate every referenced URI against the allow-list, returning the
    /// document ready to serve.
    pub fn checked(&self, allowlist: &DomainAllowList) -> Result<Self, AuthError> {
        for uri in self.referenced_uris() {
            allowlist.check(uri)?;
        }
        Ok(self.clone())
    }

    /// The well-known path this document is served at.
    pub fn well_known_path() -> &'static str {
        AUTHORIZATION_SERVER_METADATA_PATH
    }
}

/// Protected Resource Metadata per RFC 9728 Section 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// The resource server's identifier URL.
    pub resource: String,

    /// Authorization server issuer URLs that can issue tokens for this
    /// resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorization_servers: Vec<String>,

    /// URL of the resource's JWK Set document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// OAuth scopes this resource supports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,

    /// Methods supported for sending bearer tokens. Defaults to
    /// `["header"]` per RFC 6750.
    #[serde(default = "default_bearer_methods")]
    pub bearer_methods_supported: Vec<String>,

    /// JWS algorithms supported for signing resource responses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_signing_alg_values_supported: Vec<String>,

    /// Human-readable name of the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,

    /// URL of documentation for this resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_documentation: Option<String>,

    /// URL of the resource's policy document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy_uri: Option<String>,

    /// URL of the resource's terms of service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_tos_uri: Option<String>,
}

impl ProtectedResourceMetadata {
    /// Create metadata for the given resource identifier URL.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            authorization_servers: Vec::new(),
            jwks_uri: None,
            scopes_supported: Vec::new(),
            bearer_methods_supported: default_bearer_methods(),
            resource_signing_alg_values_supported: Vec::new(),
            resource_name: None,
            resource_documentation: None,
            resource_policy_uri: None,
            resource_tos_uri: None,
        }
    }

    /// Add an authorization server issuer URL.
    pub fn authorization_server(mut self, issuer_url: impl Into<String>) -> Self {
        self.authorization_servers.push(issuer_url.into());
        self
    }

    /// Set the JWK Set document URL.
    pub fn jwks_uri(mut self, url: impl Into<String>) -> Self {
        self.jwks_uri = Some(url.into());
        self
    }

    /// Add a supported scope.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes_supported.push(scope.into());
        self
    }

    /// Set the human-readable resource name.
    pub fn resource_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = Some(name.into());
        self
    }

    /// Set the resource documentation URL.
    pub fn resource_documentation(mut self, url: impl Into<String>) -> Self {
        self.resource_documentation = Some(url.into());
        self
    }

    /// The URL of this document relative to the resource identifier.
    pub fn resource_metadata_url(&self) -> String {
        format!(
            "{}{}",
            self.resource.trim_end_matches('/'),
            PROTECTED_RESOURCE_METADATA_PATH
        )
    }

    /// Every URI this document would advertise.
    fn referenced_uris(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.resource.as_str())
            .chain(self.authorization_servers.iter().map(String::as_str))
            .chain(self.jwks_uri.as_deref())
            .chain(self.resource_documentation.as_deref())
            .chain(self.resource_policy_uri.as_deref())
            .chain(self.resource_tos_uri.as_deref())
    }

    /// Validate every referenced URI against the allow-list, returning the
    /// document ready to serve.
    pub fn checked(&self, allowlist: &DomainAllowList) -> Result<Self, AuthError> {
        for uri in self.referenced_uris() {
            allowlist.check(uri)?;
        }
        Ok(self.clone())
    }

    /// The well-known path this document is served at.
    pub fn well_known_path() -> &'static str {
        PROTECTED_RESOURCE_METADATA_PATH
    }
}

/// Serves the discovery documents at their well-known paths.
#[derive(Debug, Clone)]
pub struct DiscoveryResponder {
    authorization_server: Option<AuthorizationServerMetadata>,
    protected_resource: Option<ProtectedResourceMetadata>,
    allowlist: DomainAllowList,
}

impl DiscoveryResponder {
    /// Create a responder whose documents are checked against `allowlist`.
    pub fn new(allowlist: DomainAllowList) -> Self {
        Self {
            authorization_server: None,
            protected_resource: None,
            allowlist,
        }
    }

    /// Serve this Authorization Server Metadata document.
    pub fn authorization_server(mut self, doc: AuthorizationServerMetadata) -> Self {
        self.authorization_server = Some(doc);
        self
    }

    /// Serve this Protected Resource Metadata document.
    pub fn protected_resource(mut self, doc: ProtectedResourceMetadata) -> Self {
        self.protected_resource = Some(doc);
        self
    }

    /// The RFC 8414 document, allow-list checked. `None` when not
    /// configured.
    pub fn authorization_server_metadata(
        &self,
    ) -> Option<Result<AuthorizationServerMetadata, AuthError>> {
        self.authorization_server
            .as_ref()
            .map(|doc| doc.checked(&self.allowlist))
    }

    /// The RFC 9728 document, allow-list checked. `None` when not
    /// configured.
    pub fn protected_resource_metadata(
        &self,
    ) -> Option<Result<ProtectedResourceMetadata, AuthError>> {
        self.protected_resource
            .as_ref()
            .map(|doc| doc.checked(&self.allowlist))
    }

    /// An axum router serving both documents at their well-known paths.
    pub fn routes(self) -> Router {
        let responder = Arc::new(self);
        let auth_server = responder.clone();
        let protected = responder;

        Router::new()
            .route(
                AUTHORIZATION_SERVER_METADATA_PATH,
                get(move || {
                    let responder = auth_server.clone();
                    async move { metadata_response(responder.authorization_server_metadata()) }
                }),
            )
            .route(
                PROTECTED_RESOURCE_METADATA_PATH,
                get(move || {
                    let responder = protected.clone();
                    async move { metadata_response(responder.protected_resource_metadata()) }
                }),
            )
    }
}

fn metadata_response<T: Serialize>(doc: Option<Result<T, AuthError>>) -> Response {
    match doc {
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not configured"})),
        )
            .into_response(),
        Some(Err(error)) => {
            warn!(error = %error, "refusing to serve discovery document");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Some(Ok(doc)) => Json(doc).into_response(),
    }
}
