//! # mcp-gate
//!
//! Bearer-token gateway for MCP (tool-invocation) servers, built on the
//! [Tower](https://docs.rs/tower) service abstraction.
//!
//! The gate sits between the HTTP transport and tool logic. Per request it
//! verifies the caller's identity, reduces the verified claims to what the
//! deployment chose to expose, and makes the result readable anywhere in
//! the request's call chain — then gets out of the way.
//!
//! ## Trust strategies
//!
//! - **Local**: the gate validates the `Authorization: Bearer` token
//!   itself — signature against the issuer's JWKS endpoint (cached, with
//!   single-flight refresh and last-known-good fallback), temporal claims
//!   with clock-skew leeway, exact issuer and audience.
//! - **External**: an upstream proxy already validated the token and
//!   forwards the claims in a trusted header (`X-Validated-Jwt` by
//!   default); the gate parses them without re-verifying.
//!
//! Either way, configured allow-conditions (small boolean expressions over
//! the claim tree, parsed at startup) must hold before a request is let
//! through, and the [`ExposurePolicy`] decides which claims tool handlers
//! get to see — authorization-critical claims are always included.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mcp_gate::{AuthGate, AuthGateLayer, ExposurePolicy, JwksKeySource, TokenVerifier};
//!
//! async fn whoami() -> String {
//!     match mcp_gate::current_claims() {
//!         Some(claims) => format!("hello {}", claims.subject().unwrap_or("anonymous")),
//!         None => "no verified identity".to_string(),
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let keys = Arc::new(
//!         JwksKeySource::builder("https://auth.example.com/.well-known/jwks.json").build(),
//!     );
//!     let verifier = TokenVerifier::local(
//!         keys,
//!         "https://auth.example.com/",
//!         "https://mcp.example.com",
//!     );
//!     let gate = AuthGate::new(verifier)
//!         .exposure_policy(ExposurePolicy::named(["sub", "email"]))
//!         .resource("https://mcp.example.com");
//!
//!     let app = axum::Router::new()
//!         .route("/mcp", axum::routing::post(whoami))
//!         .layer(AuthGateLayer::new(gate));
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! Deployments that drive everything from a file use [`GateConfig`]: parse
//! with [`GateConfig::from_toml_str`], then [`GateConfig::build_gate`] and
//! [`GateConfig::build_discovery`] — validation is fatal before any
//! traffic is served.
//!
//! ## Discovery
//!
//! [`DiscoveryResponder`] serves the two OAuth discovery documents —
//! Authorization Server Metadata (RFC 8414) and Protected Resource
//! Metadata (RFC 9728) — at their well-known paths, with every advertised
//! URI checked against the same domain allow-list that guards JWKS
//! fetches.

pub mod allowlist;
pub mod claims;
pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod jwks;
pub mod metadata;
pub mod middleware;
pub mod verifier;

// Re-exports
pub use allowlist::DomainAllowList;
pub use claims::{ALWAYS_EXPOSED, ClaimSet, ExposurePolicy};
pub use condition::{Combine, Condition, ConditionParseError, ConditionSet};
pub use config::{ConfigError, GateConfig, Strategy};
pub use context::{current_claims, has_identity, with_identity};
pub use error::AuthError;
pub use jwks::{FetchError, HttpKeyFetcher, JwksKeySource, JwksKeySourceBuilder, KeyFetcher};
pub use metadata::{
    AuthorizationServerMetadata, DiscoveryResponder, ProtectedResourceMetadata,
};
pub use middleware::{AuthGate, AuthGateLayer, AuthGateService};
pub use verifier::{TokenVerifier, TrustStrategy, VerificationOutcome};
