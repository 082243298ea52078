//! The gate as Tower middleware.
//!
//! [`AuthGate`] bundles the verifier, the exposure policy, and the
//! advertised resource metadata URL. [`AuthGateLayer`]/[`AuthGateService`]
//! wrap an inner HTTP service so that, per request:
//!
//! 1. Public paths (the well-known discovery endpoints, plus any the
//!    deployment adds) pass through with an explicit "no identity" marker.
//! 2. The credential is verified per the configured trust strategy.
//! 3. On success the claim set is reduced by the exposure policy, injected
//!    into request extensions, and installed in the request-scoped context
//!    for the lifetime of the inner call.
//! 4. On rejection the precise reason is logged server-side and the caller
//!    receives the uniform 401 with its `WWW-Authenticate` challenge.
//!
//! Non-tower transports call [`AuthGate::verify_and_install_context`]
//! directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tower::Layer;

use crate::claims::ExposurePolicy;
use crate::context::with_identity;
use crate::error::AuthError;
use crate::jwks::{HttpKeyFetcher, KeyFetcher};
use crate::metadata::{
    AUTHORIZATION_SERVER_METADATA_PATH, PROTECTED_RESOURCE_METADATA_PATH,
};
use crate::verifier::{TokenVerifier, VerificationOutcome};

/// The verification pipeline for one deployment: trust strategy,
/// allow-conditions, and exposure policy.
pub struct AuthGate<F = HttpKeyFetcher> {
    verifier: TokenVerifier<F>,
    exposure: ExposurePolicy,
    resource_metadata_url: Option<String>,
}

impl<F: KeyFetcher> AuthGate<F> {
    /// Build a gate around a verifier, exposing all claims by default.
    pub fn new(verifier: TokenVerifier<F>) -> Self {
        Self {
            verifier,
            exposure: ExposurePolicy::All,
            resource_metadata_url: None,
        }
    }

    /// Set which claims cross into downstream handlers.
    pub fn exposure_policy(mut self, policy: ExposurePolicy) -> Self {
        self.exposure = policy;
        self
    }

    /// Set the resource identifier URL; rejections then advertise its
    /// RFC 9728 metadata document in the `WWW-Authenticate` challenge.
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        let resource: String = resource.into();
        self.resource_metadata_url = Some(format!(
            "{}{}",
            resource.trim_end_matches('/'),
            PROTECTED_RESOURCE_METADATA_PATH
        ));
        self
    }

    /// The advertised metadata URL, when a resource is configured.
    pub fn resource_metadata_url(&self) -> Option<&str> {
        self.resource_metadata_url.as_deref()
    }

    /// Verify the request's credential and reduce the claims by the
    /// exposure policy.
    pub async fn authenticate(&self, headers: &HeaderMap) -> VerificationOutcome {
        match self.verifier.verify(headers).await {
            VerificationOutcome::Verified(claims) => {
                VerificationOutcome::Verified(claims.filtered(&self.exposure))
            }
            rejected => rejected,
        }
    }

    /// The single entry point for transport middleware: verify the
    /// request, then run `next` with the filtered claims installed in the
    /// request-scoped context.
    ///
    /// On rejection `next` never runs and the structured reason is
    /// returned for the transport to map into its uniform response.
    pub async fn verify_and_install_context<Fut>(
        &self,
        headers: &HeaderMap,
        next: Fut,
    ) -> Result<Fut::Output, AuthError>
    where
        Fut: Future,
    {
        match self.authenticate(headers).await {
            VerificationOutcome::Verified(claims) => {
                Ok(with_identity(Some(claims), next).await)
            }
            VerificationOutcome::Rejected(error) => Err(error),
        }
    }
}

/// Tower layer applying [`AuthGateService`] to an inner service.
pub struct AuthGateLayer<F = HttpKeyFetcher> {
    gate: Arc<AuthGate<F>>,
    public_paths: Vec<String>,
}

impl<F: KeyFetcher> AuthGateLayer<F> {
    /// Wrap a gate. The discovery endpoints are always public.
    pub fn new(gate: AuthGate<F>) -> Self {
        Self {
            gate: Arc::new(gate),
            public_paths: vec![
                PROTECTED_RESOURCE_METADATA_PATH.to_string(),
                AUTHORIZATION_SERVER_METADATA_PATH.to_string(),
            ],
        }
    }

    /// Add a path prefix that does not require authentication.
    pub fn public_path(mut self, path: impl Into<String>) -> Self {
        self.public_paths.push(path.into());
        self
    }
}

impl<F> Clone for AuthGateLayer<F> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            public_paths: self.public_paths.clone(),
        }
    }
}

impl<S, F: KeyFetcher> Layer<S> for AuthGateLayer<F> {
    type Service = AuthGateService<S, F>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthGateService {
            inner,
            gate: self.gate.clone(),
            public_paths: self.public_paths.clone(),
        }
    }
}

/// Tower service enforcing the gate on every request.
pub struct AuthGateService<S, F = HttpKeyFetcher> {
    inner: S,
    gate: Arc<AuthGate<F>>,
    public_paths: Vec<String>,
}

impl<S: Clone, F> Clone for AuthGateService<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gate: self.gate.clone(),
            public_paths: self.public_paths.clone(),
        }
    }
}

impl<S, F> tower_service::Service<Request<Body>> for AuthGateService<S, F>
where
    S: tower_service::Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send,
    F: KeyFetcher,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let path = req.uri().path().to_string();
        let gate = self.gate.clone();
        let public_paths = self.public_paths.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // Public paths skip verification but still get an explicit
            // "no verified identity" context rather than stale state.
            if public_paths.iter().any(|p| path.starts_with(p.as_str()))
                || path.contains("/.well-known/")
            {
                return with_identity(None, inner.call(req)).await;
            }

            match gate.authenticate(req.headers()).await {
                VerificationOutcome::Verified(claims) => {
                    let mut req = req;
                    req.extensions_mut().insert(claims.clone());
                    with_identity(Some(claims), inner.call(req)).await
                }
                VerificationOutcome::Rejected(error) => Ok(rejection_response(
                    &error,
                    gate.resource_metadata_url(),
                )),
            }
        })
    }
}

/// The uniform external response for any rejection: HTTP 401, a generic
/// JSON-RPC error body, and the RFC 6750 challenge. Which check failed is
/// never revealed here; it was already logged server-side.
fn rejection_response(error: &AuthError, resource_metadata_url: Option<&str>) -> Response {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "error": {
            "code": -32001,
            "message": "authentication required"
        },
        "id": null
    });

    let mut response = (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response();
    let challenge = error
        .www_authenticate(resource_metadata_url)
        .parse()
        .unwrap_or_else(|_| HeaderValue::from_static("Bearer"));
    response.headers_mut().insert("WWW-Authenticate", challenge);
    response
}
