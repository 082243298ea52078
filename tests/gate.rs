//! End-to-end tests for the gate middleware.
//!
//! These tests spin up a lightweight axum server serving a JWKS endpoint,
//! then drive requests through the full tower stack: bearer extraction,
//! key fetch, signature and claim checks, allow-conditions, exposure
//! filtering, and the request-scoped identity the tool handler reads.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use tower::{Layer, ServiceExt};
use tower_service::Service;

use mcp_gate::{
    AuthGate, AuthGateLayer, AuthorizationServerMetadata, ClaimSet, Combine, ConditionSet,
    DiscoveryResponder, DomainAllowList, ExposurePolicy, GateConfig, JwksKeySource,
    ProtectedResourceMetadata, TokenVerifier, current_claims,
};

const SECRET: &[u8] = b"integration-test-hs256-secret";
const ISSUER: &str = "https://auth.example.com/";
const AUDIENCE: &str = "https://mcp.example.com";

fn jwks_document(kid: &str) -> Value {
    json!({
        "keys": [{
            "kty": "oct",
            "kid": kid,
            "k": URL_SAFE_NO_PAD.encode(SECRET),
        }]
    })
}

/// Spin up a mock JWKS server, counting every fetch it serves.
async fn start_jwks_server(jwks: Value, hits: Arc<AtomicUsize>) -> String {
    let app = Router::new().route(
        "/.well-known/jwks.json",
        get(move || {
            let hits = hits.clone();
            let jwks = jwks.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                axum::Json(jwks)
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://127.0.0.1:{}", addr.port())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn signed_token(kid: &str, extra: Value) -> String {
    let mut claims = json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "exp": now_secs() + 3600,
    });
    if let (Value::Object(base), Value::Object(extra)) = (&mut claims, extra) {
        base.extend(extra);
    }
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

/// A stand-in tool handler that reports the identity it observed.
#[derive(Clone)]
struct WhoamiService;

impl Service<Request<Body>> for WhoamiService {
    type Response = Response;
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let extension_claims = req.extensions().get::<ClaimSet>().cloned();
        Box::pin(async move {
            let context_claims = current_claims();
            let body = json!({
                "context": context_claims.map(|c| c.as_map().clone()),
                "extension": extension_claims.map(|c| c.as_map().clone()),
            });
            Ok((StatusCode::OK, axum::Json(body)).into_response())
        })
    }
}

fn local_gate(base_url: &str) -> AuthGate {
    let keys = Arc::new(
        JwksKeySource::builder(format!("{base_url}/.well-known/jwks.json"))
            .min_refresh_interval(Duration::ZERO)
            .build(),
    );
    AuthGate::new(
        TokenVerifier::local(keys, ISSUER, AUDIENCE).algorithms(vec![Algorithm::HS256]),
    )
    .resource(AUDIENCE)
}

fn bearer_request(token: &str) -> Request<Body> {
    Request::builder()
        .uri("/mcp")
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_local_valid_token_reaches_tool_with_filtered_claims() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = start_jwks_server(jwks_document("k1"), hits).await;

    let gate = local_gate(&base_url)
        .exposure_policy(ExposurePolicy::named(["sub", "email"]));
    let service = AuthGateLayer::new(gate).layer(WhoamiService);

    let token = signed_token(
        "k1",
        json!({
            "sub": "dev",
            "email": "dev@corp.com",
            "roles": ["admin"],
            "internal_flag": true,
        }),
    );
    let response = service.oneshot(bearer_request(&token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let seen = &body["context"];
    assert_eq!(seen["sub"], "dev");
    assert_eq!(seen["email"], "dev@corp.com");
    // authorization claims survive filtering even though the policy omits them
    assert_eq!(seen["roles"], json!(["admin"]));
    assert!(seen.get("internal_flag").is_none());
    // the verifier's standard claims are filtered out too
    assert!(seen.get("iss").is_none());
    assert_eq!(body["extension"], body["context"]);
}

#[tokio::test]
async fn test_local_missing_and_malformed_headers_rejected_uniformly() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = start_jwks_server(jwks_document("k1"), hits.clone()).await;
    let service = AuthGateLayer::new(local_gate(&base_url)).layer(WhoamiService);

    for auth in [None, Some("Basic dXNlcjpwYXNz"), Some("bearer lowercase")] {
        let mut builder = Request::builder().uri("/mcp");
        if let Some(value) = auth {
            builder = builder.header("Authorization", value);
        }
        let response = service
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "for {auth:?}");
        let challenge = response
            .headers()
            .get("WWW-Authenticate")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(challenge.starts_with("Bearer"), "for {auth:?}");
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "authentication required");
    }
    // no credential ever made it to key lookup
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_local_expired_token_rejected_without_detail() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = start_jwks_server(jwks_document("k1"), hits).await;
    let service = AuthGateLayer::new(local_gate(&base_url)).layer(WhoamiService);

    let token = signed_token("k1", json!({"exp": 1, "sub": "dev"}));
    let response = service.oneshot(bearer_request(&token)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get("WWW-Authenticate")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(challenge.contains("error=\"invalid_token\""));
    // which check failed stays server-side
    assert!(!challenge.contains("expired"));
    let body = body_json(response).await;
    assert!(!body.to_string().contains("expired"));
}

#[tokio::test]
async fn test_alg_none_token_rejected() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = start_jwks_server(jwks_document("k1"), hits.clone()).await;
    let service = AuthGateLayer::new(local_gate(&base_url)).layer(WhoamiService);

    let head = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","kid":"k1","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&json!({
            "iss": ISSUER,
            "aud": AUDIENCE,
            "exp": now_secs() + 3600,
            "sub": "attacker",
            "roles": ["admin"],
        }))
        .unwrap(),
    );
    let token = format!("{head}.{payload}.");

    let response = service.oneshot(bearer_request(&token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    // rejected before any key was needed
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_policy_denied_is_uniform_401() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = start_jwks_server(jwks_document("k1"), hits).await;

    let conditions = ConditionSet::parse(
        &[r#"has(payload.email) && payload.email.endswith("@corp.com")"#],
        Combine::All,
    )
    .unwrap();
    let keys = Arc::new(
        JwksKeySource::builder(format!("{base_url}/.well-known/jwks.json")).build(),
    );
    let gate = AuthGate::new(
        TokenVerifier::local(keys, ISSUER, AUDIENCE)
            .algorithms(vec![Algorithm::HS256])
            .conditions(conditions),
    );
    let service = AuthGateLayer::new(gate).layer(WhoamiService);

    // valid signature, no email claim at all: the condition is false, not an error
    let token = signed_token("k1", json!({"sub": "dev"}));
    let response = service.clone().oneshot(bearer_request(&token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = signed_token("k1", json!({"sub": "dev", "email": "dev@corp.com"}));
    let response = service.oneshot(bearer_request(&token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_kid_triggers_exactly_one_refresh() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = start_jwks_server(jwks_document("k1"), hits.clone()).await;
    let service = AuthGateLayer::new(local_gate(&base_url)).layer(WhoamiService);

    let token = signed_token("k1", json!({"sub": "dev"}));
    let response = service.clone().oneshot(bearer_request(&token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // signed with a kid the endpoint does not serve: one refresh, then reject
    let token = signed_token("k2", json!({"sub": "dev"}));
    let response = service.oneshot(bearer_request(&token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cold_cache_concurrent_requests_fetch_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = start_jwks_server(jwks_document("k1"), hits.clone()).await;
    let service = AuthGateLayer::new(local_gate(&base_url)).layer(WhoamiService);

    let token = signed_token("k1", json!({"sub": "dev"}));
    let mut handles = Vec::new();
    for _ in 0..50 {
        let service = service.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            service.oneshot(bearer_request(&token)).await.unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().status(), StatusCode::OK);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_blocked_jwks_host_is_never_fetched() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = start_jwks_server(jwks_document("k1"), hits.clone()).await;

    // the running server's host is not in the allow-list
    let keys = Arc::new(
        JwksKeySource::builder(format!("{base_url}/.well-known/jwks.json"))
            .allowlist(DomainAllowList::new(["auth.example.com"]))
            .build(),
    );
    let gate = AuthGate::new(
        TokenVerifier::local(keys, ISSUER, AUDIENCE).algorithms(vec![Algorithm::HS256]),
    );
    let service = AuthGateLayer::new(gate).layer(WhoamiService);

    let token = signed_token("k1", json!({"sub": "dev"}));
    let response = service.oneshot(bearer_request(&token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_external_strategy_end_to_end() {
    // forwarded claims, exposure limited to `sub`: the tool still sees the
    // role claim because authorization claims always survive filtering
    let gate = AuthGate::new(TokenVerifier::external("X-Validated-Jwt"))
        .exposure_policy(ExposurePolicy::named(["sub"]));
    let service = AuthGateLayer::new(gate).layer(WhoamiService);

    let request = Request::builder()
        .uri("/mcp")
        .header("X-Validated-Jwt", r#"{"sub":"alice","role":"admin"}"#)
        .body(Body::empty())
        .unwrap();
    let response = service.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(
        body["context"],
        json!({"sub": "alice", "role": "admin"})
    );
}

#[tokio::test]
async fn test_external_strategy_missing_header_rejected() {
    let gate = AuthGate::new(TokenVerifier::external("X-Validated-Jwt"));
    let service = AuthGateLayer::new(gate).layer(WhoamiService);

    let request = Request::builder().uri("/mcp").body(Body::empty()).unwrap();
    let response = service.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_external_strategy_forwarded_compact_token() {
    let gate = AuthGate::new(TokenVerifier::external("X-Validated-Jwt"));
    let service = AuthGateLayer::new(gate).layer(WhoamiService);

    // the upstream proxy forwards the validated token itself
    let token = signed_token("k1", json!({"sub": "bob", "scope": "mcp:read"}));
    let request = Request::builder()
        .uri("/mcp")
        .header("X-Validated-Jwt", token)
        .body(Body::empty())
        .unwrap();
    let response = service.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["context"]["sub"], "bob");
    assert_eq!(body["context"]["scope"], "mcp:read");
}

#[tokio::test]
async fn test_discovery_documents_public_while_tools_are_gated() {
    let allowlist = DomainAllowList::new(["example.com"]);
    let discovery = DiscoveryResponder::new(allowlist)
        .authorization_server(
            AuthorizationServerMetadata::new(ISSUER)
                .token_endpoint("https://auth.example.com/oauth/token")
                .jwks_uri("https://auth.example.com/.well-known/jwks.json"),
        )
        .protected_resource(
            ProtectedResourceMetadata::new(AUDIENCE)
                .authorization_server(ISSUER)
                .jwks_uri("https://auth.example.com/.well-known/jwks.json")
                .scope("mcp:read"),
        );

    let gate = AuthGate::new(TokenVerifier::external("X-Validated-Jwt")).resource(AUDIENCE);
    let app = discovery
        .routes()
        .route("/mcp", axum::routing::post(|| async { "tool output" }))
        .layer(AuthGateLayer::new(gate));

    // both well-known documents are served without credentials
    for path in [
        "/.well-known/oauth-protected-resource",
        "/.well-known/oauth-authorization-server",
    ] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "for {path}");
    }

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get("WWW-Authenticate")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(challenge.contains(
        "resource_metadata=\"https://mcp.example.com/.well-known/oauth-protected-resource\""
    ));
}

#[tokio::test]
async fn test_config_driven_gate_end_to_end() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = start_jwks_server(jwks_document("k1"), hits).await;

    let toml = format!(
        r#"
        exposed_claims = ["sub"]

        [validation]
        strategy = "local"

        [validation.local]
        jwks_uri = "{base_url}/.well-known/jwks.json"
        issuer = "{ISSUER}"
        audience = "{AUDIENCE}"
        algorithms = ["HS256"]
        allow_conditions = [
            {{ expression = '"admin" in payload.roles' }},
        ]
        "#
    );
    let config = GateConfig::from_toml_str(&toml).unwrap();
    config.validate().unwrap();
    let service = AuthGateLayer::new(config.build_gate().unwrap()).layer(WhoamiService);

    let token = signed_token("k1", json!({"sub": "dev", "roles": ["admin"]}));
    let response = service.clone().oneshot(bearer_request(&token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["context"]["sub"], "dev");
    assert_eq!(body["context"]["roles"], json!(["admin"]));

    let token = signed_token("k1", json!({"sub": "dev", "roles": ["viewer"]}));
    let response = service.oneshot(bearer_request(&token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
