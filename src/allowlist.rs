//! Domain allow-list guarding every outbound reference.
//!
//! The gate only ever reaches out to (or advertises) hosts the operator
//! listed: the JWKS endpoint before any fetch, and every URI embedded in a
//! discovery document before it is served. A host outside the list is an
//! SSRF attempt or a misconfiguration; either way the reference is rejected
//! before a single network call is issued.

use url::Url;

use crate::error::AuthError;

/// Statically configured set of allowed domains.
///
/// A host matches when it equals a listed domain or is a subdomain of one
/// (`sub.example.com` matches `example.com`). An empty list places no
/// restriction, which is the out-of-the-box behavior for deployments that
/// have not hardened their egress yet.
#[derive(Debug, Clone, Default)]
pub struct DomainAllowList {
    domains: Vec<String>,
}

impl DomainAllowList {
    /// Build from configured domain names. Names are normalized to
    /// lowercase; a leading dot is stripped.
    pub fn new(domains: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let domains = domains
            .into_iter()
            .map(|d| {
                let d: String = d.into();
                d.trim().trim_start_matches('.').to_ascii_lowercase()
            })
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    /// The unrestricted allow-list.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Whether this list permits every host.
    pub fn is_unrestricted(&self) -> bool {
        self.domains.is_empty()
    }

    /// Check a URI's host against the list.
    ///
    /// An unparseable URI or one without a host is rejected outright; it
    /// cannot be proven to stay inside the allowed domains.
    pub fn check(&self, uri: &str) -> Result<(), AuthError> {
        if self.domains.is_empty() {
            return Ok(());
        }

        let url =
            Url::parse(uri).map_err(|_| AuthError::SsrfBlocked(format!("unparseable uri {uri:?}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| AuthError::SsrfBlocked(format!("uri {uri:?} has no host")))?
            .to_ascii_lowercase();

        let allowed = self
            .domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")));
        if allowed {
            Ok(())
        } else {
            Err(AuthError::SsrfBlocked(host))
        }
    }

    /// Convenience predicate over [`check`](Self::check).
    pub fn permits(&self, uri: &str) -> bool {
        self.check(uri).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_allows_everything() {
        let list = DomainAllowList::allow_all();
        assert!(list.is_unrestricted());
        assert!(list.permits("https://anything.example.net/jwks"));
        assert!(list.permits("http://127.0.0.1:9999/"));
    }

    #[test]
    fn test_exact_host_allowed() {
        let list = DomainAllowList::new(["example.com"]);
        assert!(list.permits("https://example.com/.well-known/jwks.json"));
    }

    #[test]
    fn test_subdomain_allowed() {
        let list = DomainAllowList::new(["example.com"]);
        assert!(list.permits("https://auth.example.com/jwks"));
        assert!(list.permits("https://deep.auth.example.com/jwks"));
    }

    #[test]
    fn test_suffix_lookalike_blocked() {
        let list = DomainAllowList::new(["example.com"]);
        // "evilexample.com" ends with "example.com" but is not a subdomain
        assert!(!list.permits("https://evilexample.com/jwks"));
    }

    #[test]
    fn test_other_host_blocked() {
        let list = DomainAllowList::new(["example.com"]);
        let err = list.check("https://attacker.net/jwks").unwrap_err();
        assert!(matches!(err, AuthError::SsrfBlocked(host) if host == "attacker.net"));
    }

    #[test]
    fn test_unparseable_uri_blocked() {
        let list = DomainAllowList::new(["example.com"]);
        assert!(!list.permits("not a uri"));
        assert!(!list.permits("file:///etc/passwd"));
    }

    #[test]
    fn test_case_and_dot_normalization() {
        let list = DomainAllowList::new([" .Example.COM "]);
        assert!(list.permits("https://AUTH.EXAMPLE.com/jwks"));
    }

    #[test]
    fn test_ip_hosts_match_exactly() {
        let list = DomainAllowList::new(["127.0.0.1"]);
        assert!(list.permits("http://127.0.0.1:8080/jwks"));
        assert!(!list.permits("http://127.0.0.2:8080/jwks"));
    }
}
