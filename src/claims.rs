//! Verified claim sets and the exposure filter.
//!
//! A [`ClaimSet`] mirrors a token payload exactly: claim values may be
//! scalars, lists, or nested mappings. Once built by the verifier it is
//! immutable; the only way to derive a new set is [`ClaimSet::filtered`],
//! which reduces it to the configured [`ExposurePolicy`].

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, de};
use serde_json::{Map, Value};

/// Claims that survive every exposure policy.
///
/// Role- and scope-bearing claims drive downstream authorization checks, so
/// they cannot be configured away. Both spellings of the role claim are
/// pinned because issuers disagree on the plural.
pub const ALWAYS_EXPOSED: &[&str] = &["roles", "role", "scope"];

/// An immutable set of verified claims.
///
/// Cheap to clone (`Arc`-backed); clones share the same underlying mapping.
/// Readers always observe the complete set that was installed, never a
/// partially populated one.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    inner: Arc<Map<String, Value>>,
}

impl ClaimSet {
    /// Wrap a decoded token payload.
    pub fn new(claims: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(claims),
        }
    }

    /// An empty claim set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a top-level claim by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.inner.get(name)
    }

    /// Whether a top-level claim is present.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// The underlying claim mapping.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.inner
    }

    /// Number of top-level claims.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the set holds no claims at all.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The `sub` claim, when present as a string.
    pub fn subject(&self) -> Option<&str> {
        self.get("sub").and_then(Value::as_str)
    }

    /// Derive the claim set that crosses into tool logic.
    ///
    /// Pure and idempotent: the input is never mutated, and filtering an
    /// already-filtered set with the same policy is a no-op. The
    /// [`ALWAYS_EXPOSED`] claims are retained even when the policy omits
    /// them.
    pub fn filtered(&self, policy: &ExposurePolicy) -> ClaimSet {
        match policy {
            ExposurePolicy::All => self.clone(),
            ExposurePolicy::Named(names) => {
                let mut out = Map::new();
                for (name, value) in self.inner.iter() {
                    if names.contains(name) || ALWAYS_EXPOSED.contains(&name.as_str()) {
                        out.insert(name.clone(), value.clone());
                    }
                }
                ClaimSet::new(out)
            }
        }
    }
}

impl From<Map<String, Value>> for ClaimSet {
    fn from(claims: Map<String, Value>) -> Self {
        Self::new(claims)
    }
}

impl PartialEq for ClaimSet {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

/// Which claims the gateway exposes to downstream handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExposurePolicy {
    /// Expose the full verified claim set.
    #[default]
    All,
    /// Expose only the named claims (plus [`ALWAYS_EXPOSED`]).
    Named(HashSet<String>),
}

impl ExposurePolicy {
    /// Build an explicit policy from claim names.
    pub fn named(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ExposurePolicy::Named(names.into_iter().map(Into::into).collect())
    }
}

// Configuration writes either the string "all" or a list of claim names.
// Any other string is a startup error rather than a silent fallback.
impl<'de> Deserialize<'de> for ExposurePolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Sentinel(String),
            Names(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Sentinel(s) if s == "all" => Ok(ExposurePolicy::All),
            Raw::Sentinel(s) => Err(de::Error::custom(format!(
                "expected \"all\" or a list of claim names, got {s:?}"
            ))),
            Raw::Names(names) => Ok(ExposurePolicy::named(names)),
        }
    }
}
