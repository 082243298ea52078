//! Request-scoped identity propagation.
//!
//! Carries the filtered claim set from the verification stage to arbitrary
//! downstream consumers (tool handlers, authorization checks) without
//! threading a parameter through every call — and without a process-wide
//! global. The cell is a tokio task-local scoped to exactly one request
//! future: concurrent requests each see their own value, and the slot is
//! released on every exit path (return, error, cancellation) when the
//! scope future drops.
//!
//! Transports that perform no identity check install an explicit `None`
//! so downstream code observes "no verified identity" rather than
//! whatever a previous request on the same worker left behind.

use crate::claims::ClaimSet;

tokio::task_local! {
    static CURRENT_IDENTITY: Option<ClaimSet>;
}

/// Run `f` with the given identity installed for its whole lifetime.
///
/// `None` marks an explicitly unauthenticated request. The identity is
/// write-once: nested scopes shadow rather than mutate, and readers only
/// ever see the complete claim set that was installed.
pub async fn with_identity<F>(claims: Option<ClaimSet>, f: F) -> F::Output
where
    F: Future,
{
    CURRENT_IDENTITY.scope(claims, f).await
}

/// The verified claims of the current request, if any.
///
/// Returns `None` both for explicitly unauthenticated requests and when
/// called outside any request scope. The returned set is an immutable
/// snapshot; cloning it is cheap.
pub fn current_claims() -> Option<ClaimSet> {
    CURRENT_IDENTITY
        .try_with(|claims| claims.clone())
        .ok()
        .flatten()
}

/// Whether the current request carries a verified identity.
pub fn has_identity() -> bool {
    current_claims().is_some()
}
