//! Read-authorization seam for event delivery.
//!
//! The distribution layer never evaluates ACL policy itself. Each
//! subscription supplies an [`Authorizer`]; payloads decide which resource
//! the query is about and ask it a single yes/no question.

// ---------------------------------------------------------------------------
// Authorizer
// ---------------------------------------------------------------------------

/// Capability to answer "may this identity read this resource".
///
/// Implementations live outside this crate (token resolvers, policy
/// engines). Payloads call [`Authorizer::can_read`] with the resource they
/// carry; the authorizer is never mutated and may be shared across
/// subscriptions.
pub trait Authorizer: Send + Sync {
    /// Returns `true` if the identity behind this authorizer may read
    /// `resource`.
    fn can_read(&self, resource: &str) -> bool;
}

/// Grants every read.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_read(&self, _resource: &str) -> bool {
        true
    }
}

/// Denies every read. Fail-closed default for untrusted identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn can_read(&self, _resource: &str) -> bool {
        false
    }
}
