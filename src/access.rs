//! Allow-list gate in front of reads and writes.

use tracing::Span;

use crate::{
    identity::{canonical_entry, encode_npub},
    telemetry::ACCESS_DENIED,
};

/// Reason sent to clients that must authenticate before reading.
pub const AUTH_REQUIRED: &str = "auth-required: only authenticated users can read from this relay";
/// Reason sent when a pubkey is missing or not on the allow-list.
pub const UNAUTHORIZED: &str = "blocked: unauthorized pubkey";

/// Outcome of an access check. A denial is not an error: it carries the
/// client-facing reason instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied(&'static str),
}

impl Access {
    pub fn is_allowed(self) -> bool {
        matches!(self, Access::Allowed)
    }

    /// Client-facing rejection reason, if any.
    pub fn reason(self) -> Option<&'static str> {
        match self {
            Access::Allowed => None,
            Access::Denied(reason) => Some(reason),
        }
    }
}

/// Decides whether an identity may write events or open subscriptions.
///
/// An empty allow-list skips the membership check. Entries are compared
/// case-insensitively against the `npub` encoding of the identity.
#[derive(Debug, Clone)]
pub struct AccessController {
    allowed: Vec<String>,
    span: Span,
}

impl AccessController {
    pub fn new(allowed: &[String], span: Span) -> Self {
        let allowed = allowed
            .iter()
            .map(|e| canonical_entry(e))
            .filter(|e| !e.is_empty())
            .collect();
        Self { allowed, span }
    }

    /// Whether an allow-list is configured at all.
    pub fn is_restricted(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Gate for a newly submitted event authored by `author` (hex pubkey).
    pub fn can_write(&self, author: &str) -> Access {
        let access = self.check(author);
        if access.is_allowed() {
            tracing::debug!(parent: &self.span, pubkey = %author, "write accepted");
        } else if let Access::Denied(reason) = access {
            metrics::increment_counter!(ACCESS_DENIED, "op" => "write");
            tracing::info!(parent: &self.span, pubkey = %author, reason, "write rejected");
        }
        access
    }

    /// Gate for a subscription opened by `authed`, the identity the client
    /// authenticated as (if any).
    pub fn can_read(&self, authed: Option<&str>, auth_required: bool) -> Access {
        let identity = authed.unwrap_or_default();
        let access = if auth_required && identity.is_empty() {
            Access::Denied(AUTH_REQUIRED)
        } else {
            self.check(identity)
        };
        if let Access::Denied(reason) = access {
            metrics::increment_counter!(ACCESS_DENIED, "op" => "read");
            tracing::info!(parent: &self.span, pubkey = %identity, reason, "read rejected");
        }
        access
    }

    fn check(&self, identity: &str) -> Access {
        if identity.is_empty() {
            return Access::Denied(UNAUTHORIZED);
        }
        if self.allowed.is_empty() {
            return Access::Allowed;
        }
        let npub = match encode_npub(identity) {
            Ok(npub) => npub,
            Err(e) => {
                tracing::warn!(parent: &self.span, pubkey = %identity, error = %e, "encode pubkey");
                return Access::Denied(UNAUTHORIZED);
            }
        };
        if self.allowed.iter().any(|a| a.eq_ignore_ascii_case(&npub)) {
            Access::Allowed
        } else {
            Access::Denied(UNAUTHORIZED)
        }
    }
}
