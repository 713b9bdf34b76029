//! Permission checks for gated methods.
//!
//! The dispatcher asks a [`PermissionManager`] before running a method that
//! declares permissions. Real hosts show a prompt; [`StaticPermissionManager`]
//! answers from fixed sets and is what the CLI and tests use.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;

use crate::response::Response;
use crate::scope::ScopeId;

/// Why a permission request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    UserDenied,
    /// The host rejected the prompt because too many were pending.
    TooManyRequests,
}

/// Result of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    Denied {
        reason: DenialReason,
        /// The user asked not to be prompted again.
        dont_disturb: bool,
    },
}

impl PermissionOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }

    /// The denial response delivered through the callback channel.
    pub fn denial_response(&self) -> Option<Response> {
        match self {
            Self::Granted => None,
            Self::Denied {
                reason: DenialReason::TooManyRequests,
                ..
            } => Some(Response::too_many_requests()),
            Self::Denied {
                reason: DenialReason::UserDenied,
                dont_disturb,
            } => Some(Response::user_denied(*dont_disturb)),
        }
    }
}

#[async_trait]
pub trait PermissionManager: Send + Sync {
    /// Request every permission in `permissions` for `scope`.
    ///
    /// Called from the prompting context; the dispatcher never runs the method
    /// body inside this future.
    async fn request_permissions(&self, scope: ScopeId, permissions: &[String])
    -> PermissionOutcome;
}

/// Grants everything.
pub struct AllowAllPermissions;

#[async_trait]
impl PermissionManager for AllowAllPermissions {
    async fn request_permissions(&self, _scope: ScopeId, _permissions: &[String]) -> PermissionOutcome {
        PermissionOutcome::Granted
    }
}

/// Answers from fixed grant/deny sets.
///
/// A permission is granted when it is in the grant set, or when `grant_unknown`
/// is set and it is not explicitly denied.
pub struct StaticPermissionManager {
    granted: RwLock<HashSet<String>>,
    denied: RwLock<HashSet<String>>,
    dont_disturb: RwLock<HashSet<String>>,
    grant_unknown: bool,
}

impl StaticPermissionManager {
    pub fn new() -> Self {
        Self {
            granted: RwLock::new(HashSet::new()),
            denied: RwLock::new(HashSet::new()),
            dont_disturb: RwLock::new(HashSet::new()),
            grant_unknown: false,
        }
    }

    /// Grant every permission not explicitly denied.
    pub fn permissive() -> Self {
        Self {
            grant_unknown: true,
            ..Self::new()
        }
    }

    pub fn grant(&self, permission: impl Into<String>) {
        let permission = permission.into();
        self.denied.write().remove(&permission);
        self.dont_disturb.write().remove(&permission);
        self.granted.write().insert(permission);
    }

    pub fn deny(&self, permission: impl Into<String>, dont_disturb: bool) {
        let permission = permission.into();
        self.granted.write().remove(&permission);
        if dont_disturb {
            self.dont_disturb.write().insert(permission.clone());
        } else {
            self.dont_disturb.write().remove(&permission);
        }
        self.denied.write().insert(permission);
    }

    fn is_granted(&self, permission: &str) -> bool {
        if self.denied.read().contains(permission) {
            return false;
        }
        self.grant_unknown || self.granted.read().contains(permission)
    }
}

impl Default for StaticPermissionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionManager for StaticPermissionManager {
    async fn request_permissions(&self, scope: ScopeId, permissions: &[String]) -> PermissionOutcome {
        for permission in permissions {
            if !self.is_granted(permission) {
                let dont_disturb = self.dont_disturb.read().contains(permission);
                tracing::debug!(scope = %scope, permission = %permission, dont_disturb, "Permission denied");
                return PermissionOutcome::Denied {
                    reason: DenialReason::UserDenied,
                    dont_disturb,
                };
            }
        }
        PermissionOutcome::Granted
    }
}
