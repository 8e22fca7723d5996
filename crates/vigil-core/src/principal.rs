//! Authenticated identity behind a connection.

use serde::{Deserialize, Serialize};

/// User, institution and role taken from a validated credential.
///
/// All three are opaque strings. They are compared for authorization and
/// printed in logs, nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// User identifier.
    pub user_id: String,
    /// Institution the user belongs to.
    pub institution_id: String,
    /// Role name.
    pub role: String,
}

impl Principal {
    /// Build a principal.
    pub fn new(
        user_id: impl Into<String>,
        institution_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            institution_id: institution_id.into(),
            role: role.into(),
        }
    }

    /// Whether `role` is exactly one of the administrative roles.
    pub fn is_admin<S: AsRef<str>>(&self, admin_roles: &[S]) -> bool {
        admin_roles
            .iter()
            .any(|r| r.as_ref() == self.role)
    }
}
