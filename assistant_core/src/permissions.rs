//! Permission grants and the gate that evaluates them.
//!
//! Grants are looked up on every `authorize` call. Nothing is cached, so a
//! revocation is visible to the very next check.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Who is asking: an end user, or a plugin acting on a user's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Subject {
    User(String),
    Plugin(String),
}

impl Subject {
    pub fn user(id: impl Into<String>) -> Self {
        Subject::User(id.into())
    }

    pub fn plugin(name: impl Into<String>) -> Self {
        Subject::Plugin(name.into())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::User(id) => write!(f, "user:{id}"),
            Subject::Plugin(name) => write!(f, "plugin:{name}"),
        }
    }
}

/// A permission a handler requires, optionally narrowed to a resource scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Permission {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: None,
        }
    }

    pub fn scoped(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Some(scope.into()),
        }
    }

    /// Parse the config form `name` or `name:scope`.
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((name, scope)) if !scope.is_empty() => Permission::scoped(name.trim(), scope.trim()),
            _ => Permission::new(spec.trim().trim_end_matches(':')),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}({})", self.name, scope),
            None => f.write_str(&self.name),
        }
    }
}

impl From<&str> for Permission {
    fn from(name: &str) -> Self {
        Permission::new(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub subject: Subject,
    pub permission: String,
    pub scope: Option<String>,
    pub granted_at: DateTime<Utc>,
}

impl PermissionGrant {
    /// An unscoped grant covers every scope of its permission; a scoped grant
    /// covers only a request for exactly that scope.
    pub fn covers(&self, required: &Permission) -> bool {
        if self.permission != required.name {
            return false;
        }
        match (&self.scope, &required.scope) {
            (None, _) => true,
            (Some(granted), Some(wanted)) => granted == wanted,
            (Some(_), None) => false,
        }
    }
}

/// Holds live grants per subject and answers authorization questions.
#[derive(Debug, Default)]
pub struct PermissionGate {
    grants: DashMap<Subject, Vec<PermissionGrant>>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conjunctive check: every required permission must be covered by some
    /// grant. An empty requirement set is always authorized.
    pub fn authorize(&self, subject: &Subject, required: &[Permission]) -> bool {
        if required.is_empty() {
            return true;
        }
        let Some(grants) = self.grants.get(subject) else {
            debug!(%subject, "No grants on record, denying");
            return false;
        };
        let allowed = required
            .iter()
            .all(|perm| grants.iter().any(|g| g.covers(perm)));
        if !allowed {
            debug!(%subject, ?required, "Authorization denied");
        }
        allowed
    }

    /// Record a grant. Granting an identical permission twice is a no-op.
    pub fn grant(&self, subject: Subject, permission: Permission) {
        let mut entry = self.grants.entry(subject.clone()).or_default();
        let duplicate = entry
            .iter()
            .any(|g| g.permission == permission.name && g.scope == permission.scope);
        if !duplicate {
            info!(%subject, %permission, "Permission granted");
            entry.push(PermissionGrant {
                subject,
                permission: permission.name,
                scope: permission.scope,
                granted_at: Utc::now(),
            });
        }
    }

    /// Remove the grant matching name and scope exactly. Returns whether a
    /// grant was removed.
    pub fn revoke(&self, subject: &Subject, permission: &Permission) -> bool {
        let Some(mut grants) = self.grants.get_mut(subject) else {
            return false;
        };
        let before = grants.len();
        grants.retain(|g| !(g.permission == permission.name && g.scope == permission.scope));
        let removed = grants.len() != before;
        if removed {
            info!(%subject, %permission, "Permission revoked");
        }
        removed
    }

    /// Drop every grant of a subject, returning how many were removed.
    pub fn revoke_all(&self, subject: &Subject) -> usize {
        self.grants
            .remove(subject)
            .map(|(_, grants)| grants.len())
            .unwrap_or(0)
    }

    pub fn grants_for(&self, subject: &Subject) -> Vec<PermissionGrant> {
        self.grants
            .get(subject)
            .map(|g| g.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_is_conjunctive() {
        let gate = PermissionGate::new();
        let alice = Subject::user("alice");
        gate.grant(alice.clone(), Permission::new("file_read"));

        let required = vec![Permission::new("file_read"), Permission::new("ai_access")];
        assert!(!gate.authorize(&alice, &required));

        gate.grant(alice.clone(), Permission::new("ai_access"));
        assert!(gate.authorize(&alice, &required));
    }

    #[test]
    fn test_empty_requirement_always_authorized() {
        let gate = PermissionGate::new();
        assert!(gate.authorize(&Subject::user("nobody"), &[]));
    }

    #[test]
    fn test_scoped_grants_match_scope_exactly() {
        let gate = PermissionGate::new();
        let bob = Subject::user("bob");
        gate.grant(bob.clone(), Permission::scoped("file_write", "/home/bob"));

        assert!(gate.authorize(&bob, &[Permission::scoped("file_write", "/home/bob")]));
        assert!(!gate.authorize(&bob, &[Permission::scoped("file_write", "/etc")]));
        assert!(!gate.authorize(&bob, &[Permission::new("file_write")]));
    }

    #[test]
    fn test_unscoped_grant_covers_any_scope() {
        let gate = PermissionGate::new();
        let admin = Subject::user("admin");
        gate.grant(admin.clone(), Permission::new("file_write"));

        assert!(gate.authorize(&admin, &[Permission::scoped("file_write", "/etc")]));
        assert!(gate.authorize(&admin, &[Permission::new("file_write")]));
    }

    #[test]
    fn test_revocation_applies_to_next_check() {
        let gate = PermissionGate::new();
        let carol = Subject::user("carol");
        let perm = Permission::new("ai_access");
        gate.grant(carol.clone(), perm.clone());
        assert!(gate.authorize(&carol, &[perm.clone()]));

        assert!(gate.revoke(&carol, &perm));
        assert!(!gate.authorize(&carol, &[perm.clone()]));
        assert!(!gate.revoke(&carol, &perm));
    }

    #[test]
    fn test_user_and_plugin_subjects_are_distinct() {
        let gate = PermissionGate::new();
        gate.grant(Subject::plugin("notes"), Permission::new("file_read"));

        assert!(gate.authorize(&Subject::plugin("notes"), &[Permission::new("file_read")]));
        assert!(!gate.authorize(&Subject::user("notes"), &[Permission::new("file_read")]));
        assert_eq!(Subject::plugin("notes").to_string(), "plugin:notes");
    }

    #[test]
    fn test_parse_config_form() {
        assert_eq!(Permission::parse("file_read"), Permission::new("file_read"));
        assert_eq!(
            Permission::parse("file_write:/home/bob"),
            Permission::scoped("file_write", "/home/bob")
        );
        assert_eq!(Permission::parse("ai_access:"), Permission::new("ai_access"));
    }

    #[test]
    fn test_duplicate_grants_are_collapsed() {
        let gate = PermissionGate::new();
        let dave = Subject::user("dave");
        gate.grant(dave.clone(), Permission::new("x"));
        gate.grant(dave.clone(), Permission::new("x"));
        assert_eq!(gate.grants_for(&dave).len(), 1);
        assert_eq!(gate.revoke_all(&dave), 1);
        assert!(gate.grants_for(&dave).is_empty());
    }
}
