//! # Authorization
//!
//! The engine never decides who may do what; it asks an [`Authorizer`]
//! after the document exists and the move is legal from its status, and
//! before anything is written.
//!
//! Permission strings are `<document>.<verb>`, e.g. `stock_transfer.send`.

use std::collections::{HashMap, HashSet};

use tally_core::Reference;

/// Decides whether an actor may perform an action on a document.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, actor_id: &str, permission: &str, document: &Reference) -> bool;
}

/// Grants everything. For tests and single-user tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self, _actor_id: &str, _permission: &str, _document: &Reference) -> bool {
        true
    }
}

/// Static actor → permission table.
///
/// `"*"` grants every permission; `"<document>.*"` grants every verb on one
/// document type.
#[derive(Debug, Clone, Default)]
pub struct PermissionGrants {
    grants: HashMap<String, HashSet<String>>,
}

impl PermissionGrants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `permission` for `actor_id`.
    pub fn grant(mut self, actor_id: impl Into<String>, permission: impl Into<String>) -> Self {
        self.grants
            .entry(actor_id.into())
            .or_default()
            .insert(permission.into());
        self
    }

    pub fn revoke(&mut self, actor_id: &str, permission: &str) {
        if let Some(set) = self.grants.get_mut(actor_id) {
            set.remove(permission);
        }
    }

    fn allows(&self, actor_id: &str, permission: &str) -> bool {
        let Some(set) = self.grants.get(actor_id) else {
            return false;
        };

        if set.contains("*") || set.contains(permission) {
            return true;
        }

        match permission.split_once('.') {
            Some((document, _)) => set.contains(&format!("{document}.*")),
            None => false,
        }
    }
}

impl Authorizer for PermissionGrants {
    fn is_authorized(&self, actor_id: &str, permission: &str, _document: &Reference) -> bool {
        self.allows(actor_id, permission)
    }
}
