//! Role registry
//!
//! Answers `has_role(principal, role)` and nothing else. Grants and revocations
//! are admin-only and are the only mutations.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EscrowError;
use crate::types::Principal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Oracle,
    /// Allowed to open bounties when creation is restricted
    Creator,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Oracle => "oracle",
            Role::Creator => "creator",
        }
    }
}

#[derive(Debug, Default)]
pub struct RoleRegistry {
    members: RwLock<HashMap<Role, HashSet<Principal>>>,
}

impl RoleRegistry {
    /// Bootstrap a registry with its first admins. At least one is required.
    pub fn new(admins: impl IntoIterator<Item = Principal>) -> Result<Self, EscrowError> {
        let admins: HashSet<Principal> = admins.into_iter().collect();
        if admins.is_empty() {
            return Err(EscrowError::InvalidConfig(
                "at least one admin is required".to_string(),
            ));
        }
        let mut members = HashMap::new();
        members.insert(Role::Admin, admins);
        Ok(Self {
            members: RwLock::new(members),
        })
    }

    pub fn has_role(&self, principal: &Principal, role: Role) -> bool {
        self.members
            .read()
            .get(&role)
            .map(|set| set.contains(principal))
            .unwrap_or(false)
    }

    pub fn members(&self, role: Role) -> Vec<Principal> {
        let mut list: Vec<Principal> = self
            .members
            .read()
            .get(&role)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        list.sort();
        list
    }

    pub fn require(
        &self,
        principal: &Principal,
        role: Role,
        action: &'static str,
    ) -> Result<(), EscrowError> {
        if self.has_role(principal, role) {
            Ok(())
        } else {
            Err(EscrowError::Unauthorized {
                principal: principal.clone(),
                action,
                bounty_id: None,
            })
        }
    }

    pub fn grant(
        &self,
        role: Role,
        principal: Principal,
        caller: &Principal,
    ) -> Result<bool, EscrowError> {
        self.require(caller, Role::Admin, "grant roles")?;
        let added = self
            .members
            .write()
            .entry(role)
            .or_default()
            .insert(principal.clone());
        if added {
            info!("Granted {} role to {} (by {})", role.as_str(), principal, caller);
        }
        Ok(added)
    }

    /// Revoke a role. The last admin cannot be removed.
    pub fn revoke(
        &self,
        role: Role,
        principal: &Principal,
        caller: &Principal,
    ) -> Result<bool, EscrowError> {
        self.require(caller, Role::Admin, "revoke roles")?;
        let mut members = self.members.write();
        let Some(set) = members.get_mut(&role) else {
            return Ok(false);
        };
        if role == Role::Admin && set.len() == 1 && set.contains(principal) {
            return Err(EscrowError::InvalidConfig(
                "cannot revoke the last admin".to_string(),
            ));
        }
        let removed = set.remove(principal);
        if removed {
            info!("Revoked {} role from {} (by {})", role.as_str(), principal, caller);
        }
        Ok(removed)
    }

    pub(crate) fn snapshot(&self) -> HashMap<Role, Vec<Principal>> {
        self.members
            .read()
            .iter()
            .map(|(role, set)| {
                let mut list: Vec<Principal> = set.iter().cloned().collect();
                list.sort();
                (*role, list)
            })
            .collect()
    }

    pub(crate) fn restore(&self, snapshot: HashMap<Role, Vec<Principal>>) {
        let mut members = self.members.write();
        members.clear();
        for (role, list) in snapshot {
            members.insert(role, list.into_iter().collect());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Principal {
        Principal::from(s)
    }

    #[test]
    fn test_registry_requires_an_admin() {
        assert!(RoleRegistry::new(Vec::new()).is_err());
    }

    #[test]
    fn test_grant_and_revoke() {
        let roles = RoleRegistry::new([p("admin")]).unwrap();
        assert!(roles.has_role(&p("admin"), Role::Admin));
        assert!(!roles.has_role(&p("oracle"), Role::Oracle));

        assert!(roles.grant(Role::Oracle, p("oracle"), &p("admin")).unwrap());
        assert!(!roles.grant(Role::Oracle, p("oracle"), &p("admin")).unwrap());
        assert!(roles.has_role(&p("oracle"), Role::Oracle));

        assert!(roles.revoke(Role::Oracle, &p("oracle"), &p("admin")).unwrap());
        assert!(!roles.has_role(&p("oracle"), Role::Oracle));
    }

    #[test]
    fn test_non_admin_cannot_grant() {
        let roles = RoleRegistry::new([p("admin")]).unwrap();
        let err = roles
            .grant(Role::Oracle, p("mallory"), &p("mallory"))
            .unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized { .. }));
        assert!(!roles.has_role(&p("mallory"), Role::Oracle));
    }

    #[test]
    fn test_last_admin_is_kept() {
        let roles = RoleRegistry::new([p("admin")]).unwrap();
        assert!(roles.revoke(Role::Admin, &p("admin"), &p("admin")).is_err());

        roles.grant(Role::Admin, p("second"), &p("admin")).unwrap();
        assert!(roles.revoke(Role::Admin, &p("admin"), &p("second")).unwrap());
        assert_eq!(roles.members(Role::Admin), vec![p("second")]);
    }
}
