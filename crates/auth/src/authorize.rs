//! Capability policy: which operational capabilities an actor holds.
//!
//! Two strategies are evaluated in a fixed order:
//!
//! 1. [`RbacPolicy`]: explicit permissions on the actor, plus a role→permission
//!    mapping.
//! 2. [`LegacyRolePolicy`]: older accounts carry only a free-form role label;
//!    a normalised allow list decides.
//!
//! [`FirstMatchPolicy`] composes them: the first strategy that grants anything
//! decides the whole set. No IO, no panics.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;

use fibernet_core::TenantId;

use crate::{Permission, PrincipalId, Role};

/// Operational capabilities checked by the sync subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Manage OLT devices; also qualifies page loads for the on-access sync trigger.
    ManageDevices,
}

impl Capability {
    /// Permission that grants this capability under RBAC.
    pub fn permission(self) -> Permission {
        match self {
            Capability::ManageDevices => Permission::DEVICES_MANAGE,
        }
    }

    pub fn all() -> &'static [Capability] {
        &[Capability::ManageDevices]
    }
}

/// Set of capabilities held by an actor within its tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The authenticated actor as seen by the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub principal_id: PrincipalId,
    pub tenant_id: TenantId,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing capability '{0:?}'")]
    Forbidden(Capability),
}

/// Source of an actor's capability set.
pub trait CapabilityPolicy: Send + Sync {
    fn capabilities(&self, actor: &Actor) -> CapabilitySet;
}

/// Require a capability, evaluated once at the call site.
pub fn require(capabilities: &CapabilitySet, capability: Capability) -> Result<(), AuthzError> {
    if capabilities.contains(capability) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(capability))
    }
}

/// Permission-based strategy.
#[derive(Debug, Clone, Default)]
pub struct RbacPolicy {
    role_permissions: HashMap<String, Vec<Permission>>,
}

impl RbacPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant permissions to a role name (matched after normalisation).
    pub fn with_role(mut self, role: &str, permissions: Vec<Permission>) -> Self {
        self.role_permissions
            .insert(Role::new(role.to_string()).normalized(), permissions);
        self
    }

    /// Conventional mapping: `admin` holds everything.
    pub fn standard() -> Self {
        Self::new().with_role("admin", vec![Permission::new("*")])
    }

    fn effective_permissions<'a>(&'a self, actor: &'a Actor) -> HashSet<&'a str> {
        let mut perms: HashSet<&str> = actor.permissions.iter().map(|p| p.as_str()).collect();
        for role in &actor.roles {
            if let Some(granted) = self.role_permissions.get(&role.normalized()) {
                perms.extend(granted.iter().map(|p| p.as_str()));
            }
        }
        perms
    }
}

impl CapabilityPolicy for RbacPolicy {
    fn capabilities(&self, actor: &Actor) -> CapabilitySet {
        let perms = self.effective_permissions(actor);
        let wildcard = perms.contains("*");

        Capability::all()
            .iter()
            .copied()
            .filter(|c| wildcard || perms.contains(c.permission().as_str()))
            .collect()
    }
}

/// Role-label strategy for accounts without RBAC permissions.
#[derive(Debug, Clone)]
pub struct LegacyRolePolicy {
    device_roles: HashSet<String>,
}

impl LegacyRolePolicy {
    pub fn new<I, S>(device_roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            device_roles: device_roles
                .into_iter()
                .map(|r| Role::new(r.as_ref().to_string()).normalized())
                .collect(),
        }
    }
}

/// Role labels allowed to manage devices by default. `teknisi` is the
/// Indonesian label older accounts still carry for technicians.
pub const DEFAULT_DEVICE_ROLES: &[&str] = &["teknisi", "technician", "owner"];

impl Default for LegacyRolePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_ROLES.iter().copied())
    }
}

impl CapabilityPolicy for LegacyRolePolicy {
    fn capabilities(&self, actor: &Actor) -> CapabilitySet {
        let allowed = actor
            .roles
            .iter()
            .any(|r| self.device_roles.contains(&r.normalized()));

        if allowed {
            [Capability::ManageDevices].into_iter().collect()
        } else {
            CapabilitySet::empty()
        }
    }
}

/// Evaluates strategies in order; the first non-empty set wins.
pub struct FirstMatchPolicy {
    strategies: Vec<Box<dyn CapabilityPolicy>>,
}

impl FirstMatchPolicy {
    pub fn new(strategies: Vec<Box<dyn CapabilityPolicy>>) -> Self {
        Self { strategies }
    }

    /// RBAC first, legacy role labels as fallback.
    pub fn rbac_then_legacy(rbac: RbacPolicy, legacy: LegacyRolePolicy) -> Self {
        Self::new(vec![Box::new(rbac), Box::new(legacy)])
    }
}

impl CapabilityPolicy for FirstMatchPolicy {
    fn capabilities(&self, actor: &Actor) -> CapabilitySet {
        for strategy in &self.strategies {
            let set = strategy.capabilities(actor);
            if !set.is_empty() {
                return set;
            }
        }
        CapabilitySet::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(roles: &[&'static str], permissions: &[&'static str]) -> Actor {
        Actor {
            principal_id: PrincipalId::new(1),
            tenant_id: TenantId::new(1).unwrap(),
            roles: roles.iter().map(|r| Role::new(*r)).collect(),
            permissions: permissions.iter().map(|p| Permission::new(*p)).collect(),
        }
    }

    fn policy() -> FirstMatchPolicy {
        FirstMatchPolicy::rbac_then_legacy(RbacPolicy::standard(), LegacyRolePolicy::default())
    }

    #[test]
    fn explicit_permission_grants_device_management() {
        let caps = policy().capabilities(&actor(&["cashier"], &["devices.manage"]));
        assert!(require(&caps, Capability::ManageDevices).is_ok());
    }

    #[test]
    fn admin_role_grants_everything() {
        let caps = policy().capabilities(&actor(&["Admin"], &[]));
        assert!(caps.contains(Capability::ManageDevices));
    }

    #[test]
    fn legacy_role_is_the_fallback() {
        let caps = policy().capabilities(&actor(&[" Owner "], &[]));
        assert!(caps.contains(Capability::ManageDevices));

        let caps = policy().capabilities(&actor(&["Teknisi"], &[]));
        assert!(caps.contains(Capability::ManageDevices));

        let caps = policy().capabilities(&actor(&["cashier"], &["billing.read"]));
        assert_eq!(
            require(&caps, Capability::ManageDevices),
            Err(AuthzError::Forbidden(Capability::ManageDevices))
        );
    }

    #[test]
    fn legacy_allow_list_is_configurable() {
        let legacy = LegacyRolePolicy::new(["svp lapangan"]);
        let caps = legacy.capabilities(&actor(&["SVP Lapangan"], &[]));
        assert!(caps.contains(Capability::ManageDevices));
    }
}
