use fibernet_auth::{Capability, CapabilitySet, PrincipalId, Role};
use fibernet_core::TenantId;

/// Tenant context for a request.
///
/// This is immutable and must be present for all protected routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Principal context for a request (authenticated identity, roles and the
/// capabilities the policy granted them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal_id: PrincipalId,
    roles: Vec<Role>,
    capabilities: CapabilitySet,
}

impl PrincipalContext {
    pub fn new(principal_id: PrincipalId, roles: Vec<Role>, capabilities: CapabilitySet) -> Self {
        Self {
            principal_id,
            roles,
            capabilities,
        }
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }
}
