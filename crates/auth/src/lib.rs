//! `fibernet-auth`: pure authentication/authorization boundary.
//!
//! This crate is intentionally decoupled from HTTP and storage.

pub mod authorize;
pub mod claims;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{
    require, Actor, AuthzError, Capability, CapabilityPolicy, CapabilitySet, FirstMatchPolicy,
    LegacyRolePolicy, RbacPolicy,
};
pub use claims::{
    validate_claims, Hs256JwtValidator, JwtClaims, JwtValidator, TokenValidationError,
};
pub use permissions::Permission;
pub use principal::PrincipalId;
pub use roles::Role;
