//! Strongly-typed identifiers used across the domain.
//!
//! Tenants and devices are keyed by positive integers. Zero is never a valid
//! identifier, so every constructor rejects it.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a tenant (multi-tenant boundary).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct TenantId(u64);

/// Identifier of a managed device (an OLT), unique within a tenant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct DeviceId(u64);

macro_rules! impl_positive_id {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create an identifier, rejecting zero.
            pub fn new(value: u64) -> Result<Self, DomainError> {
                if value == 0 {
                    return Err(DomainError::invalid_id(format!("{}: must be positive", $name)));
                }
                Ok(Self(value))
            }

            pub fn get(self) -> u64 {
                self.0
            }

            /// Value as stored in signed integer columns.
            pub fn as_i64(self) -> i64 {
                self.0 as i64
            }

            /// Build from a signed integer column value.
            pub fn from_i64(value: i64) -> Result<Self, DomainError> {
                let value = u64::try_from(value)
                    .map_err(|_| DomainError::invalid_id(format!("{}: negative", $name)))?;
                Self::new(value)
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl TryFrom<u64> for $t {
            type Error = DomainError;

            fn try_from(value: u64) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for u64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = s
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Self::new(value)
            }
        }
    };
}

impl_positive_id!(TenantId, "TenantId");
impl_positive_id!(DeviceId, "DeviceId");
