use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role identifier.
///
/// Roles are opaque strings at this layer. Legacy deployments store free-form
/// role labels ("Owner", "svp lapangan"), so comparisons go through
/// [`Role::normalized`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased, trimmed, inner whitespace collapsed to `_`.
    pub fn normalized(&self) -> String {
        self.0
            .trim()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .to_lowercase()
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
