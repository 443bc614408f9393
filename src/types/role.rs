use std::fmt;

use serde::{Deserialize, Serialize};

/// Role verdicts supplied by the authentication layer, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(u32);

impl Role {
    pub const OWNER: Role = Role(1 << 0); // 1
    pub const REVIEWER: Role = Role(1 << 1); // 2
    pub const VALIDATOR: Role = Role(1 << 2); // 4
    pub const ADMIN: Role = Role(1 << 3); // 8

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if this role set contains all of `required`.
    #[must_use]
    pub const fn has(self, required: Role) -> bool {
        self.0 & required.0 == required.0
    }

    /// Returns true if this role set shares at least one role with `any`.
    #[must_use]
    pub const fn intersects(self, any: Role) -> bool {
        self.0 & any.0 != 0
    }

    #[must_use]
    pub const fn union(self, other: Role) -> Role {
        Role(self.0 | other.0)
    }

    /// Expands a role set to include implied roles: admin implies reviewer.
    #[must_use]
    pub fn expand_implied(self) -> Role {
        if self.has(Self::ADMIN) {
            self.union(Self::REVIEWER)
        } else {
            self
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "owner" => Some(Self::OWNER),
            "reviewer" => Some(Self::REVIEWER),
            "validator" => Some(Self::VALIDATOR),
            "admin" => Some(Self::ADMIN),
            _ => None,
        }
    }

    /// Parses a comma-separated role list such as `"owner,reviewer"`.
    pub fn parse_list(s: &str) -> Option<Role> {
        let mut result = Role::default();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            result = result.union(Self::parse(part)?);
        }
        Some(result)
    }

    #[must_use]
    pub fn to_strings(self) -> Vec<&'static str> {
        let mut roles = Vec::new();
        if self.has(Self::OWNER) {
            roles.push("owner");
        }
        if self.has(Self::REVIEWER) {
            roles.push("reviewer");
        }
        if self.has(Self::VALIDATOR) {
            roles.push("validator");
        }
        if self.has(Self::ADMIN) {
            roles.push("admin");
        }
        roles
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_strings().join(","))
    }
}

/// The caller on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    pub roles: Role,
}

impl Actor {
    pub fn new(name: impl Into<String>, roles: Role) -> Self {
        Self {
            name: name.into(),
            roles,
        }
    }
}
