use serde::{Deserialize, Serialize};

/// Caller role as issued by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Officer,
    Client,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "officer" => Some(Role::Officer),
            "client" => Some(Role::Client),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Officer => "officer",
            Role::Client => "client",
        }
    }
}

/// Descriptor of the acting caller: role plus assigned organization, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caller {
    pub role: Role,
    pub organization_id: Option<i64>,
}

impl Caller {
    pub fn admin() -> Self {
        Caller { role: Role::Admin, organization_id: None }
    }

    pub fn scoped(role: Role, organization_id: i64) -> Self {
        Caller { role, organization_id: Some(organization_id) }
    }
}

/// What measurement records a caller may see.
///
/// Selected once per request. `ScopedToOrg` matches the caller's org
/// exactly; descendant organizations are NOT included for record queries (that
/// expansion exists only in the management visibility set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    Admin,
    ScopedToOrg(i64),
    NoAccess,
}

impl AccessPolicy {
    pub fn for_caller(caller: &Caller) -> Self {
        if caller.role == Role::Admin {
            return AccessPolicy::Admin;
        }
        match caller.organization_id {
            Some(org_id) => AccessPolicy::ScopedToOrg(org_id),
            None => AccessPolicy::NoAccess,
        }
    }

    /// True when the policy admits no records at all; callers short-circuit
    /// instead of issuing a query.
    pub fn denies_everything(&self) -> bool {
        matches!(self, AccessPolicy::NoAccess)
    }

    /// The organization clause to AND into a record query, if any.
    pub fn org_clause(&self) -> Option<i64> {
        match self {
            AccessPolicy::ScopedToOrg(id) => Some(*id),
            _ => None,
        }
    }
}
