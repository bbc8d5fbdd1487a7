//! Role model and the fixed username->role table.
//!
//! Roles are a closed set; user identity is a hardcoded mapping rather
//! than a real identity system. Making it dynamic is out of scope.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::GateError;

/// Business roles recognized by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full table access; still subject to column masking rules.
    Executive,
    Finance,
    Logistics,
    CustomerService,
    CallCenter,
    UnitManager,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Executive,
        Role::Finance,
        Role::Logistics,
        Role::CustomerService,
        Role::CallCenter,
        Role::UnitManager,
    ];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Executive => write!(f, "executive"),
            Role::Finance => write!(f, "finance"),
            Role::Logistics => write!(f, "logistics"),
            Role::CustomerService => write!(f, "customer_service"),
            Role::CallCenter => write!(f, "call_center"),
            Role::UnitManager => write!(f, "unit_manager"),
        }
    }
}

impl FromStr for Role {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, GateError> {
        match s.to_lowercase().as_str() {
            // "ceo" is the legacy spelling still used by older clients
            "executive" | "ceo" => Ok(Role::Executive),
            "finance" => Ok(Role::Finance),
            "logistics" => Ok(Role::Logistics),
            "customer_service" => Ok(Role::CustomerService),
            "call_center" => Ok(Role::CallCenter),
            "unit_manager" => Ok(Role::UnitManager),
            other => Err(GateError::UnknownRole(other.to_string())),
        }
    }
}

/// A resolved user: username plus assigned role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub username: String,
    pub role: Role,
}

impl UserAccount {
    fn new(username: &str, role: Role) -> Self {
        Self {
            username: username.to_string(),
            role,
        }
    }
}

/// Resolve a username to its account. Case-insensitive.
pub fn lookup_user(username: &str) -> Option<UserAccount> {
    match username.to_lowercase().as_str() {
        "harold" => Some(UserAccount::new("harold", Role::Executive)),
        "lars" => Some(UserAccount::new("lars", Role::Finance)),
        "peter" => Some(UserAccount::new("peter", Role::Logistics)),
        "linda" => Some(UserAccount::new("linda", Role::CustomerService)),
        "pontus" => Some(UserAccount::new("pontus", Role::CallCenter)),
        "maria" => Some(UserAccount::new("maria", Role::UnitManager)),
        _ => None,
    }
}
