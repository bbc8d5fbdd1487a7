//! Table and column enforcement against a role's effective
//! permissions.
//!
//! Runs after structural validation, so the statement is known to be a
//! bounded SELECT over allow-listed tables. This layer answers the
//! narrower question: may THIS role see these tables and columns?
//! Column checks are token-based, the same tokenizer as validation, so
//! a blocked name inside a string literal does not trip them.

use crate::rbac::{table_columns, RolePermissions};
use crate::validator::{has_wildcard, identifier_tokens, NormalizedQuery};

/// Outcome of the permission check for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessCheck {
    Granted,
    /// The role may not read this table at all.
    TableDenied { table: String },
    /// The table is readable but the query touches masked columns.
    ColumnDenied {
        table: String,
        columns: Vec<String>,
    },
}

/// Check a validated query against a role's permissions. Tables are
/// checked before columns; the first violation wins.
pub fn check_access(perms: &RolePermissions, query: &NormalizedQuery) -> AccessCheck {
    for table in &query.tables {
        if !perms.allowed_tables.contains(table) {
            return AccessCheck::TableDenied {
                table: table.clone(),
            };
        }
    }

    let referenced = identifier_tokens(&query.sql);
    let wildcard = has_wildcard(&query.sql);

    for table in &query.tables {
        let Some(restrictions) = perms.restrictions.get(table) else {
            continue;
        };

        // The columns of this table the role must not see.
        let masked: Vec<String> = match (&restrictions.allowed_columns, &restrictions.blocked_columns) {
            (Some(allowed), _) => table_columns(table)
                .iter()
                .filter(|c| !allowed.iter().any(|a| a.eq_ignore_ascii_case(c)))
                .map(|c| c.to_string())
                .collect(),
            (None, Some(blocked)) => blocked.clone(),
            (None, None) => Vec::new(),
        };
        if masked.is_empty() {
            continue;
        }

        if wildcard {
            // `SELECT *` would surface every masked column.
            return AccessCheck::ColumnDenied {
                table: table.clone(),
                columns: masked,
            };
        }

        let touched: Vec<String> = masked
            .iter()
            .filter(|c| referenced.contains(&c.to_uppercase()))
            .cloned()
            .collect();
        if !touched.is_empty() {
            return AccessCheck::ColumnDenied {
                table: table.clone(),
                columns: touched,
            };
        }
    }

    AccessCheck::Granted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::RbacAuthority;
    use crate::role::Role;
    use crate::store::MemoryStore;
    use crate::validator::QueryValidator;
    use std::sync::Arc;

    fn check(role: Role, sql: &str) -> AccessCheck {
        let authority = RbacAuthority::new(Arc::new(MemoryStore::new()));
        let query = QueryValidator::new().validate(sql, 100).unwrap();
        check_access(&authority.resolve(role), &query)
    }

    #[test]
    fn test_executive_sees_everything() {
        assert_eq!(
            check(Role::Executive, "SELECT OHBLF FROM DCPO.OHKORDHR"),
            AccessCheck::Granted
        );
    }

    #[test]
    fn test_table_denied_for_narrow_role() {
        assert_eq!(
            check(Role::CallCenter, "SELECT KRFNR FROM DCPO.KRKFAKTR"),
            AccessCheck::TableDenied {
                table: "DCPO.KRKFAKTR".to_string()
            }
        );
    }

    #[test]
    fn test_blocked_column_denied() {
        // Logistics must not see order pricing
        let outcome = check(Role::Logistics, "SELECT OHONR, OHBLF FROM DCPO.OHKORDHR");
        assert_eq!(
            outcome,
            AccessCheck::ColumnDenied {
                table: "DCPO.OHKORDHR".to_string(),
                columns: vec!["OHBLF".to_string()],
            }
        );
    }

    #[test]
    fn test_unblocked_columns_pass() {
        assert_eq!(
            check(Role::Logistics, "SELECT OHONR, OHDAO FROM DCPO.OHKORDHR"),
            AccessCheck::Granted
        );
    }

    #[test]
    fn test_blocked_name_in_string_literal_passes() {
        assert_eq!(
            check(
                Role::Logistics,
                "SELECT OHONR FROM DCPO.OHKORDHR WHERE OHSLJ = 'OHBLF'"
            ),
            AccessCheck::Granted
        );
    }

    #[test]
    fn test_wildcard_over_restricted_table_denied() {
        let outcome = check(Role::Logistics, "SELECT * FROM DCPO.OHKORDHR");
        assert!(matches!(outcome, AccessCheck::ColumnDenied { .. }));
    }

    #[test]
    fn test_count_star_is_not_a_wildcard_projection() {
        assert_eq!(
            check(Role::Logistics, "SELECT COUNT(*) FROM DCPO.OHKORDHR"),
            AccessCheck::Granted
        );
    }

    #[test]
    fn test_arithmetic_star_is_not_a_wildcard_projection() {
        // Multiplication over unblocked columns must not read as *
        assert_eq!(
            check(Role::Logistics, "SELECT ORKVB * ORKVL FROM DCPO.ORKORDRR"),
            AccessCheck::Granted
        );
    }

    #[test]
    fn test_qualified_wildcard_still_denied() {
        let outcome = check(Role::Logistics, "SELECT O.* FROM DCPO.OHKORDHR O");
        assert!(matches!(outcome, AccessCheck::ColumnDenied { .. }));
    }

    #[test]
    fn test_wildcard_over_unrestricted_table_passes() {
        assert_eq!(
            check(Role::Logistics, "SELECT * FROM DCPO.LHLEVHUR"),
            AccessCheck::Granted
        );
    }

    #[test]
    fn test_allowed_columns_grant_masks_the_rest() {
        let authority = RbacAuthority::new(Arc::new(MemoryStore::new()));
        authority
            .add_rule(
                crate::rbac::RbacRule::new(Role::CallCenter, "DCPO.KRKFAKTR", "admin")
                    .with_allowed_columns(vec!["KRFNR".into(), "KRDAF".into()]),
            )
            .unwrap();
        let perms = authority.resolve(Role::CallCenter);

        let validator = QueryValidator::new();
        let ok = validator
            .validate("SELECT KRFNR, KRDAF FROM DCPO.KRKFAKTR", 100)
            .unwrap();
        assert_eq!(check_access(&perms, &ok), AccessCheck::Granted);

        let bad = validator
            .validate("SELECT KRFNR, KRBLF FROM DCPO.KRKFAKTR", 100)
            .unwrap();
        assert_eq!(
            check_access(&perms, &bad),
            AccessCheck::ColumnDenied {
                table: "DCPO.KRKFAKTR".to_string(),
                columns: vec!["KRBLF".to_string()],
            }
        );
    }

    #[test]
    fn test_join_checks_both_tables() {
        let outcome = check(
            Role::CallCenter,
            "SELECT K.KHFKN, O.OHBLF FROM DCPO.KHKNDHUR K JOIN DCPO.OHKORDHR O ON K.KHKNR = O.OHKNR",
        );
        assert!(matches!(outcome, AccessCheck::ColumnDenied { table, .. } if table == "DCPO.OHKORDHR"));
    }
}
