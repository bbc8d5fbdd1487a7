//! Role-based access control for the STYR gateway.
//!
//! Effective permission for a (role, table) pair is the union of the
//! hand-authored static baseline and the active dynamic rules loaded
//! from the persistent store. The merged view is cached per role and
//! invalidated synchronously whenever a rule changes, so a deactivated
//! rule is never served.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditEvent, AuditEventType, AuditLogger, AuditOutcome};
use crate::errors::{GateError, Result};
use crate::role::Role;
use crate::store::PermissionStore;
use crate::validator::ALLOWED_TABLES;

/// A dynamic, admin-editable access rule.
///
/// Static baseline rules are seeded in code and never deleted; these
/// rows are additive overrides. At most one rule per (role, table) is
/// active at a time; an upsert deactivates and supersedes the previous
/// rule so history stays auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbacRule {
    pub id: Uuid,
    pub role: Role,
    pub table: String,
    /// If set, only these columns are visible.
    pub allowed_columns: Option<Vec<String>>,
    /// If set, all columns except these are visible.
    pub blocked_columns: Option<Vec<String>>,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Set for temporary grants; the expiry sweep deactivates the rule
    /// once this passes.
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl RbacRule {
    pub fn new(role: Role, table: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            table: table.into(),
            allowed_columns: None,
            blocked_columns: None,
            notes: None,
            created_by: created_by.into(),
            created_at: Utc::now(),
            expires_at: None,
            active: true,
        }
    }

    pub fn with_allowed_columns(mut self, columns: Vec<String>) -> Self {
        self.allowed_columns = Some(columns);
        self
    }

    pub fn with_blocked_columns(mut self, columns: Vec<String>) -> Self {
        self.blocked_columns = Some(columns);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Reject rules whose column lists restrict the table to nothing.
    pub fn validate(&self) -> Result<()> {
        if matches!(&self.allowed_columns, Some(cols) if cols.is_empty()) {
            return Err(GateError::InvalidRule(format!(
                "rule for {} on {} allows no columns at all",
                self.role, self.table
            )));
        }
        Ok(())
    }
}

/// Column visibility for a single table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRestrictions {
    pub allowed_columns: Option<Vec<String>>,
    pub blocked_columns: Option<Vec<String>>,
}

/// The merged, effective permissions for one role.
#[derive(Debug, Clone, Default)]
pub struct RolePermissions {
    pub allowed_tables: HashSet<String>,
    pub restrictions: HashMap<String, ColumnRestrictions>,
}

/// Known columns per table, used when a rule names `allowed_columns`
/// and enforcement has to decide which referenced identifiers are
/// columns of that table.
pub fn table_columns(table: &str) -> &'static [&'static str] {
    match table {
        "DCPO.KHKNDHUR" => &[
            "KHKNR", "KHFKN", "KHTEL", "KHFA1", "KHFA2", "KHFA3", "KHFA4", "KHKGÄ", "KHSTS",
            "KHPNR", "KHORGNR", "KHBLE", "KHSAL",
        ],
        "DCPO.OHKORDHR" => &["OHONR", "OHKNR", "OHDAO", "OHDAL", "OHOST", "OHBLF", "OHVAL", "OHSLJ"],
        "DCPO.ORKORDRR" => &["ORONR", "ORORN", "ORANR", "ORKVB", "ORKVL", "ORPRS", "ORRAB"],
        "DCPO.KRKFAKTR" => &["KRFNR", "KRKNR", "KRDAF", "KRDFF", "KRBLF"],
        "DCPO.KIINBETR" => &["KIKNR", "KIDAT", "KIBEL"],
        "DCPO.AHARTHUR" => &["AHANR", "AHBES", "AHLAG"],
        "DCPO.LHLEVHUR" => &["LHLNR", "LHBEN", "LHTEL"],
        "DCPO.IHIORDHR" => &["IHONR", "IHLNR", "IHDAO", "IHOST"],
        "DCPO.IRIORDRR" => &["IRONR", "IRORN", "IRANR", "IRKVB", "IRIPR"],
        _ => &[],
    }
}

/// Static baseline: (table, blocked columns) per role.
fn baseline(role: Role) -> Vec<(&'static str, &'static [&'static str])> {
    const NONE: &[&str] = &[];
    match role {
        Role::Executive => ALLOWED_TABLES.iter().map(|t| (*t, NONE)).collect(),
        Role::Finance => vec![
            ("DCPO.KHKNDHUR", NONE),
            ("DCPO.KRKFAKTR", NONE),
            ("DCPO.KIINBETR", NONE),
            ("DCPO.OHKORDHR", NONE),
            ("DCPO.ORKORDRR", NONE),
            ("DCPO.IHIORDHR", NONE),
            ("DCPO.IRIORDRR", NONE),
            ("DCPO.LHLEVHUR", NONE),
            ("EGU.WSOUTSAV", NONE),
        ],
        Role::Logistics => vec![
            // Order fulfillment and inventory, without pricing
            ("DCPO.OHKORDHR", &["OHBLF", "OHBLM", "OHFAV", "OHBLOU"] as &[&str]),
            ("DCPO.ORKORDRR", &["ORPRS", "ORRAB", "OROMO"]),
            ("DCPO.LHLEVHUR", NONE),
            ("DCPO.IHIORDHR", NONE),
            ("DCPO.IRIORDRR", &["IRIPR", "IRRPO"]),
            ("DCPO.AHARTHUR", NONE),
            ("EGU.AYARINFR", NONE),
            ("DCPO.KHKNDHUR", &["KHKGÄ", "KHBLE", "KHSAL", "KHRPF"]),
        ],
        Role::CustomerService => vec![
            ("DCPO.KHKNDHUR", &["KHKGÄ", "KHBLE", "KHSAL", "KHRPF"] as &[&str]),
            ("DCPO.OHKORDHR", NONE),
            ("DCPO.ORKORDRR", NONE),
            ("DCPO.AHARTHUR", NONE),
            ("EGU.AYARINFR", NONE),
            ("DCPO.KRKFAKTR", &["KRBLF", "KRBLB", "KRBKR"]),
        ],
        Role::CallCenter => vec![
            (
                "DCPO.KHKNDHUR",
                &["KHKGÄ", "KHBLE", "KHSAL", "KHRPF", "KHFKR", "KHPGR", "KHPNR", "KHORGNR"]
                    as &[&str],
            ),
            ("DCPO.OHKORDHR", &["OHBLF", "OHBLM", "OHFAV", "OHBLOU"]),
            ("DCPO.AHARTHUR", NONE),
        ],
        Role::UnitManager => vec![
            ("DCPO.KHKNDHUR", &["KHKGÄ"] as &[&str]),
            ("DCPO.OHKORDHR", NONE),
            ("DCPO.ORKORDRR", NONE),
            ("EGU.WSOUTSAV", NONE),
            ("DCPO.AHARTHUR", NONE),
        ],
    }
}

/// Merges the static baseline with dynamic rules and caches the
/// result per role.
pub struct RbacAuthority {
    store: Arc<dyn PermissionStore>,
    cache: RwLock<HashMap<Role, Arc<RolePermissions>>>,
    audit: Option<Arc<AuditLogger>>,
}

impl RbacAuthority {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            audit: None,
        }
    }

    /// Attach an audit logger; rule changes through this authority
    /// are then recorded as audit events.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Effective permissions for a role. Cached; the cache is dropped
    /// synchronously by `add_rule` / `deactivate_rule`.
    pub fn resolve(&self, role: Role) -> Arc<RolePermissions> {
        if let Some(perms) = self.cache.read().get(&role) {
            return perms.clone();
        }
        // Fill the cache while holding the write lock. Invalidation
        // takes the same lock only after its store mutation has
        // committed, so a rule change can never land between the
        // store read and the insert and leave a stale entry behind.
        let mut cache = self.cache.write();
        if let Some(perms) = cache.get(&role) {
            return perms.clone();
        }
        let perms = Arc::new(self.compute(role));
        cache.insert(role, perms.clone());
        perms
    }

    fn compute(&self, role: Role) -> RolePermissions {
        let mut perms = RolePermissions::default();
        for (table, blocked) in baseline(role) {
            perms.allowed_tables.insert(table.to_string());
            if !blocked.is_empty() {
                perms.restrictions.insert(
                    table.to_string(),
                    ColumnRestrictions {
                        allowed_columns: None,
                        blocked_columns: Some(blocked.iter().map(|c| c.to_string()).collect()),
                    },
                );
            }
        }

        match self.store.active_rules_for_role(role) {
            Ok(rules) => {
                let now = Utc::now();
                for rule in rules {
                    // A lapsed temporary grant is ignored even before
                    // the expiry sweep flips it inactive.
                    if rule.expires_at.is_some_and(|exp| exp <= now) {
                        continue;
                    }
                    perms.allowed_tables.insert(rule.table.clone());
                    if rule.allowed_columns.is_some() || rule.blocked_columns.is_some() {
                        perms.restrictions.insert(
                            rule.table.clone(),
                            ColumnRestrictions {
                                allowed_columns: rule.allowed_columns.clone(),
                                blocked_columns: rule.blocked_columns.clone(),
                            },
                        );
                    } else {
                        // An unrestricted dynamic grant supersedes the
                        // baseline's column restrictions for its table.
                        perms.restrictions.remove(&rule.table);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Dynamic RBAC rules unavailable for {}: {}; serving static baseline",
                    role, e
                );
            }
        }
        perms
    }

    /// Upsert a rule keyed on (role, table). An existing active rule
    /// is deactivated and superseded, never merged.
    pub fn add_rule(&self, rule: RbacRule) -> Result<RbacRule> {
        rule.validate()?;
        let stored = self.store.upsert_rule(rule)?;
        self.invalidate(stored.role);
        info!(
            "RBAC rule added for {} on {} by {}",
            stored.role, stored.table, stored.created_by
        );
        if let Some(audit) = &self.audit {
            audit.record(
                AuditCategory::Security,
                AuditEvent::new(AuditEventType::RuleAdded, AuditOutcome::Success)
                    .with_actor(stored.created_by.clone())
                    .with_table(stored.table.clone())
                    .with_detail(serde_json::json!({
                        "rule_id": stored.id,
                        "role": stored.role,
                        "allowed_columns": stored.allowed_columns,
                        "blocked_columns": stored.blocked_columns,
                        "expires_at": stored.expires_at,
                    })),
            );
        }
        Ok(stored)
    }

    /// Deactivate the active rule for (role, table), if any.
    pub fn deactivate_rule(&self, role: Role, table: &str) -> Result<bool> {
        let changed = self.store.deactivate_rule(role, table)?;
        if changed {
            self.invalidate(role);
            info!("RBAC rule deactivated for {} on {}", role, table);
            if let Some(audit) = &self.audit {
                audit.record(
                    AuditCategory::Security,
                    AuditEvent::new(AuditEventType::RuleDeactivated, AuditOutcome::Success)
                        .with_table(table)
                        .with_detail(serde_json::json!({ "role": role })),
                );
            }
        }
        Ok(changed)
    }

    /// Drop the cached view for a role. Called by the permission
    /// workflow after an approval commits.
    pub fn invalidate(&self, role: Role) {
        self.cache.write().remove(&role);
    }

    pub fn store(&self) -> &Arc<dyn PermissionStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn authority() -> RbacAuthority {
        RbacAuthority::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_executive_baseline_covers_all_tables() {
        let auth = authority();
        let perms = auth.resolve(Role::Executive);
        for table in ALLOWED_TABLES {
            assert!(perms.allowed_tables.contains(table));
        }
        assert!(perms.restrictions.is_empty());
    }

    #[test]
    fn test_call_center_baseline_is_narrow() {
        let auth = authority();
        let perms = auth.resolve(Role::CallCenter);
        assert!(perms.allowed_tables.contains("DCPO.KHKNDHUR"));
        assert!(!perms.allowed_tables.contains("DCPO.KRKFAKTR"));
        let restr = &perms.restrictions["DCPO.KHKNDHUR"];
        assert!(restr
            .blocked_columns
            .as_ref()
            .unwrap()
            .contains(&"KHPNR".to_string()));
    }

    #[test]
    fn test_dynamic_rule_extends_baseline() {
        let auth = authority();
        assert!(!auth.resolve(Role::CallCenter).allowed_tables.contains("EGU.WSOUTSAV"));

        auth.add_rule(RbacRule::new(Role::CallCenter, "EGU.WSOUTSAV", "admin"))
            .unwrap();
        assert!(auth.resolve(Role::CallCenter).allowed_tables.contains("EGU.WSOUTSAV"));
    }

    #[test]
    fn test_cache_invalidated_on_deactivate() {
        let auth = authority();
        auth.add_rule(RbacRule::new(Role::Logistics, "DCPO.KRKFAKTR", "admin"))
            .unwrap();
        assert!(auth.resolve(Role::Logistics).allowed_tables.contains("DCPO.KRKFAKTR"));

        assert!(auth.deactivate_rule(Role::Logistics, "DCPO.KRKFAKTR").unwrap());
        // Must not serve the deactivated rule from cache
        assert!(!auth.resolve(Role::Logistics).allowed_tables.contains("DCPO.KRKFAKTR"));
    }

    #[test]
    fn test_upsert_supersedes_previous_rule() {
        let auth = authority();
        auth.add_rule(
            RbacRule::new(Role::CallCenter, "DCPO.KIINBETR", "admin")
                .with_blocked_columns(vec!["KIBEL".into()]),
        )
        .unwrap();
        auth.add_rule(RbacRule::new(Role::CallCenter, "DCPO.KIINBETR", "admin"))
            .unwrap();

        let active: Vec<_> = auth
            .store()
            .active_rules_for_role(Role::CallCenter)
            .unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].blocked_columns.is_none());

        // History is kept: the superseded row still exists, inactive
        let all = auth.store().all_rules().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|r| r.active).count(), 1);
    }

    #[test]
    fn test_empty_allowed_columns_rejected() {
        let auth = authority();
        let rule = RbacRule::new(Role::Finance, "DCPO.AHARTHUR", "admin")
            .with_allowed_columns(Vec::new());
        assert!(auth.add_rule(rule).is_err());
    }

    #[test]
    fn test_expired_rule_not_served() {
        let auth = authority();
        auth.add_rule(
            RbacRule::new(Role::CallCenter, "EGU.WSOUTSAV", "admin")
                .with_expiry(Some(Utc::now() - Duration::hours(1))),
        )
        .unwrap();
        assert!(!auth.resolve(Role::CallCenter).allowed_tables.contains("EGU.WSOUTSAV"));
    }

    #[test]
    fn test_rule_changes_are_audited() {
        use crate::audit::{AuditConfig, AuditEventType};

        let audit = Arc::new(AuditLogger::new(AuditConfig {
            log_to_file: false,
            ..AuditConfig::default()
        }));
        let auth = RbacAuthority::new(Arc::new(MemoryStore::new())).with_audit(audit.clone());

        auth.add_rule(RbacRule::new(Role::CallCenter, "EGU.WSOUTSAV", "admin"))
            .unwrap();
        let added = audit.events_of_type(AuditEventType::RuleAdded);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].actor.as_deref(), Some("admin"));
        assert_eq!(added[0].table.as_deref(), Some("EGU.WSOUTSAV"));

        auth.deactivate_rule(Role::CallCenter, "EGU.WSOUTSAV").unwrap();
        assert_eq!(audit.events_of_type(AuditEventType::RuleDeactivated).len(), 1);

        // Deactivating nothing records nothing
        auth.deactivate_rule(Role::CallCenter, "EGU.WSOUTSAV").unwrap();
        assert_eq!(audit.events_of_type(AuditEventType::RuleDeactivated).len(), 1);
    }

    /// Store whose first rule read parks on a barrier, so a rule
    /// change can be interleaved mid-resolve.
    struct StallingStore {
        inner: MemoryStore,
        gate: std::sync::Barrier,
        armed: std::sync::atomic::AtomicBool,
    }

    impl StallingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                gate: std::sync::Barrier::new(2),
                armed: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl PermissionStore for StallingStore {
        fn active_rules_for_role(&self, role: Role) -> crate::errors::Result<Vec<RbacRule>> {
            let rules = self.inner.active_rules_for_role(role);
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                self.gate.wait();
            }
            rules
        }

        fn all_rules(&self) -> crate::errors::Result<Vec<RbacRule>> {
            self.inner.all_rules()
        }

        fn upsert_rule(&self, rule: RbacRule) -> crate::errors::Result<RbacRule> {
            self.inner.upsert_rule(rule)
        }

        fn deactivate_rule(&self, role: Role, table: &str) -> crate::errors::Result<bool> {
            self.inner.deactivate_rule(role, table)
        }

        fn insert_request(
            &self,
            request: crate::workflow::PermissionRequest,
        ) -> crate::errors::Result<()> {
            self.inner.insert_request(request)
        }

        fn update_request(
            &self,
            request: crate::workflow::PermissionRequest,
        ) -> crate::errors::Result<()> {
            self.inner.update_request(request)
        }

        fn request(
            &self,
            id: uuid::Uuid,
        ) -> crate::errors::Result<Option<crate::workflow::PermissionRequest>> {
            self.inner.request(id)
        }

        fn requests_with_status(
            &self,
            status: Option<crate::workflow::RequestStatus>,
        ) -> crate::errors::Result<Vec<crate::workflow::PermissionRequest>> {
            self.inner.requests_with_status(status)
        }

        fn find_pending(
            &self,
            user_id: &str,
            role: Role,
            table: &str,
        ) -> crate::errors::Result<Option<crate::workflow::PermissionRequest>> {
            self.inner.find_pending(user_id, role, table)
        }

        fn approve_request(
            &self,
            id: uuid::Uuid,
            reviewed_by: &str,
            review_notes: Option<String>,
            expires_at: Option<DateTime<Utc>>,
            rule: RbacRule,
        ) -> crate::errors::Result<crate::workflow::PermissionRequest> {
            self.inner
                .approve_request(id, reviewed_by, review_notes, expires_at, rule)
        }
    }

    #[test]
    fn test_deactivation_during_resolve_is_not_cached_over() {
        let store = Arc::new(StallingStore::new());
        store
            .upsert_rule(RbacRule::new(Role::CallCenter, "EGU.WSOUTSAV", "admin"))
            .unwrap();
        let auth = Arc::new(RbacAuthority::new(store.clone()));

        // Park the resolver after it has read the pre-deactivation
        // rule set but before it fills the cache.
        store.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        let resolver = {
            let auth = auth.clone();
            std::thread::spawn(move || auth.resolve(Role::CallCenter))
        };
        store.gate.wait();

        // The deactivation commits while the resolver is in flight;
        // its invalidation must win over the in-flight cache fill.
        auth.deactivate_rule(Role::CallCenter, "EGU.WSOUTSAV").unwrap();
        resolver.join().unwrap();

        assert!(!auth
            .resolve(Role::CallCenter)
            .allowed_tables
            .contains("EGU.WSOUTSAV"));
    }

    #[test]
    fn test_unrestricted_grant_lifts_baseline_column_block() {
        let auth = authority();
        assert!(auth
            .resolve(Role::Logistics)
            .restrictions
            .contains_key("DCPO.OHKORDHR"));

        auth.add_rule(RbacRule::new(Role::Logistics, "DCPO.OHKORDHR", "admin"))
            .unwrap();
        assert!(!auth
            .resolve(Role::Logistics)
            .restrictions
            .contains_key("DCPO.OHKORDHR"));
    }
}
