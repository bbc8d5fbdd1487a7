//! Permission request lifecycle.
//!
//! A denied query can spawn a request for an admin to review. The
//! state machine is PENDING -> APPROVED | DENIED, plus EXPIRED for
//! approved temporary grants whose window has lapsed. Reviewed
//! requests are never re-reviewed; re-submitting while a matching
//! request is pending returns the existing one instead of piling up
//! duplicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditEvent, AuditEventType, AuditLogger, AuditOutcome};
use crate::errors::{GateError, Result};
use crate::rbac::{RbacAuthority, RbacRule};
use crate::role::Role;
use crate::store::PermissionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "PENDING"),
            RequestStatus::Approved => write!(f, "APPROVED"),
            RequestStatus::Denied => write!(f, "DENIED"),
            RequestStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    Low,
    Normal,
    High,
}

impl Default for RequestPriority {
    fn default() -> Self {
        RequestPriority::Normal
    }
}

/// Everything a caller supplies when asking for access. The rest of
/// the record (id, timestamps, status) is filled in on creation.
#[derive(Debug, Clone)]
pub struct RequestDraft {
    pub user_id: String,
    pub role: Role,
    pub requested_table: String,
    pub requested_columns: Option<Vec<String>>,
    pub original_question: Option<String>,
    pub blocked_sql: Option<String>,
    pub justification: Option<String>,
    pub priority: RequestPriority,
}

/// A persisted permission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: Uuid,
    pub user_id: String,
    pub role: Role,
    pub requested_table: String,
    pub requested_columns: Option<Vec<String>>,
    /// The natural-language question that led to the blocked query.
    pub original_question: Option<String>,
    pub blocked_sql: Option<String>,
    pub justification: Option<String>,
    pub status: RequestStatus,
    pub priority: RequestPriority,
    pub requested_at: DateTime<Utc>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
    /// Expiry of the grant attached on approval, if temporary.
    pub expires_at: Option<DateTime<Utc>>,
}

impl PermissionRequest {
    pub fn from_draft(draft: RequestDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: draft.user_id,
            role: draft.role,
            requested_table: draft.requested_table,
            requested_columns: draft.requested_columns,
            original_question: draft.original_question,
            blocked_sql: draft.blocked_sql,
            justification: draft.justification,
            status: RequestStatus::Pending,
            priority: draft.priority,
            requested_at: Utc::now(),
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
            expires_at: None,
        }
    }
}

pub struct PermissionWorkflow {
    store: Arc<dyn PermissionStore>,
    authority: Arc<RbacAuthority>,
    audit: Arc<AuditLogger>,
}

impl PermissionWorkflow {
    pub fn new(
        store: Arc<dyn PermissionStore>,
        authority: Arc<RbacAuthority>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            store,
            authority,
            audit,
        }
    }

    /// File a new request, unless the same (user, role, table) already
    /// has one pending, in which case that one is returned unchanged.
    pub fn create(&self, draft: RequestDraft) -> Result<PermissionRequest> {
        if let Some(existing) =
            self.store
                .find_pending(&draft.user_id, draft.role, &draft.requested_table)?
        {
            info!(
                "Pending request {} already covers {} / {} on {}",
                existing.id, existing.user_id, existing.role, existing.requested_table
            );
            return Ok(existing);
        }

        let request = PermissionRequest::from_draft(draft);
        self.store.insert_request(request.clone())?;
        info!(
            "Permission request {} filed by {} ({}) for {}",
            request.id, request.user_id, request.role, request.requested_table
        );
        self.audit.record(
            AuditCategory::Security,
            AuditEvent::new(AuditEventType::PermissionRequested, AuditOutcome::Success)
                .with_actor(request.user_id.clone())
                .with_table(request.requested_table.clone())
                .with_detail(json!({
                    "request_id": request.id,
                    "role": request.role,
                    "requested_columns": request.requested_columns,
                    "priority": request.priority,
                })),
        );
        Ok(request)
    }

    pub fn pending(&self) -> Result<Vec<PermissionRequest>> {
        self.store.requests_with_status(Some(RequestStatus::Pending))
    }

    pub fn requests(&self, status: Option<RequestStatus>) -> Result<Vec<PermissionRequest>> {
        self.store.requests_with_status(status)
    }

    pub fn request(&self, id: Uuid) -> Result<Option<PermissionRequest>> {
        self.store.request(id)
    }

    /// Approve a request: one atomic store mutation flips the request
    /// and upserts the granted rule, then the role's cached view is
    /// dropped so the grant takes effect on the next query.
    pub fn approve(
        &self,
        id: Uuid,
        reviewed_by: &str,
        review_notes: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<PermissionRequest> {
        let request = self
            .store
            .request(id)?
            .ok_or(GateError::RequestNotFound(id))?;

        let mut rule = RbacRule::new(request.role, request.requested_table.clone(), reviewed_by)
            .with_expiry(expires_at)
            .with_notes(format!("granted via permission request {id}"));
        if let Some(columns) = request.requested_columns.clone() {
            rule = rule.with_allowed_columns(columns);
        }
        rule.validate()?;

        let approved = self
            .store
            .approve_request(id, reviewed_by, review_notes, expires_at, rule)?;
        self.authority.invalidate(approved.role);

        info!(
            "Permission request {} approved by {} for {} on {}",
            id, reviewed_by, approved.user_id, approved.requested_table
        );
        self.audit.record(
            AuditCategory::Security,
            AuditEvent::new(AuditEventType::RequestApproved, AuditOutcome::Success)
                .with_actor(reviewed_by)
                .with_table(approved.requested_table.clone())
                .with_detail(json!({
                    "request_id": id,
                    "user_id": approved.user_id,
                    "role": approved.role,
                    "expires_at": approved.expires_at,
                })),
        );
        Ok(approved)
    }

    /// Deny a request. Denying an already-denied request is a no-op;
    /// denying an approved or expired one is an error.
    pub fn deny(
        &self,
        id: Uuid,
        reviewed_by: &str,
        review_notes: Option<String>,
    ) -> Result<PermissionRequest> {
        let mut request = self
            .store
            .request(id)?
            .ok_or(GateError::RequestNotFound(id))?;

        match request.status {
            RequestStatus::Denied => return Ok(request),
            RequestStatus::Approved | RequestStatus::Expired => {
                return Err(GateError::AlreadyReviewed(id, request.status.to_string()))
            }
            RequestStatus::Pending => {}
        }

        request.status = RequestStatus::Denied;
        request.reviewed_by = Some(reviewed_by.to_string());
        request.reviewed_at = Some(Utc::now());
        request.review_notes = review_notes;
        self.store.update_request(request.clone())?;

        info!("Permission request {} denied by {}", id, reviewed_by);
        self.audit.record(
            AuditCategory::Security,
            AuditEvent::new(AuditEventType::RequestDenied, AuditOutcome::Denied)
                .with_actor(reviewed_by)
                .with_table(request.requested_table.clone())
                .with_detail(json!({
                    "request_id": id,
                    "user_id": request.user_id,
                    "role": request.role,
                })),
        );
        Ok(request)
    }

    /// Lapse temporary grants whose expiry has passed.
    ///
    /// For each approved request with `expires_at <= now`, the request
    /// is marked EXPIRED and the matching rule is deactivated unless a
    /// later, still-valid rule has replaced it for the same
    /// (role, table). Returns the number of requests lapsed.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut lapsed = 0;
        for mut request in self
            .store
            .requests_with_status(Some(RequestStatus::Approved))?
        {
            let Some(expires_at) = request.expires_at else {
                continue;
            };
            if expires_at > now {
                continue;
            }

            // Only deactivate a rule that itself lapsed. A later
            // permanent (or longer-lived) rule for the same pair must
            // survive the sweep.
            let rule_lapsed = self
                .store
                .active_rules_for_role(request.role)?
                .into_iter()
                .any(|r| {
                    r.table == request.requested_table
                        && r.expires_at.is_some_and(|exp| exp <= now)
                });
            if rule_lapsed {
                self.authority
                    .deactivate_rule(request.role, &request.requested_table)?;
            }

            request.status = RequestStatus::Expired;
            self.store.update_request(request.clone())?;
            lapsed += 1;

            info!(
                "Temporary grant for {} on {} expired (request {})",
                request.role, request.requested_table, request.id
            );
            self.audit.record(
                AuditCategory::Security,
                AuditEvent::new(AuditEventType::GrantExpired, AuditOutcome::Success)
                    .with_actor(request.user_id.clone())
                    .with_table(request.requested_table.clone())
                    .with_detail(json!({
                        "request_id": request.id,
                        "role": request.role,
                        "expired_at": expires_at,
                    })),
            );
        }
        Ok(lapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditConfig;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn workflow() -> PermissionWorkflow {
        let store: Arc<dyn PermissionStore> = Arc::new(MemoryStore::new());
        let authority = Arc::new(RbacAuthority::new(store.clone()));
        let audit = Arc::new(AuditLogger::new(AuditConfig {
            log_to_file: false,
            ..AuditConfig::default()
        }));
        PermissionWorkflow::new(store, authority, audit)
    }

    fn draft(user: &str, role: Role, table: &str) -> RequestDraft {
        RequestDraft {
            user_id: user.to_string(),
            role,
            requested_table: table.to_string(),
            requested_columns: None,
            original_question: None,
            blocked_sql: None,
            justification: Some("needed for monthly report".to_string()),
            priority: RequestPriority::Normal,
        }
    }

    #[test]
    fn test_create_is_idempotent_while_pending() {
        let wf = workflow();
        let first = wf.create(draft("pontus", Role::CallCenter, "EGU.WSOUTSAV")).unwrap();
        let second = wf.create(draft("pontus", Role::CallCenter, "EGU.WSOUTSAV")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(wf.pending().unwrap().len(), 1);
    }

    #[test]
    fn test_same_table_different_user_is_separate() {
        let wf = workflow();
        wf.create(draft("pontus", Role::CallCenter, "EGU.WSOUTSAV")).unwrap();
        wf.create(draft("linda", Role::CustomerService, "EGU.WSOUTSAV")).unwrap();
        assert_eq!(wf.pending().unwrap().len(), 2);
    }

    #[test]
    fn test_approve_grants_access() {
        let wf = workflow();
        let request = wf.create(draft("pontus", Role::CallCenter, "EGU.WSOUTSAV")).unwrap();

        let approved = wf.approve(request.id, "admin", Some("ok".into()), None).unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(approved.reviewed_by.as_deref(), Some("admin"));

        let perms = wf.authority.resolve(Role::CallCenter);
        assert!(perms.allowed_tables.contains("EGU.WSOUTSAV"));
    }

    #[test]
    fn test_approve_with_columns_restricts_grant() {
        let wf = workflow();
        let mut d = draft("pontus", Role::CallCenter, "DCPO.KRKFAKTR");
        d.requested_columns = Some(vec!["KRFNR".into(), "KRDAF".into()]);
        let request = wf.create(d).unwrap();
        wf.approve(request.id, "admin", None, None).unwrap();

        let perms = wf.authority.resolve(Role::CallCenter);
        let restr = &perms.restrictions["DCPO.KRKFAKTR"];
        assert_eq!(
            restr.allowed_columns,
            Some(vec!["KRFNR".to_string(), "KRDAF".to_string()])
        );
    }

    #[test]
    fn test_deny_then_approve_fails() {
        let wf = workflow();
        let request = wf.create(draft("pontus", Role::CallCenter, "EGU.WSOUTSAV")).unwrap();
        wf.deny(request.id, "admin", Some("no".into())).unwrap();

        assert!(wf.approve(request.id, "admin", None, None).is_err());
        // A denied request no longer blocks a fresh one
        let fresh = wf.create(draft("pontus", Role::CallCenter, "EGU.WSOUTSAV")).unwrap();
        assert_ne!(fresh.id, request.id);
    }

    #[test]
    fn test_deny_is_idempotent() {
        let wf = workflow();
        let request = wf.create(draft("pontus", Role::CallCenter, "EGU.WSOUTSAV")).unwrap();
        wf.deny(request.id, "admin", None).unwrap();
        let again = wf.deny(request.id, "someone_else", None).unwrap();
        assert_eq!(again.reviewed_by.as_deref(), Some("admin"));
    }

    #[test]
    fn test_sweep_lapses_temporary_grant() {
        let wf = workflow();
        let request = wf.create(draft("pontus", Role::CallCenter, "EGU.WSOUTSAV")).unwrap();
        let expiry = Utc::now() + Duration::hours(1);
        wf.approve(request.id, "admin", None, Some(expiry)).unwrap();
        assert!(wf.authority.resolve(Role::CallCenter).allowed_tables.contains("EGU.WSOUTSAV"));

        // Nothing lapses before the expiry
        assert_eq!(wf.sweep(Utc::now()).unwrap(), 0);

        let lapsed = wf.sweep(expiry + Duration::seconds(1)).unwrap();
        assert_eq!(lapsed, 1);
        assert!(!wf.authority.resolve(Role::CallCenter).allowed_tables.contains("EGU.WSOUTSAV"));

        let stored = wf.request(request.id).unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Expired);
    }

    #[test]
    fn test_sweep_spares_superseding_permanent_rule() {
        let wf = workflow();
        let request = wf.create(draft("pontus", Role::CallCenter, "EGU.WSOUTSAV")).unwrap();
        let expiry = Utc::now() + Duration::hours(1);
        wf.approve(request.id, "admin", None, Some(expiry)).unwrap();

        // An admin later grants the table permanently
        wf.authority
            .add_rule(RbacRule::new(Role::CallCenter, "EGU.WSOUTSAV", "admin"))
            .unwrap();

        assert_eq!(wf.sweep(expiry + Duration::seconds(1)).unwrap(), 1);
        // The permanent rule survives; access remains
        assert!(wf.authority.resolve(Role::CallCenter).allowed_tables.contains("EGU.WSOUTSAV"));
    }

    #[test]
    fn test_approve_missing_request_errors() {
        let wf = workflow();
        assert!(matches!(
            wf.approve(Uuid::new_v4(), "admin", None, None),
            Err(GateError::RequestNotFound(_))
        ));
    }
}
