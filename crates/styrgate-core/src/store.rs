//! Persistent storage for dynamic RBAC rules and permission requests.
//!
//! This is the only blocking I/O on the authorization path. The trait
//! exposes the operation set the workflow and authority need, plus an
//! atomic `approve_request` that flips a request and upserts the
//! granted rule under a single lock and a single persist, so a crash
//! cannot leave an approved request without its rule.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{GateError, Result};
use crate::rbac::RbacRule;
use crate::role::Role;
use crate::workflow::{PermissionRequest, RequestStatus};

pub trait PermissionStore: Send + Sync {
    fn active_rules_for_role(&self, role: Role) -> Result<Vec<RbacRule>>;
    fn all_rules(&self) -> Result<Vec<RbacRule>>;
    /// Deactivates any active rule for the same (role, table) before
    /// inserting, keeping at most one active rule per pair.
    fn upsert_rule(&self, rule: RbacRule) -> Result<RbacRule>;
    fn deactivate_rule(&self, role: Role, table: &str) -> Result<bool>;

    fn insert_request(&self, request: PermissionRequest) -> Result<()>;
    fn update_request(&self, request: PermissionRequest) -> Result<()>;
    fn request(&self, id: Uuid) -> Result<Option<PermissionRequest>>;
    fn requests_with_status(&self, status: Option<RequestStatus>)
        -> Result<Vec<PermissionRequest>>;
    fn find_pending(&self, user_id: &str, role: Role, table: &str)
        -> Result<Option<PermissionRequest>>;

    /// Atomically mark the request approved and upsert the granted
    /// rule. Approving an already-approved request is a no-op that
    /// returns the stored record.
    fn approve_request(
        &self,
        id: Uuid,
        reviewed_by: &str,
        review_notes: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        rule: RbacRule,
    ) -> Result<PermissionRequest>;
}

/// The full persisted document. Small enough to rewrite whole on each
/// mutation.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    rules: Vec<RbacRule>,
    requests: Vec<PermissionRequest>,
}

impl StoreDocument {
    fn upsert_rule(&mut self, mut rule: RbacRule) -> RbacRule {
        for existing in self.rules.iter_mut() {
            if existing.active && existing.role == rule.role && existing.table == rule.table {
                existing.active = false;
            }
        }
        rule.active = true;
        self.rules.push(rule.clone());
        rule
    }

    fn deactivate_rule(&mut self, role: Role, table: &str) -> bool {
        let mut changed = false;
        for rule in self.rules.iter_mut() {
            if rule.active && rule.role == role && rule.table == table {
                rule.active = false;
                changed = true;
            }
        }
        changed
    }

    fn approve_request(
        &mut self,
        id: Uuid,
        reviewed_by: &str,
        review_notes: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        rule: RbacRule,
    ) -> Result<PermissionRequest> {
        let request = self
            .requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(GateError::RequestNotFound(id))?;

        match request.status {
            RequestStatus::Approved => return Ok(request.clone()),
            RequestStatus::Denied | RequestStatus::Expired => {
                return Err(GateError::AlreadyReviewed(id, request.status.to_string()))
            }
            RequestStatus::Pending => {}
        }

        request.status = RequestStatus::Approved;
        request.reviewed_by = Some(reviewed_by.to_string());
        request.reviewed_at = Some(Utc::now());
        request.review_notes = review_notes;
        request.expires_at = expires_at;
        let approved = request.clone();

        self.upsert_rule(rule);
        Ok(approved)
    }
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PermissionStore for MemoryStore {
    fn active_rules_for_role(&self, role: Role) -> Result<Vec<RbacRule>> {
        Ok(self
            .state
            .read()
            .rules
            .iter()
            .filter(|r| r.active && r.role == role)
            .cloned()
            .collect())
    }

    fn all_rules(&self) -> Result<Vec<RbacRule>> {
        Ok(self.state.read().rules.clone())
    }

    fn upsert_rule(&self, rule: RbacRule) -> Result<RbacRule> {
        Ok(self.state.write().upsert_rule(rule))
    }

    fn deactivate_rule(&self, role: Role, table: &str) -> Result<bool> {
        Ok(self.state.write().deactivate_rule(role, table))
    }

    fn insert_request(&self, request: PermissionRequest) -> Result<()> {
        self.state.write().requests.push(request);
        Ok(())
    }

    fn update_request(&self, request: PermissionRequest) -> Result<()> {
        let mut state = self.state.write();
        match state.requests.iter_mut().find(|r| r.id == request.id) {
            Some(slot) => {
                *slot = request;
                Ok(())
            }
            None => Err(GateError::RequestNotFound(request.id)),
        }
    }

    fn request(&self, id: Uuid) -> Result<Option<PermissionRequest>> {
        Ok(self.state.read().requests.iter().find(|r| r.id == id).cloned())
    }

    fn requests_with_status(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<PermissionRequest>> {
        Ok(self
            .state
            .read()
            .requests
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    fn find_pending(
        &self,
        user_id: &str,
        role: Role,
        table: &str,
    ) -> Result<Option<PermissionRequest>> {
        Ok(self
            .state
            .read()
            .requests
            .iter()
            .find(|r| {
                r.status == RequestStatus::Pending
                    && r.user_id == user_id
                    && r.role == role
                    && r.requested_table == table
            })
            .cloned())
    }

    fn approve_request(
        &self,
        id: Uuid,
        reviewed_by: &str,
        review_notes: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        rule: RbacRule,
    ) -> Result<PermissionRequest> {
        self.state
            .write()
            .approve_request(id, reviewed_by, review_notes, expires_at, rule)
    }
}

/// JSON-file-backed store. The whole document is rewritten on each
/// successful mutation; reads are served from memory.
pub struct FileStore {
    path: PathBuf,
    state: RwLock<StoreDocument>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let doc: StoreDocument = serde_json::from_str(&raw)?;
            debug!(
                "Loaded permission store from {}: {} rules, {} requests",
                path.display(),
                doc.rules.len(),
                doc.requests.len()
            );
            doc
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            info!("Creating new permission store at {}", path.display());
            StoreDocument::default()
        };
        let store = Self {
            path,
            state: RwLock::new(state),
        };
        store.persist(&store.state.read())?;
        Ok(store)
    }

    fn persist(&self, state: &StoreDocument) -> Result<()> {
        let raw = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, raw)?;
        Ok(())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StoreDocument) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        let out = f(&mut state)?;
        self.persist(&state)?;
        Ok(out)
    }
}

impl PermissionStore for FileStore {
    fn active_rules_for_role(&self, role: Role) -> Result<Vec<RbacRule>> {
        Ok(self
            .state
            .read()
            .rules
            .iter()
            .filter(|r| r.active && r.role == role)
            .cloned()
            .collect())
    }

    fn all_rules(&self) -> Result<Vec<RbacRule>> {
        Ok(self.state.read().rules.clone())
    }

    fn upsert_rule(&self, rule: RbacRule) -> Result<RbacRule> {
        self.mutate(|state| Ok(state.upsert_rule(rule)))
    }

    fn deactivate_rule(&self, role: Role, table: &str) -> Result<bool> {
        self.mutate(|state| Ok(state.deactivate_rule(role, table)))
    }

    fn insert_request(&self, request: PermissionRequest) -> Result<()> {
        self.mutate(|state| {
            state.requests.push(request);
            Ok(())
        })
    }

    fn update_request(&self, request: PermissionRequest) -> Result<()> {
        self.mutate(|state| {
            match state.requests.iter_mut().find(|r| r.id == request.id) {
                Some(slot) => {
                    *slot = request;
                    Ok(())
                }
                None => Err(GateError::RequestNotFound(request.id)),
            }
        })
    }

    fn request(&self, id: Uuid) -> Result<Option<PermissionRequest>> {
        Ok(self.state.read().requests.iter().find(|r| r.id == id).cloned())
    }

    fn requests_with_status(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<PermissionRequest>> {
        Ok(self
            .state
            .read()
            .requests
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    fn find_pending(
        &self,
        user_id: &str,
        role: Role,
        table: &str,
    ) -> Result<Option<PermissionRequest>> {
        Ok(self
            .state
            .read()
            .requests
            .iter()
            .find(|r| {
                r.status == RequestStatus::Pending
                    && r.user_id == user_id
                    && r.role == role
                    && r.requested_table == table
            })
            .cloned())
    }

    fn approve_request(
        &self,
        id: Uuid,
        reviewed_by: &str,
        review_notes: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        rule: RbacRule,
    ) -> Result<PermissionRequest> {
        self.mutate(|state| state.approve_request(id, reviewed_by, review_notes, expires_at, rule))
    }
}
