//! The access gateway: one entry point that strings the guards
//! together.
//!
//! Order matters and is fixed: identity, rate limit, circuit breaker,
//! structural validation, permission check, execution. Cheap refusals
//! come first so a misbehaving client never reaches the database, and
//! every decision leaves an audit event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{redact_sql, AuditCategory, AuditEvent, AuditEventType, AuditLogger, AuditOutcome};
use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::GatewayConfig;
use crate::enforcement::{check_access, AccessCheck};
use crate::errors::Result;
use crate::ratelimit::{Admission, EndpointClass, RateLimiter};
use crate::rbac::RbacAuthority;
use crate::role::{lookup_user, UserAccount};
use crate::store::PermissionStore;
use crate::validator::QueryValidator;
use crate::workflow::{PermissionRequest, PermissionWorkflow, RequestDraft, RequestPriority};

#[derive(Debug, Error)]
#[error("database error: {0}")]
pub struct ExecutorError(pub String);

/// Executes validated SQL against the production database. The
/// gateway owns every decision up to this point; the executor only
/// runs what it is handed.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> std::result::Result<Vec<Value>, ExecutorError>;
}

/// What the caller asked for, beyond the SQL itself.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub username: String,
    pub sql: String,
    /// The natural-language question behind the SQL, if any. Carried
    /// into permission requests and audit events.
    pub question: Option<String>,
}

/// Every way a query can come back. Refusals are values, not errors;
/// `GateError` is reserved for the machinery breaking.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Executed {
        rows: Vec<Value>,
        executed_sql: String,
        limit_injected: bool,
        elapsed_ms: u64,
    },
    /// Structural rejection; fix the query and resubmit.
    Rejected { reason: String },
    /// Permission denial, with the request filed on the caller's
    /// behalf so an admin can grant access.
    Denied {
        code: DenialCode,
        table: String,
        columns: Vec<String>,
        request_id: Option<Uuid>,
    },
    UnknownUser { username: String },
    RateLimited { retry_after_ms: u64 },
    /// The database circuit is open; retry after the cooldown.
    CircuitOpen,
    /// The database call itself failed.
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialCode {
    TableDenied,
    ColumnDenied,
}

pub struct AccessGateway {
    config: GatewayConfig,
    validator: QueryValidator,
    authority: Arc<RbacAuthority>,
    workflow: PermissionWorkflow,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    audit: Arc<AuditLogger>,
    executor: Arc<dyn SqlExecutor>,
}

impl AccessGateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn PermissionStore>,
        executor: Arc<dyn SqlExecutor>,
    ) -> Self {
        let audit = Arc::new(AuditLogger::new(config.audit.clone()));
        let authority = Arc::new(RbacAuthority::new(store.clone()).with_audit(audit.clone()));
        let workflow = PermissionWorkflow::new(store, authority.clone(), audit.clone());
        Self {
            validator: QueryValidator::new(),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            config,
            authority,
            workflow,
            audit,
            executor,
        }
    }

    /// Run one query through the full guard chain.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryOutcome> {
        let Some(user) = lookup_user(&request.username) else {
            warn!("Query from unknown user {:?} refused", request.username);
            self.audit.record(
                AuditCategory::Security,
                AuditEvent::new(AuditEventType::UnknownUser, AuditOutcome::Denied)
                    .with_actor(request.username.clone()),
            );
            return Ok(QueryOutcome::UnknownUser {
                username: request.username,
            });
        };

        if let Admission::Limited { retry_after_ms } =
            self.limiter.check(&user.username, EndpointClass::HeavyQuery)
        {
            self.audit.record(
                AuditCategory::Security,
                AuditEvent::new(AuditEventType::RateLimited, AuditOutcome::Blocked)
                    .with_actor(user.username.clone())
                    .with_detail(json!({ "retry_after_ms": retry_after_ms })),
            );
            return Ok(QueryOutcome::RateLimited { retry_after_ms });
        }

        if !self.breaker.should_try() {
            warn!("Query from {} refused: database circuit open", user.username);
            self.audit.record(
                AuditCategory::Error,
                AuditEvent::new(AuditEventType::CircuitOpen, AuditOutcome::Blocked)
                    .with_actor(user.username.clone()),
            );
            return Ok(QueryOutcome::CircuitOpen);
        }

        let normalized = match self.validator.validate(&request.sql, self.config.max_rows) {
            Ok(normalized) => normalized,
            Err(rejection) => {
                info!("Query from {} rejected: {}", user.username, rejection);
                self.audit.record(
                    AuditCategory::Security,
                    AuditEvent::new(AuditEventType::QueryRejected, AuditOutcome::Rejected)
                        .with_actor(user.username.clone())
                        .with_detail(json!({
                            "reason": rejection.to_string(),
                            "sql": redact_sql(&request.sql),
                        })),
                );
                return Ok(QueryOutcome::Rejected {
                    reason: rejection.to_string(),
                });
            }
        };

        let perms = self.authority.resolve(user.role);
        match check_access(&perms, &normalized) {
            AccessCheck::Granted => {}
            AccessCheck::TableDenied { table } => {
                return self.deny(&user, &request, DenialCode::TableDenied, table, Vec::new());
            }
            AccessCheck::ColumnDenied { table, columns } => {
                return self.deny(&user, &request, DenialCode::ColumnDenied, table, columns);
            }
        }

        let started = Instant::now();
        let timeout = std::time::Duration::from_millis(self.config.query_timeout_ms);
        let result = match tokio::time::timeout(timeout, self.executor.execute(&normalized.sql)).await
        {
            Ok(result) => result,
            Err(_) => Err(ExecutorError(format!(
                "query timed out after {}ms",
                self.config.query_timeout_ms
            ))),
        };
        match result {
            Ok(rows) => {
                self.breaker.record_success();
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.audit.record(
                    AuditCategory::Api,
                    AuditEvent::new(AuditEventType::QueryExecuted, AuditOutcome::Success)
                        .with_actor(user.username.clone())
                        .with_detail(json!({
                            "sql": redact_sql(&normalized.sql),
                            "tables": normalized.tables,
                            "rows": rows.len(),
                            "limit_injected": normalized.limit_injected,
                        }))
                        .with_execution_time(elapsed_ms),
                );
                Ok(QueryOutcome::Executed {
                    rows,
                    executed_sql: normalized.sql,
                    limit_injected: normalized.limit_injected,
                    elapsed_ms,
                })
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!("Query from {} failed at the database: {}", user.username, e);
                self.audit.record(
                    AuditCategory::Error,
                    AuditEvent::new(AuditEventType::DatabaseError, AuditOutcome::Failure)
                        .with_actor(user.username.clone())
                        .with_detail(json!({
                            "error": e.to_string(),
                            "sql": redact_sql(&normalized.sql),
                        })),
                );
                Ok(QueryOutcome::Failed {
                    message: e.to_string(),
                })
            }
        }
    }

    fn deny(
        &self,
        user: &UserAccount,
        request: &QueryRequest,
        code: DenialCode,
        table: String,
        columns: Vec<String>,
    ) -> Result<QueryOutcome> {
        info!(
            "Query from {} denied on {} ({:?})",
            user.username, table, code
        );
        let filed = self.workflow.create(RequestDraft {
            user_id: user.username.clone(),
            role: user.role,
            requested_table: table.clone(),
            requested_columns: if columns.is_empty() {
                None
            } else {
                Some(columns.clone())
            },
            original_question: request.question.clone(),
            blocked_sql: Some(redact_sql(&request.sql)),
            justification: None,
            priority: RequestPriority::Normal,
        })?;

        let event_type = match code {
            DenialCode::TableDenied => AuditEventType::TableDenied,
            DenialCode::ColumnDenied => AuditEventType::ColumnDenied,
        };
        self.audit.record(
            AuditCategory::Security,
            AuditEvent::new(event_type, AuditOutcome::Denied)
                .with_actor(user.username.clone())
                .with_table(table.clone())
                .with_detail(json!({
                    "columns": columns,
                    "request_id": filed.id,
                })),
        );

        Ok(QueryOutcome::Denied {
            code,
            table,
            columns,
            request_id: Some(filed.id),
        })
    }

    /// File an access request up front, before any query is blocked.
    pub fn request_access(
        &self,
        username: &str,
        table: &str,
        columns: Option<Vec<String>>,
        justification: Option<String>,
        priority: RequestPriority,
    ) -> Result<Option<PermissionRequest>> {
        let Some(user) = lookup_user(username) else {
            return Ok(None);
        };
        let request = self.workflow.create(RequestDraft {
            user_id: user.username,
            role: user.role,
            requested_table: table.to_string(),
            requested_columns: columns,
            original_question: None,
            blocked_sql: None,
            justification,
            priority,
        })?;
        Ok(Some(request))
    }

    /// Lapse expired temporary grants. Intended to run periodically.
    pub fn sweep_expired(&self) -> Result<usize> {
        self.workflow.sweep(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        self.workflow.sweep(now)
    }

    pub fn breaker_state(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    pub fn workflow(&self) -> &PermissionWorkflow {
        &self.workflow
    }

    pub fn authority(&self) -> &Arc<RbacAuthority> {
        &self.authority
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }
}
