//! Append-only audit logging.
//!
//! Events are split across per-category sinks (api/security/error),
//! kept in a bounded in-memory ring for inspection, and appended as
//! JSON lines on disk. Payloads are masked before persistence, never
//! after. A broken sink degrades observability, not availability:
//! every write failure is swallowed with a warning.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::warn;
use uuid::Uuid;

/// Field names whose values are masked wherever they appear, at any
/// nesting depth.
pub const SENSITIVE_FIELDS: [&str; 8] = [
    "password",
    "token",
    "secret",
    "key",
    "auth",
    "credit_card",
    "ssn",
    "personal_number",
];

const SQL_LOG_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_dir: PathBuf,
    pub log_to_file: bool,
    /// Cap on the in-memory ring of recent events.
    pub max_stored_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: PathBuf::from("./logs"),
            log_to_file: true,
            max_stored_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditCategory {
    Api,
    Security,
    Error,
}

impl AuditCategory {
    fn file_name(&self) -> &'static str {
        match self {
            AuditCategory::Api => "api_audit.log",
            AuditCategory::Security => "security_audit.log",
            AuditCategory::Error => "error_audit.log",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    QueryExecuted,
    QueryRejected,
    TableDenied,
    ColumnDenied,
    PermissionRequested,
    RequestApproved,
    RequestDenied,
    GrantExpired,
    RuleAdded,
    RuleDeactivated,
    RateLimited,
    CircuitOpen,
    DatabaseError,
    UnknownUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Denied,
    Rejected,
    Blocked,
    Failure,
}

/// A single append-only audit record. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub outcome: AuditOutcome,
    pub actor: Option<String>,
    pub table: Option<String>,
    pub detail: Value,
    pub execution_time_ms: Option<u64>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            outcome,
            actor: None,
            table: None,
            detail: Value::Null,
            execution_time_ms: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = Some(ms);
        self
    }
}

pub struct AuditLogger {
    config: AuditConfig,
    entries: RwLock<VecDeque<AuditEvent>>,
}

impl AuditLogger {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Record an event. Masking happens here, before the event reaches
    /// any sink. Sink failures never propagate.
    pub fn record(&self, category: AuditCategory, mut event: AuditEvent) {
        if !self.config.enabled {
            return;
        }

        event.detail = mask_sensitive(event.detail);

        {
            let mut entries = self.entries.write();
            entries.push_back(event.clone());
            while entries.len() > self.config.max_stored_entries {
                entries.pop_front();
            }
        }

        if self.config.log_to_file {
            if let Err(e) = self.append(category, &event) {
                warn!("Failed to write audit event to {:?} sink: {}", category, e);
            }
        }
    }

    fn append(&self, category: AuditCategory, event: &AuditEvent) -> std::io::Result<()> {
        fs::create_dir_all(&self.config.log_dir)?;
        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.config.log_dir.join(category.file_name()))?;
        writeln!(file, "{line}")
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        self.entries.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn events_of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

/// Mask sensitive field values recursively through nested structures.
pub fn mask_sensitive(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, val)| {
                    let lower = key.to_lowercase();
                    if SENSITIVE_FIELDS.iter().any(|f| lower.contains(f)) {
                        (key, Value::String("***MASKED***".to_string()))
                    } else {
                        (key, mask_sensitive(val))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(mask_sensitive).collect()),
        other => other,
    }
}

/// Redact literal values from a SQL statement while preserving its
/// shape for diagnosability: `= 'x'` becomes `= '***'`, `= 42`
/// becomes `= ###`. Long statements are truncated.
pub fn redact_sql(sql: &str) -> String {
    static STRING_LITERAL: OnceLock<Regex> = OnceLock::new();
    static NUMBER_LITERAL: OnceLock<Regex> = OnceLock::new();

    let string_literal =
        STRING_LITERAL.get_or_init(|| Regex::new(r"= ?'[^']*'").expect("literal pattern"));
    let number_literal =
        NUMBER_LITERAL.get_or_init(|| Regex::new(r"= ?\d+").expect("literal pattern"));

    let redacted = string_literal.replace_all(sql, "= '***'");
    let redacted = number_literal.replace_all(&redacted, "= ###");

    if redacted.chars().count() > SQL_LOG_MAX_CHARS {
        let mut out: String = redacted.chars().take(SQL_LOG_MAX_CHARS).collect();
        out.push_str("...");
        out
    } else {
        redacted.into_owned()
    }
}
