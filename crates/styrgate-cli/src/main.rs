use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use styrgate_core::audit::AuditLogger;
use styrgate_core::config::GatewayConfig;
use styrgate_core::enforcement::{check_access, AccessCheck};
use styrgate_core::rbac::{RbacAuthority, RbacRule};
use styrgate_core::role::{lookup_user, Role};
use styrgate_core::store::{FileStore, PermissionStore};
use styrgate_core::validator::QueryValidator;
use styrgate_core::workflow::{PermissionRequest, PermissionWorkflow, RequestStatus};

#[derive(Parser)]
#[command(name = "styrgate")]
#[command(version)]
#[command(about = "Styrgate - admin tooling for the STYR access gateway")]
struct Cli {
    /// Path to the gateway config file
    #[arg(short, long, env = "STYRGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pending permission requests
    Pending {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List permission requests, optionally filtered by status
    Requests {
        /// PENDING, APPROVED, DENIED or EXPIRED
        #[arg(short, long)]
        status: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Approve a permission request
    Approve {
        /// Request id
        id: Uuid,
        /// Reviewing admin
        #[arg(short, long)]
        admin: String,
        /// Review notes shown to the requester
        #[arg(short, long)]
        notes: Option<String>,
        /// Grant temporarily, lapsing after this many hours
        #[arg(long)]
        expires_in_hours: Option<i64>,
    },
    /// Deny a permission request
    Deny {
        /// Request id
        id: Uuid,
        /// Reviewing admin
        #[arg(short, long)]
        admin: String,
        /// Review notes shown to the requester
        #[arg(short, long)]
        notes: Option<String>,
    },
    /// List dynamic RBAC rules
    Rules {
        /// Only rules for this role
        #[arg(short, long)]
        role: Option<String>,
        /// Include superseded and deactivated rules
        #[arg(long)]
        all: bool,
    },
    /// Grant a role access to a table directly
    AddRule {
        #[arg(short, long)]
        role: String,
        #[arg(short, long)]
        table: String,
        /// Restrict the grant to these columns
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
        /// Granting admin
        #[arg(short, long)]
        admin: String,
        #[arg(short, long)]
        notes: Option<String>,
        /// Lapse after this many hours
        #[arg(long)]
        expires_in_hours: Option<i64>,
    },
    /// Deactivate the active rule for a (role, table) pair
    DeactivateRule {
        #[arg(short, long)]
        role: String,
        #[arg(short, long)]
        table: String,
    },
    /// Lapse expired temporary grants
    Sweep,
    /// Dry-run a statement through validation and permissions
    Check {
        /// Username the statement would run as
        #[arg(short, long)]
        user: String,
        /// The SQL statement
        sql: String,
    },
}

struct Admin {
    authority: Arc<RbacAuthority>,
    workflow: PermissionWorkflow,
    config: GatewayConfig,
}

impl Admin {
    fn open(config: GatewayConfig) -> Result<Self> {
        let store: Arc<dyn PermissionStore> = Arc::new(
            FileStore::open(&config.store_path).with_context(|| {
                format!("Failed to open permission store at {}", config.store_path.display())
            })?,
        );
        let audit = Arc::new(AuditLogger::new(config.audit.clone()));
        let authority = Arc::new(RbacAuthority::new(store.clone()).with_audit(audit.clone()));
        let workflow = PermissionWorkflow::new(store, authority.clone(), audit);
        Ok(Self {
            authority,
            workflow,
            config,
        })
    }
}

fn print_request(request: &PermissionRequest) {
    println!(
        "{}  {:8}  {:16}  {:16}  {}",
        request.id, request.status, request.user_id, request.role, request.requested_table
    );
    if let Some(columns) = &request.requested_columns {
        println!("    columns: {}", columns.join(", "));
    }
    if let Some(question) = &request.original_question {
        println!("    question: {question}");
    }
    if let Some(justification) = &request.justification {
        println!("    justification: {justification}");
    }
    if let Some(reviewer) = &request.reviewed_by {
        println!("    reviewed by: {reviewer}");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("styrgate=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    let admin = Admin::open(config)?;

    match cli.command {
        Commands::Pending { json } => {
            let pending = admin.workflow.pending()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else if pending.is_empty() {
                println!("No pending requests");
            } else {
                for request in &pending {
                    print_request(request);
                }
            }
        }
        Commands::Requests { status, json } => {
            let status = status
                .map(|s| parse_status(&s))
                .transpose()?;
            let requests = admin.workflow.requests(status)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&requests)?);
            } else {
                for request in &requests {
                    print_request(request);
                }
            }
        }
        Commands::Approve {
            id,
            admin: reviewer,
            notes,
            expires_in_hours,
        } => {
            let expires_at = expires_in_hours.map(|h| Utc::now() + Duration::hours(h));
            let approved = admin.workflow.approve(id, &reviewer, notes, expires_at)?;
            match approved.expires_at {
                Some(until) => println!(
                    "Approved {} for {} on {} until {}",
                    id, approved.user_id, approved.requested_table, until
                ),
                None => println!(
                    "Approved {} for {} on {}",
                    id, approved.user_id, approved.requested_table
                ),
            }
        }
        Commands::Deny {
            id,
            admin: reviewer,
            notes,
        } => {
            let denied = admin.workflow.deny(id, &reviewer, notes)?;
            println!("Denied {} for {}", id, denied.user_id);
        }
        Commands::Rules { role, all } => {
            let role = role.map(|r| Role::from_str(&r)).transpose()?;
            let rules = admin.authority.store().all_rules()?;
            for rule in rules
                .iter()
                .filter(|r| all || r.active)
                .filter(|r| role.map_or(true, |wanted| r.role == wanted))
            {
                let state = if rule.active { "active" } else { "inactive" };
                print!("{}  {:8}  {:16}  {}", rule.id, state, rule.role, rule.table);
                if let Some(columns) = &rule.allowed_columns {
                    print!("  only: {}", columns.join(","));
                }
                if let Some(columns) = &rule.blocked_columns {
                    print!("  blocked: {}", columns.join(","));
                }
                if let Some(until) = rule.expires_at {
                    print!("  until {until}");
                }
                println!();
            }
        }
        Commands::AddRule {
            role,
            table,
            columns,
            admin: granter,
            notes,
            expires_in_hours,
        } => {
            let role = Role::from_str(&role)?;
            let mut rule = RbacRule::new(role, table, granter)
                .with_expiry(expires_in_hours.map(|h| Utc::now() + Duration::hours(h)));
            if let Some(columns) = columns {
                rule = rule.with_allowed_columns(columns);
            }
            if let Some(notes) = notes {
                rule = rule.with_notes(notes);
            }
            let stored = admin.authority.add_rule(rule)?;
            println!("Rule {} added for {} on {}", stored.id, stored.role, stored.table);
        }
        Commands::DeactivateRule { role, table } => {
            let role = Role::from_str(&role)?;
            if admin.authority.deactivate_rule(role, &table)? {
                println!("Rule deactivated for {role} on {table}");
            } else {
                println!("No active rule for {role} on {table}");
            }
        }
        Commands::Sweep => {
            let lapsed = admin.workflow.sweep(Utc::now())?;
            println!("{lapsed} temporary grant(s) lapsed");
        }
        Commands::Check { user, sql } => {
            let Some(account) = lookup_user(&user) else {
                anyhow::bail!("unknown user: {user}");
            };
            let normalized = match QueryValidator::new().validate(&sql, admin.config.max_rows) {
                Ok(normalized) => normalized,
                Err(rejection) => {
                    println!("REJECTED: {rejection}");
                    return Ok(());
                }
            };
            match check_access(&admin.authority.resolve(account.role), &normalized) {
                AccessCheck::Granted => {
                    println!("OK ({})", account.role);
                    println!("would execute: {}", normalized.sql);
                }
                AccessCheck::TableDenied { table } => {
                    println!("DENIED: {} may not read {}", account.role, table);
                }
                AccessCheck::ColumnDenied { table, columns } => {
                    println!(
                        "DENIED: {} may not read {} on {}",
                        account.role,
                        columns.join(", "),
                        table
                    );
                }
            }
        }
    }

    Ok(())
}

fn parse_status(s: &str) -> Result<RequestStatus> {
    match s.to_uppercase().as_str() {
        "PENDING" => Ok(RequestStatus::Pending),
        "APPROVED" => Ok(RequestStatus::Approved),
        "DENIED" => Ok(RequestStatus::Denied),
        "EXPIRED" => Ok(RequestStatus::Expired),
        other => anyhow::bail!("unknown status: {other}"),
    }
}
