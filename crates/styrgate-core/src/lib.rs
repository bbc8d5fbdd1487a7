//! Access mediation engine for the STYR production database.
//!
//! Natural-language tooling generates SQL; this crate decides whether
//! that SQL may run. The guard chain, in order:
//!
//! - **Identity**: a fixed username-to-role mapping
//! - **Rate limiting**: sliding windows per client and endpoint class
//! - **Validation**: SELECT-only, allow-listed tables, row limits
//! - **RBAC**: static per-role baselines merged with admin-granted
//!   dynamic rules, with column-level masking
//! - **Circuit breaker**: shields a struggling database
//! - **Audit**: every decision logged, sensitive values masked
//!
//! A denied query files a permission request; an admin approves or
//! denies it through [`workflow::PermissionWorkflow`], and approvals
//! become dynamic rules that take effect on the next query.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use styrgate_core::config::GatewayConfig;
//! use styrgate_core::gateway::{AccessGateway, QueryRequest};
//! use styrgate_core::store::MemoryStore;
//! # use styrgate_core::gateway::{ExecutorError, SqlExecutor};
//! # struct NoDb;
//! # #[async_trait::async_trait]
//! # impl SqlExecutor for NoDb {
//! #     async fn execute(&self, _: &str) -> Result<Vec<serde_json::Value>, ExecutorError> {
//! #         Ok(Vec::new())
//! #     }
//! # }
//!
//! # async fn run() -> styrgate_core::errors::Result<()> {
//! let gateway = AccessGateway::new(
//!     GatewayConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(NoDb),
//! );
//! let outcome = gateway
//!     .query(QueryRequest {
//!         username: "lars".to_string(),
//!         sql: "SELECT KRFNR, KRBLF FROM DCPO.KRKFAKTR".to_string(),
//!         question: Some("open invoices this month?".to_string()),
//!     })
//!     .await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod breaker;
pub mod config;
pub mod enforcement;
pub mod errors;
pub mod gateway;
pub mod ratelimit;
pub mod rbac;
pub mod role;
pub mod store;
pub mod validator;
pub mod workflow;

pub use config::GatewayConfig;
pub use errors::{GateError, Result};
pub use gateway::{AccessGateway, QueryOutcome, QueryRequest, SqlExecutor};
pub use role::{lookup_user, Role, UserAccount};
