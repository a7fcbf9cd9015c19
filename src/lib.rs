#![allow(clippy::large_enum_variant)]
#![allow(clippy::result_large_err)]
//! # odoo-client
//!
//! Asynchronous, type-safe JSON-RPC client for Odoo-like servers.
//!
//! The crate turns a remote model/method RPC surface into an ergonomic local
//! API: authenticated sessions, chainable query construction, lazy
//! relationship traversal, batched bulk operations, nested transactions with
//! savepoints, pluggable caches, and a retry/circuit-breaker layer.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use odoo_client::client::Client;
//! use odoo_client::config::ClientConfig;
//! use odoo_client::model::{FieldDescriptor, FieldType, ModelDescriptor};
//!
//! # async fn run() -> Result<(), odoo_client::error::Error> {
//! let config = ClientConfig::new("https://example.odoo.com/jsonrpc")
//!     .with_database("production")
//!     .with_timeout(std::time::Duration::from_secs(30));
//! let client = Client::new(config)?;
//! client.authenticate("admin", "secret").await?;
//!
//! client.register_model(ModelDescriptor::new(
//!     "res.partner",
//!     vec![
//!         FieldDescriptor::new("id", FieldType::Integer, false),
//!         FieldDescriptor::new("name", FieldType::Text, false),
//!     ],
//! ));
//!
//! use odoo_client::query::{Expr, Leaf, Lookup};
//!
//! let partners = client
//!     .model("res.partner")?
//!     .filter(Expr::Leaf(Leaf::new("is_company", Lookup::Exact, true.into())))
//!     .order_by(["-create_date"])
//!     .limit(10)
//!     .all()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Layout
//!
//! | Module | Spec component | Role |
//! |---|---|---|
//! | [`transport`] | A | JSON-RPC framing over pooled HTTP connections |
//! | [`session`] | B | Auth lifecycle, request context |
//! | [`error`] | C | Closed error taxonomy |
//! | [`cache`] | D | Layered cache backends + manager |
//! | [`retry`] | E | Strategy + policy + circuit breaker |
//! | [`query`] | F | Filter DSL + domain compiler + `QuerySet` |
//! | [`relations`] | G | Lazy relationship resolution + prefetch planner |
//! | [`batch`] | H | Chunked concurrent bulk operations |
//! | [`transaction`] | I | Nested scopes, savepoints, compensation |
//! | [`record`], [`model`] | J | Record materialization, model descriptors |
//!
//! [`client::Client`] is the top-level entry point that wires these together.

pub mod batch;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod query;
pub mod record;
pub mod relations;
pub mod retry;
pub mod session;
pub mod transaction;
pub mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{Error, ErrorContext};
pub use model::{FieldDescriptor, FieldType, ModelDescriptor, ModelRegistry};
pub use query::{Expr, Leaf, Lookup, QuerySet};
pub use record::{FieldValue, Record};
