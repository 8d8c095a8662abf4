//! Berth converges a live PostgreSQL database to a versioned source tree.
//!
//! A source tree holds one directory per database schema, containing
//! migration scripts, per-object definition files (tables, sequences,
//! functions, views, triggers), seed data sets and system requirements.
//! Berth detects drift by content hashing, synthesizes the minimal DDL/DML
//! to converge the database, orders it around object dependencies, and
//! applies it in one administrative transaction.
//!
//! # Run modes
//!
//! - **apply** - execute every phase and commit,
//! - **rehearse** - execute every phase, then roll back unconditionally,
//! - **render** - compute the full plan and print it, executing nothing,
//! - **save** - like render, but write the plan to a file,
//! - **skip** - do nothing.
//!
//! Required database extensions are the one exception to rehearsal: they are
//! created under a separate superuser transaction that commits on its own
//! terms regardless of the run mode.
//!
//! # Example
//!
//! ```ignore
//! let config = RunConfig { /* roles, source root, defaults */ };
//! let mut interaction = SilentInteraction::new(&config);
//! let outcome = berth::run(&config, &mut interaction).await?;
//! ```

mod catalog;
mod config;
mod data;
mod detect;
mod diff;
mod error;
mod hash;
mod meta;
mod migration;
mod object;
mod plan;
mod provider;
mod resolver;
mod runner;
mod session;
mod topo;

pub use catalog::{DataSource, MigrationSource, ObjectSource, SourceCatalog};
pub use config::{ConnectOptions, Credentials, InitConfig, RunConfig, RunMode};
pub use data::{ColumnMap, DataSet, ImportSchema, ScriptParam, Statement};
pub use diff::{DiffOracle, ObjectDiff, StructuralOracle, WorkObject};
pub use error::Error;
pub use migration::{
    BlockHeader, EventFilter, InitialPolicy, MigrationBlock, MigrationScript, migration_name,
};
pub use object::{DbSnapshot, ObjectKind, ObjectRef, SourceObject};
pub use plan::Phase;
pub use provider::{PgConnection, PgProvider, format_query};
pub use runner::{Interaction, InitAnswers, Outcome, SilentInteraction, run};
pub use session::{Role, Session};

// Re-export the structural types; callers rarely need berth-schema directly.
pub use berth_schema::{ScriptSet, SequenceDiff, SequenceSpec, TableDiff, TableSpec};

/// Result type for berth operations.
pub type Result<T> = std::result::Result<T, Error>;
