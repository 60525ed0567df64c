//! Core types shared by every stage of a run.
//!
//! - [`schema`]: table descriptors, primary keys and working-table names
//! - [`identifier`]: identifier validation and quoting
//! - [`expr`]: `$S`/`$T` expression templates
//! - [`statement`]: the statements and count queries a run emits
//! - [`traits`]: executor, schema and bulk-load collaborators
//!
//! # Architecture
//!
//! Nothing in `core` talks to a database. The matcher, merger and dedup stages
//! build statements from these types; the engine hands them to a
//! [`StatementSink`].

pub mod expr;
pub mod identifier;
pub mod schema;
pub mod statement;
pub mod traits;

pub use expr::{Binding, ExprTemplate, Side, SideBinding};
pub use schema::{
    PrimaryKey, TableDescriptor, TargetDescriptor, WorkingNames, MATCH_AUDIT_NAME,
    SOURCE_KEY_NAME, TARGET_KEY_NAME,
};
pub use statement::{CountPurpose, CountQuery, RepeatPolicy, Statement, StatementKind};
pub use traits::{BulkLoader, SchemaSource, StatementSink};
