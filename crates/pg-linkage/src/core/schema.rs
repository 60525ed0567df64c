//! Table descriptors and working-table naming.
//!
//! Descriptors are immutable views of a relation: its (possibly schema
//! qualified) name, ordered column list and, when declared, its primary key.
//! A [`TargetDescriptor`] can only be built from a table that has a primary
//! key, so every component that matches or merges against a target gets that
//! check for free.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identifier::{quote_pg, quote_relation, validate_identifier, validate_type_name};
use crate::error::{LinkageError, Result};

/// Synthetic per-row identifier added to the working source set.
pub const SOURCE_KEY_NAME: &str = "working_source_id";

/// Nullable link from a working source row to a target primary key.
pub const TARGET_KEY_NAME: &str = "working_target_id";

/// Match-group tag column, present only in audit runs.
pub const MATCH_AUDIT_NAME: &str = "working_exact_match_group";

const WORKING_TABLE_PREFIX: &str = "tmp_working_table";

/// Primary key column and its SQL type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    /// Column name.
    pub column: String,

    /// Type as written in DDL (e.g. "integer", "bigint", "uuid").
    pub data_type: String,
}

impl PrimaryKey {
    pub fn new(column: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            data_type: data_type.into(),
        }
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Relation name, `table` or `schema.table`.
    pub name: String,

    /// Column names in catalog order.
    pub columns: Vec<String>,

    /// Primary key, when the relation declares one.
    #[serde(default)]
    pub primary_key: Option<PrimaryKey>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: None,
        }
    }

    pub fn with_primary_key(mut self, pk: PrimaryKey) -> Self {
        self.primary_key = Some(pk);
        self
    }

    /// Quoted relation name for use in statements.
    pub fn quoted_name(&self) -> Result<String> {
        quote_relation(&self.name)
    }

    /// Check if the table has a column with this exact name.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Check if the table has a primary key.
    pub fn has_pk(&self) -> bool {
        self.primary_key.is_some()
    }

    /// Validate the name, every column and the primary key declaration.
    pub fn validate(&self) -> Result<()> {
        quote_relation(&self.name)?;
        if self.columns.is_empty() {
            return Err(LinkageError::Config(format!(
                "table {} has no columns",
                self.name
            )));
        }
        for column in &self.columns {
            validate_identifier(column)?;
        }
        if let Some(pk) = &self.primary_key {
            validate_type_name(&pk.data_type)?;
            if !self.has_column(&pk.column) {
                return Err(LinkageError::Config(format!(
                    "primary key {} is not a column of {}",
                    pk.column, self.name
                )));
            }
        }
        Ok(())
    }
}

/// A table used as merge target. Always has a primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    table: TableDescriptor,
    primary_key: PrimaryKey,
}

impl TargetDescriptor {
    /// Fails with [`LinkageError::NoPrimaryKey`] when the table declares none.
    pub fn new(table: TableDescriptor) -> Result<Self> {
        let primary_key = table
            .primary_key
            .clone()
            .ok_or_else(|| LinkageError::NoPrimaryKey(table.name.clone()))?;
        table.validate()?;
        Ok(Self { table, primary_key })
    }

    pub fn table(&self) -> &TableDescriptor {
        &self.table
    }

    pub fn name(&self) -> &str {
        &self.table.name
    }

    pub fn columns(&self) -> &[String] {
        &self.table.columns
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    /// Quoted primary key column.
    pub fn quoted_pk(&self) -> Result<String> {
        quote_pg(&self.primary_key.column)
    }
}

/// Names of the ephemeral tables owned by one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkingNames {
    /// Working source set.
    pub source: String,
    /// Working target pool.
    pub pool: String,
}

impl WorkingNames {
    /// Fresh names, unique per run.
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self::with_infix(&id[..12])
    }

    /// Deterministic names for a given infix.
    pub fn with_infix(infix: &str) -> Self {
        Self {
            source: format!("{}_{}_0", WORKING_TABLE_PREFIX, infix),
            pool: format!("{}_{}_1", WORKING_TABLE_PREFIX, infix),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn make_test_table(name: &str, columns: &[&str]) -> TableDescriptor {
        TableDescriptor::new(name, columns.iter().map(|c| c.to_string()).collect())
            .with_primary_key(PrimaryKey::new("id", "integer"))
    }

    #[test]
    fn test_target_requires_primary_key() {
        let table = TableDescriptor::new("public.voters", vec!["id".into(), "ssn".into()]);
        let err = TargetDescriptor::new(table).unwrap_err();
        assert!(matches!(err, LinkageError::NoPrimaryKey(ref t) if t == "public.voters"));
    }

    #[test]
    fn test_target_accessors() {
        let target = TargetDescriptor::new(make_test_table("public.voters", &["id", "ssn"])).unwrap();
        assert_eq!(target.name(), "public.voters");
        assert_eq!(target.primary_key().column, "id");
        assert_eq!(target.quoted_pk().unwrap(), "\"id\"");
        assert_eq!(
            target.table().quoted_name().unwrap(),
            "\"public\".\"voters\""
        );
    }

    #[test]
    fn test_validate_rejects_pk_not_in_columns() {
        let table = TableDescriptor::new("voters", vec!["ssn".into()])
            .with_primary_key(PrimaryKey::new("id", "integer"));
        assert!(table.validate().is_err());
        assert!(TargetDescriptor::new(table).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_pk_type() {
        let table = make_test_table("voters", &["id"]);
        let mut bad = table.clone();
        bad.primary_key = Some(PrimaryKey::new("id", "int; DROP TABLE x"));
        assert!(bad.validate().is_err());
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_columns() {
        let table = TableDescriptor::new("voters", vec![]);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_working_names() {
        let names = WorkingNames::with_infix("abcd");
        assert_eq!(names.source, "tmp_working_table_abcd_0");
        assert_eq!(names.pool, "tmp_working_table_abcd_1");

        let a = WorkingNames::generate();
        let b = WorkingNames::generate();
        assert_ne!(a.source, b.source);
        assert!(a.source.starts_with("tmp_working_table_"));
    }
}
