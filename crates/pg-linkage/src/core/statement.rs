//! Statements emitted by the engine.
//!
//! A run is an ordered list of [`Statement`]s. Order is load-bearing: every
//! link pass reads the state left behind by the previous one.

use std::fmt;

use serde::Serialize;

/// What a statement does, used for logging, plan output and safety checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    /// Install a capability (extension or helper function).
    Extension,
    /// Create an ephemeral working table or index.
    CreateWorking,
    /// Copy rows into an ephemeral working table.
    LoadWorking,
    /// Bind working source rows to target keys.
    Link,
    /// Rewrite dedup link chains to point at the surviving row.
    Flatten,
    /// Read-only count query.
    Count,
    /// Update matched target rows.
    Update,
    /// Insert unmatched source rows into the target.
    Insert,
    /// Fold eliminated duplicates into survivors and delete them.
    MergeDuplicates,
    /// Drop an ephemeral working table.
    DropWorking,
}

impl StatementKind {
    /// True for statements that modify real (non-working) tables.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            StatementKind::Update | StatementKind::Insert | StatementKind::MergeDuplicates
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Extension => "extension",
            StatementKind::CreateWorking => "create_working",
            StatementKind::LoadWorking => "load_working",
            StatementKind::Link => "link",
            StatementKind::Flatten => "flatten",
            StatementKind::Count => "count",
            StatementKind::Update => "update",
            StatementKind::Insert => "insert",
            StatementKind::MergeDuplicates => "merge_duplicates",
            StatementKind::DropWorking => "drop_working",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the executor runs a statement once or repeats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum RepeatPolicy {
    Once,
    /// Re-run while the statement reports affected rows.
    UntilNoRows { max_passes: Option<u32> },
}

/// One SQL command plus how to run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    pub kind: StatementKind,
    pub sql: String,
    pub repeat: RepeatPolicy,
    /// Short human label ("exact group 0", "fuzzy last_name").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Statement {
    pub fn new(kind: StatementKind, sql: impl Into<String>) -> Self {
        Self {
            kind,
            sql: sql.into(),
            repeat: RepeatPolicy::Once,
            label: None,
        }
    }

    pub fn repeated(mut self, max_passes: Option<u32>) -> Self {
        self.repeat = RepeatPolicy::UntilNoRows { max_passes };
        self
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "-- {} ({})\n{};", self.kind, label, self.sql),
            None => write!(f, "-- {}\n{};", self.kind, self.sql),
        }
    }
}

/// What a count query measures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "measure")]
pub enum CountPurpose {
    /// Rows in the working source set.
    Total,
    /// Rows bound by one exact group or fuzzy column.
    Group { index: usize, label: String },
    /// Rows linked to their own primary key.
    Reflexive,
    /// Mutually linked row pairs.
    Symmetric,
}

/// A `SELECT COUNT(*)` the engine reads back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountQuery {
    pub purpose: CountPurpose,
    pub sql: String,
}

impl CountQuery {
    pub fn new(purpose: CountPurpose, sql: impl Into<String>) -> Self {
        Self {
            purpose,
            sql: sql.into(),
        }
    }

    /// As a plan statement.
    pub fn to_statement(&self) -> Statement {
        let label = match &self.purpose {
            CountPurpose::Total => "total".to_string(),
            CountPurpose::Group { index, label } => format!("group {}: {}", index, label),
            CountPurpose::Reflexive => "reflexive".to_string(),
            CountPurpose::Symmetric => "symmetric".to_string(),
        };
        Statement::new(StatementKind::Count, self.sql.clone()).labeled(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destructive_kinds() {
        assert!(StatementKind::Update.is_destructive());
        assert!(StatementKind::Insert.is_destructive());
        assert!(StatementKind::MergeDuplicates.is_destructive());
        assert!(!StatementKind::Link.is_destructive());
        assert!(!StatementKind::Flatten.is_destructive());
        assert!(!StatementKind::DropWorking.is_destructive());
        assert!(!StatementKind::Count.is_destructive());
    }

    #[test]
    fn test_statement_display() {
        let s = Statement::new(StatementKind::Link, "UPDATE ws SET x = 1").labeled("exact group 0");
        assert_eq!(s.to_string(), "-- link (exact group 0)\nUPDATE ws SET x = 1;");
    }

    #[test]
    fn test_repeated() {
        let s = Statement::new(StatementKind::Flatten, "UPDATE ws").repeated(Some(8));
        assert_eq!(
            s.repeat,
            RepeatPolicy::UntilNoRows {
                max_passes: Some(8)
            }
        );
    }

    #[test]
    fn test_count_to_statement() {
        let q = CountQuery::new(
            CountPurpose::Group {
                index: 1,
                label: "email".into(),
            },
            "SELECT COUNT(*) FROM ws",
        );
        let s = q.to_statement();
        assert_eq!(s.kind, StatementKind::Count);
        assert_eq!(s.label.as_deref(), Some("group 1: email"));
    }

    #[test]
    fn test_statement_serializes_kind() {
        let s = Statement::new(StatementKind::MergeDuplicates, "WITH x AS (SELECT 1) SELECT 1");
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["kind"], "merge_duplicates");
        assert_eq!(json["repeat"]["policy"], "once");
    }
}
