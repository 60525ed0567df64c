//! Self-merge deduplication.
//!
//! Dedup is a merge where source and target are the same table. A
//! [`MergeOrientation`] is added to the match constraints so that between any
//! two candidate duplicates only one may link to the other. After matching:
//!
//! 1. the invariant gate counts reflexive links (a row linked to itself) and
//!    mutual pairs (A links to B and B links to A); both must be zero
//! 2. link chains are flattened so every eliminated row points at its survivor
//! 3. each eliminated row is folded into its survivor and deleted
//!
//! A row with no link survives. A linked row is eliminated.

use serde::{Deserialize, Serialize};

use crate::capability::Capabilities;
use crate::core::identifier::quote_pg;
use crate::core::{
    CountPurpose, CountQuery, ExprTemplate, Statement, StatementKind, TargetDescriptor,
    WorkingNames, SOURCE_KEY_NAME, TARGET_KEY_NAME,
};
use crate::error::{LinkageError, Result};
use crate::matcher::{ColumnConstraint, MatchStrategy};
use crate::merger::MergePlan;

/// Flattening uses pointer jumping, so chains of any realistic length settle
/// in a handful of passes; hitting this limit means the links contain a cycle.
pub const FLATTEN_MAX_PASSES: u32 = 64;

/// One ordering rule between two candidate duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrientationRule {
    pub column: String,
    pub predicate: ExprTemplate,
}

/// Ordered rules giving a strict total order between duplicates.
///
/// Empty means the default: the surviving (target) row has the smaller
/// primary key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergeOrientation {
    pub rules: Vec<OrientationRule>,
}

impl MergeOrientation {
    pub fn rule(mut self, column: impl Into<String>, predicate: ExprTemplate) -> Self {
        self.rules.push(OrientationRule {
            column: column.into(),
            predicate,
        });
        self
    }

    /// Constraints installed before matching.
    pub fn constraints(&self, table: &TargetDescriptor) -> Result<Vec<ColumnConstraint>> {
        if self.rules.is_empty() {
            return Ok(vec![ColumnConstraint::new(
                table.primary_key().column.clone(),
                ExprTemplate::parse("$T < $S")?,
            )]);
        }
        Ok(self
            .rules
            .iter()
            .map(|r| ColumnConstraint::new(r.column.clone(), r.predicate.clone()))
            .collect())
    }

    /// The strategy with orientation constraints appended.
    pub fn apply(&self, strategy: &MatchStrategy, table: &TargetDescriptor) -> Result<MatchStrategy> {
        let mut oriented = strategy.clone();
        oriented.constraints.extend(self.constraints(table)?);
        Ok(oriented)
    }
}

/// Statements specific to a dedup run.
#[derive(Debug, Clone)]
pub struct DedupStatements {
    /// Reflexive and symmetric counts, checked before anything destructive.
    pub gate: Vec<CountQuery>,
    pub flatten: Statement,
    pub merge: Statement,
}

/// Validate a dedup job's merge plan.
pub fn validate_plan(
    plan: &MergePlan,
    table: &TargetDescriptor,
    capabilities: &Capabilities,
) -> Result<()> {
    if !plan.return_expressions.is_empty() {
        return Err(LinkageError::Config(
            "return expressions are not supported for dedup jobs".into(),
        ));
    }
    if !plan.insert_expressions.is_empty() {
        return Err(LinkageError::Config(
            "insert expressions are not supported for dedup jobs".into(),
        ));
    }
    plan.validate(table.table(), table, capabilities)
}

/// Gate queries, chain flattening and the fold-and-delete statement.
pub fn compile(
    plan: &MergePlan,
    table: &TargetDescriptor,
    names: &WorkingNames,
) -> Result<DedupStatements> {
    Ok(DedupStatements {
        gate: vec![
            CountQuery::new(CountPurpose::Reflexive, reflexive_count_sql(names, table)?),
            CountQuery::new(CountPurpose::Symmetric, symmetric_count_sql(names, table)?),
        ],
        flatten: Statement::new(StatementKind::Flatten, flatten_sql(names, table)?)
            .labeled("flatten link chains")
            .repeated(Some(FLATTEN_MAX_PASSES)),
        merge: Statement::new(
            StatementKind::MergeDuplicates,
            merge_duplicates_sql(plan, names, table)?,
        )
        .labeled("fold and delete duplicates")
        .repeated(None),
    })
}

/// Rows linked to their own primary key.
pub fn reflexive_count_sql(names: &WorkingNames, table: &TargetDescriptor) -> Result<String> {
    let ws = quote_pg(&names.source)?;
    let pk = table.quoted_pk()?;
    Ok(format!(
        "SELECT COUNT(*) FROM {ws} s1 WHERE s1.{TARGET_KEY_NAME} = s1.{pk}"
    ))
}

/// Mutually linked pairs, each pair counted once.
pub fn symmetric_count_sql(names: &WorkingNames, table: &TargetDescriptor) -> Result<String> {
    let ws = quote_pg(&names.source)?;
    let pk = table.quoted_pk()?;
    Ok(format!(
        "SELECT COUNT(*) FROM {ws} s1\nJOIN {ws} s2 ON s1.{TARGET_KEY_NAME} = s2.{pk} AND s2.{TARGET_KEY_NAME} = s1.{pk}\nWHERE s1.{pk} < s2.{pk}"
    ))
}

/// Point every link at the end of its chain. Repeated until stable.
pub fn flatten_sql(names: &WorkingNames, table: &TargetDescriptor) -> Result<String> {
    let ws = quote_pg(&names.source)?;
    let pk = table.quoted_pk()?;
    Ok(format!(
        "UPDATE {ws} s SET {TARGET_KEY_NAME} = p.{TARGET_KEY_NAME}\nFROM {ws} p\nWHERE s.{TARGET_KEY_NAME} = p.{pk} AND p.{TARGET_KEY_NAME} IS NOT NULL"
    ))
}

/// Delete one eliminated row per survivor and fold its values into the
/// survivor. Repeated until no survivor is updated, so survivors with several
/// duplicates absorb them in working-source order.
pub fn merge_duplicates_sql(
    plan: &MergePlan,
    names: &WorkingNames,
    table: &TargetDescriptor,
) -> Result<String> {
    let ws = quote_pg(&names.source)?;
    let name = table.table().quoted_name()?;
    let pk = table.quoted_pk()?;
    let assignments = plan.update_assignments(table.table(), table)?;

    let next = format!(
        r#"WITH next_duplicates AS (
    SELECT DISTINCT ON (w.{TARGET_KEY_NAME}) w.*
    FROM {ws} w
    JOIN {name} x ON x.{pk} = w.{pk}
    WHERE w.{TARGET_KEY_NAME} IS NOT NULL
    ORDER BY w.{TARGET_KEY_NAME}, w.{SOURCE_KEY_NAME}
)"#
    );

    if assignments.is_empty() {
        // Nothing to fold into survivors.
        return Ok(format!(
            "{next}\nDELETE FROM {name} d USING next_duplicates n\nWHERE d.{pk} = n.{pk}"
        ));
    }

    Ok(format!(
        r#"{next}, duplicate_rows AS (
    DELETE FROM {name} d USING next_duplicates n
    WHERE d.{pk} = n.{pk}
    RETURNING n.*
)
UPDATE {name} t SET {}
FROM duplicate_rows s
WHERE s.{TARGET_KEY_NAME} = t.{pk}"#,
        assignments.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::tests::make_test_table;

    fn table() -> TargetDescriptor {
        TargetDescriptor::new(make_test_table(
            "public.voters",
            &["id", "ssn", "email", "updated_at"],
        ))
        .unwrap()
    }

    fn names() -> WorkingNames {
        WorkingNames::with_infix("dd")
    }

    #[test]
    fn test_default_orientation() {
        let constraints = MergeOrientation::default().constraints(&table()).unwrap();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].column, "id");
        assert_eq!(constraints[0].predicate.as_str(), "$T < $S");
    }

    #[test]
    fn test_custom_orientation_replaces_default() {
        let orientation = MergeOrientation::default()
            .rule("updated_at", ExprTemplate::parse("$T > $S").unwrap());
        let strategy = MatchStrategy::default()
            .exact_match_group(["ssn"])
            .constrain_column("email", ExprTemplate::parse("$S IS NOT NULL").unwrap());
        let oriented = orientation.apply(&strategy, &table()).unwrap();
        assert_eq!(oriented.constraints.len(), 2);
        assert_eq!(oriented.constraints[1].column, "updated_at");
        assert!(oriented
            .constraint_conditions()
            .unwrap()
            .unwrap()
            .contains("t.\"updated_at\" > s.\"updated_at\""));
    }

    #[test]
    fn test_gate_queries() {
        let stmts = compile(&MergePlan::default(), &table(), &names()).unwrap();
        assert_eq!(stmts.gate[0].purpose, CountPurpose::Reflexive);
        assert_eq!(
            stmts.gate[0].sql,
            "SELECT COUNT(*) FROM \"tmp_working_table_dd_0\" s1 WHERE s1.working_target_id = s1.\"id\""
        );
        assert_eq!(stmts.gate[1].purpose, CountPurpose::Symmetric);
        assert!(stmts.gate[1]
            .sql
            .contains("s1.working_target_id = s2.\"id\" AND s2.working_target_id = s1.\"id\""));
        assert!(stmts.gate[1].sql.ends_with("WHERE s1.\"id\" < s2.\"id\""));
    }

    #[test]
    fn test_flatten_is_bounded() {
        let stmts = compile(&MergePlan::default(), &table(), &names()).unwrap();
        assert_eq!(stmts.flatten.kind, StatementKind::Flatten);
        assert_eq!(
            stmts.flatten.repeat,
            crate::core::RepeatPolicy::UntilNoRows {
                max_passes: Some(FLATTEN_MAX_PASSES)
            }
        );
        assert!(stmts.flatten.sql.contains("WHERE s.working_target_id = p.\"id\" AND p.working_target_id IS NOT NULL"));
    }

    #[test]
    fn test_merge_duplicates_folds_then_deletes() {
        let plan = MergePlan::default().preserve_columns(["updated_at"]);
        let stmts = compile(&plan, &table(), &names()).unwrap();
        let sql = &stmts.merge.sql;
        assert_eq!(stmts.merge.kind, StatementKind::MergeDuplicates);
        assert!(stmts.merge.kind.is_destructive());
        assert!(sql.contains("DELETE FROM \"public\".\"voters\" d USING next_duplicates n"));
        assert!(sql.contains("ORDER BY w.working_target_id, w.working_source_id"));
        assert!(sql.contains("UPDATE \"public\".\"voters\" t SET \"ssn\" = s.\"ssn\", \"email\" = s.\"email\""));
        assert!(!sql.contains("\"updated_at\" = s.\"updated_at\""));
        assert!(!sql.contains("\"id\" = s.\"id\""));
        assert!(sql.ends_with("WHERE s.working_target_id = t.\"id\""));
    }

    #[test]
    fn test_merge_duplicates_without_assignments() {
        let plan = MergePlan::default().exclude_columns(["ssn", "email", "updated_at"]);
        let sql = merge_duplicates_sql(&plan, &names(), &table()).unwrap();
        assert!(sql.ends_with("WHERE d.\"id\" = n.\"id\""));
        assert!(!sql.contains("UPDATE"));
    }

    #[test]
    fn test_validate_plan_rejects_return_and_insert() {
        let caps = Capabilities::default();
        let ret = MergePlan::default()
            .return_value_to_source(ExprTemplate::parse("$T.id").unwrap(), "email");
        assert!(validate_plan(&ret, &table(), &caps).is_err());
        let ins = MergePlan::default().insert_column_as("email", ExprTemplate::parse("$S").unwrap());
        assert!(validate_plan(&ins, &table(), &caps).is_err());
        assert!(validate_plan(&MergePlan::default(), &table(), &caps).is_ok());
    }
}
