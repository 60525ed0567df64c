//! Merge plan compilation.
//!
//! After matching, every working source row either carries a target key
//! (update phase) or does not (insert phase). A [`MergePlan`] decides which
//! target columns each phase writes:
//!
//! - update: `column_map` moves, then `merge_expressions`, then every other
//!   source column not excluded, preserved or already covered
//! - insert: `insert_expressions`, then every other source column not excluded
//!   or already covered
//!
//! Overlaps are resolved by set subtraction in that precedence order. When
//! `return_expressions` are declared, each phase is wrapped so the values it
//! computes are written back to the originating source rows.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capability::{Capabilities, Capability};
use crate::core::identifier::quote_pg;
use crate::core::{
    Binding, ExprTemplate, Side, SideBinding, Statement, StatementKind, TableDescriptor,
    TargetDescriptor, WorkingNames, SOURCE_KEY_NAME, TARGET_KEY_NAME,
};
use crate::error::{LinkageError, Result};
use crate::matcher::MatchStrategy;

const RETURN_KEY_NAME: &str = "working_return_key";

/// Which merge phases run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    #[default]
    UpdateAndInsert,
    UpdateOnly,
    InsertOnly,
}

impl MergeMode {
    pub fn updates(&self) -> bool {
        !matches!(self, MergeMode::InsertOnly)
    }

    pub fn inserts(&self) -> bool {
        !matches!(self, MergeMode::UpdateOnly)
    }
}

/// A value computed by a merge phase and written back to a source column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnExpression {
    pub expression: ExprTemplate,
    /// Source column receiving the value.
    pub column: String,
}

/// Declarative merge rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    /// Target column moves: key's pre-update value is written to the value column.
    #[serde(default)]
    pub column_map: BTreeMap<String, String>,

    /// Update-phase expressions by target column; may use `$S` and `$T`.
    #[serde(default)]
    pub merge_expressions: BTreeMap<String, ExprTemplate>,

    /// Insert-phase expressions by target column; `$S` only.
    #[serde(default)]
    pub insert_expressions: BTreeMap<String, ExprTemplate>,

    #[serde(default, rename = "exclude")]
    pub excluded_columns: Vec<String>,

    /// Left untouched on update; still populated on insert.
    #[serde(default, rename = "preserve")]
    pub preserved_columns: Vec<String>,

    #[serde(default, rename = "return")]
    pub return_expressions: Vec<ReturnExpression>,

    #[serde(default)]
    pub mode: MergeMode,
}

/// What one compile needs besides the plan.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    pub source: &'a TableDescriptor,
    pub target: &'a TargetDescriptor,
    pub names: &'a WorkingNames,
    pub strategy: &'a MatchStrategy,
}

impl MergePlan {
    pub fn exclude_columns<I: IntoIterator<Item = S>, S: Into<String>>(mut self, cols: I) -> Self {
        self.excluded_columns.extend(cols.into_iter().map(Into::into));
        self
    }

    pub fn preserve_columns<I: IntoIterator<Item = S>, S: Into<String>>(mut self, cols: I) -> Self {
        self.preserved_columns.extend(cols.into_iter().map(Into::into));
        self
    }

    pub fn move_column(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.column_map.insert(from.into(), to.into());
        self
    }

    pub fn merge_column_as(mut self, column: impl Into<String>, expression: ExprTemplate) -> Self {
        self.merge_expressions.insert(column.into(), expression);
        self
    }

    pub fn insert_column_as(mut self, column: impl Into<String>, expression: ExprTemplate) -> Self {
        self.insert_expressions.insert(column.into(), expression);
        self
    }

    pub fn return_value_to_source(mut self, expression: ExprTemplate, column: impl Into<String>) -> Self {
        self.return_expressions.push(ReturnExpression {
            expression,
            column: column.into(),
        });
        self
    }

    pub fn with_mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Check column references, templates, capabilities and return-back
    /// prerequisites.
    pub fn validate(
        &self,
        source: &TableDescriptor,
        target: &TargetDescriptor,
        capabilities: &Capabilities,
    ) -> Result<()> {
        let target_table = target.table();

        for (from, to) in &self.column_map {
            require(target_table, from, "column_map")?;
            require(target_table, to, "column_map")?;
        }
        for (column, expr) in &self.merge_expressions {
            require(target_table, column, "merge expression")?;
            check_template(expr, column, source, Some(target_table), capabilities)?;
        }
        for (column, expr) in &self.insert_expressions {
            require(target_table, column, "insert expression")?;
            if expr.references_target() {
                return Err(LinkageError::template(
                    expr.as_str(),
                    "insert expressions may only reference $S",
                ));
            }
            check_template(expr, column, source, None, capabilities)?;
        }

        if self.return_expressions.is_empty() {
            return Ok(());
        }

        let source_pk = source.primary_key.as_ref().ok_or_else(|| {
            LinkageError::Config(format!(
                "return expressions need a primary key on source {}",
                source.name
            ))
        })?;
        for ret in &self.return_expressions {
            require(source, &ret.column, "return expression")?;
            check_template(&ret.expression, &ret.column, source, Some(target_table), capabilities)?;
            if self.mode.inserts() && ret.expression.references_source() {
                return Err(LinkageError::template(
                    ret.expression.as_str(),
                    "return expressions cannot reference $S when the insert phase runs",
                ));
            }
        }
        // The insert-phase write-back joins on the key the target row returns,
        // so it has to be the source key copied unchanged.
        if self.mode.inserts()
            && !self
                .correlated_insert_columns(source, target)
                .contains(&source_pk.column)
        {
            return Err(LinkageError::Config(format!(
                "return expressions need source key {} to be copied unchanged into {}",
                source_pk.column,
                target.name()
            )));
        }
        Ok(())
    }

    /// Columns copied verbatim on update.
    pub fn correlated_update_columns(
        &self,
        source: &TableDescriptor,
        target: &TargetDescriptor,
    ) -> Vec<String> {
        let mut covered: BTreeSet<&str> = BTreeSet::new();
        covered.extend(self.excluded_columns.iter().map(String::as_str));
        covered.extend(self.preserved_columns.iter().map(String::as_str));
        covered.extend(self.merge_expressions.keys().map(String::as_str));
        covered.extend(self.column_map.values().map(String::as_str));
        covered.insert(&target.primary_key().column);

        passthrough(source, target, &covered)
    }

    /// Columns copied verbatim on insert.
    pub fn correlated_insert_columns(
        &self,
        source: &TableDescriptor,
        target: &TargetDescriptor,
    ) -> Vec<String> {
        let mut covered: BTreeSet<&str> = BTreeSet::new();
        covered.extend(self.excluded_columns.iter().map(String::as_str));
        covered.extend(self.insert_expressions.keys().map(String::as_str));

        passthrough(source, target, &covered)
    }

    /// `"col" = value` assignments for the update phase over aliases `s`/`t`.
    pub fn update_assignments(
        &self,
        source: &TableDescriptor,
        target: &TargetDescriptor,
    ) -> Result<Vec<String>> {
        let mut assignments = Vec::new();

        for (from, to) in &self.column_map {
            assignments.push(format!("{} = t.{}", quote_pg(to)?, quote_pg(from)?));
        }
        for (column, expr) in &self.merge_expressions {
            if self.column_map.values().any(|to| to == column) {
                warn!(
                    "merge expression for {} ignored: column_map already writes it",
                    column
                );
                continue;
            }
            let value = expr.render(&Binding::aliased("s", "t", column))?;
            assignments.push(format!("{} = {}", quote_pg(column)?, value));
        }
        for column in self.correlated_update_columns(source, target) {
            let quoted = quote_pg(&column)?;
            assignments.push(format!("{quoted} = s.{quoted}"));
        }

        Ok(assignments)
    }

    /// Update and insert statements for a merge job.
    pub fn compile(&self, ctx: &MergeContext<'_>) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();

        if self.mode.updates() {
            match self.update_sql(ctx)? {
                Some(sql) => statements.push(
                    Statement::new(StatementKind::Update, sql).labeled("update matched rows"),
                ),
                None => warn!(
                    "No columns to update in {} - skipping update phase",
                    ctx.target.name()
                ),
            }
        }

        if self.mode.inserts() {
            match self.insert_sql(ctx)? {
                Some(sql) => statements.push(
                    Statement::new(StatementKind::Insert, sql).labeled("insert unmatched rows"),
                ),
                None => warn!(
                    "No columns to insert into {} - skipping insert phase",
                    ctx.target.name()
                ),
            }
        }

        debug!("Compiled merge plan: {} statements", statements.len());
        Ok(statements)
    }

    /// One working row per linked target drives the update: the lowest
    /// `working_source_id` among the rows that pass the merge constraints.
    fn update_sql(&self, ctx: &MergeContext<'_>) -> Result<Option<String>> {
        let assignments = self.update_assignments(ctx.source, ctx.target)?;
        if assignments.is_empty() {
            return Ok(None);
        }

        let target = ctx.target.table().quoted_name()?;
        let pk = ctx.target.quoted_pk()?;
        let eligible = self.linked_rows_condition(ctx)?;
        let sql = format!(
            "UPDATE {target} t SET {}\nFROM (\nSELECT DISTINCT ON (s.{TARGET_KEY_NAME}) s.*\nFROM {} s\nWHERE {eligible}\nORDER BY s.{TARGET_KEY_NAME}, s.{SOURCE_KEY_NAME}\n) s\nWHERE s.{TARGET_KEY_NAME} = t.{pk}",
            assignments.join(", "),
            quote_pg(&ctx.names.source)?,
        );

        if self.return_expressions.is_empty() {
            return Ok(Some(sql));
        }
        Ok(Some(self.wrap_update_return_back(ctx, &sql, &eligible)?))
    }

    fn linked_rows_condition(&self, ctx: &MergeContext<'_>) -> Result<String> {
        let mut condition = format!("s.{TARGET_KEY_NAME} IS NOT NULL");
        if let Some(conditions) = ctx.strategy.merge_constraint_conditions()? {
            condition.push_str(&format!(" AND {conditions}"));
        }
        Ok(condition)
    }

    /// Every linked working row receives the values computed from the updated
    /// target, not only the row that drove the update. `$T` reads the
    /// post-update target row, `$S` the receiving source row.
    fn wrap_update_return_back(
        &self,
        ctx: &MergeContext<'_>,
        update_sql: &str,
        eligible: &str,
    ) -> Result<String> {
        let source_name = ctx.source.quoted_name()?;
        let source_pk = self.source_key(ctx.source)?;
        let target_pk = ctx.target.quoted_pk()?;
        let assignments = self
            .return_expressions
            .iter()
            .map(|ret| {
                let value = ret
                    .expression
                    .render(&Binding::aliased("s", "rows", &ret.column))?;
                Ok(format!("{} = {}", quote_pg(&ret.column)?, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(format!(
            "WITH rows AS (\n{update_sql}\nRETURNING t.*\n)\nUPDATE {source_name} r SET {}\nFROM rows\nJOIN {} s ON s.{TARGET_KEY_NAME} = rows.{target_pk}\nWHERE s.{source_pk} = r.{source_pk} AND {eligible}",
            assignments.join(", "),
            quote_pg(&ctx.names.source)?,
        ))
    }

    fn insert_sql(&self, ctx: &MergeContext<'_>) -> Result<Option<String>> {
        let mut columns = Vec::new();
        let mut values = Vec::new();

        for (column, expr) in &self.insert_expressions {
            columns.push(quote_pg(column)?);
            values.push(expr.render(&Binding::source_only("s", column))?);
        }
        for column in self.correlated_insert_columns(ctx.source, ctx.target) {
            let quoted = quote_pg(&column)?;
            values.push(format!("s.{quoted}"));
            columns.push(quoted);
        }
        if columns.is_empty() {
            return Ok(None);
        }

        let target = ctx.target.table().quoted_name()?;
        let ws = quote_pg(&ctx.names.source)?;
        let mut sql = format!(
            "INSERT INTO {target} ({})\nSELECT {}\nFROM {ws} s\nWHERE s.{TARGET_KEY_NAME} IS NULL",
            columns.join(", "),
            values.join(", ")
        );
        if let Some(conditions) = ctx.strategy.merge_constraint_conditions()? {
            sql.push_str(&format!(" AND {conditions}"));
        }

        if self.return_expressions.is_empty() {
            return Ok(Some(sql));
        }
        let returning = self.returning_list(|ret| {
            ret.expression.render(&Binding {
                source: SideBinding::Unavailable,
                target: SideBinding::Bare,
                column: Some(&ret.column),
            })
        })?;
        let key = self.source_key(ctx.source)?;
        Ok(Some(self.wrap_insert_return_back(ctx.source, &sql, &key, &returning)?))
    }

    fn source_key(&self, source: &TableDescriptor) -> Result<String> {
        match &source.primary_key {
            Some(pk) => quote_pg(&pk.column),
            None => Err(LinkageError::Config(format!(
                "return expressions need a primary key on source {}",
                source.name
            ))),
        }
    }

    fn returning_list<F>(&self, render: F) -> Result<Vec<String>>
    where
        F: Fn(&ReturnExpression) -> Result<String>,
    {
        self.return_expressions
            .iter()
            .enumerate()
            .map(|(i, ret)| Ok(format!("{} AS col_{}", render(ret)?, i)))
            .collect()
    }

    /// `WITH rows AS (<insert> RETURNING key, exprs) UPDATE source ...`
    fn wrap_insert_return_back(
        &self,
        source: &TableDescriptor,
        phase_sql: &str,
        key: &str,
        returning: &[String],
    ) -> Result<String> {
        let source_name = source.quoted_name()?;
        let source_pk = self.source_key(source)?;
        let assignments = self
            .return_expressions
            .iter()
            .enumerate()
            .map(|(i, ret)| Ok(format!("{} = rows.col_{}", quote_pg(&ret.column)?, i)))
            .collect::<Result<Vec<_>>>()?;

        Ok(format!(
            "WITH rows AS (\n{phase_sql}\nRETURNING {key} AS {RETURN_KEY_NAME}, {}\n)\nUPDATE {source_name} r SET {}\nFROM rows\nWHERE rows.{RETURN_KEY_NAME} = r.{source_pk}",
            returning.join(", "),
            assignments.join(", ")
        ))
    }
}

/// Source columns present on the target and not already covered.
fn passthrough(
    source: &TableDescriptor,
    target: &TargetDescriptor,
    covered: &BTreeSet<&str>,
) -> Vec<String> {
    source
        .columns
        .iter()
        .filter(|c| !covered.contains(c.as_str()))
        .filter(|c| {
            let present = target.table().has_column(c);
            if !present {
                debug!("source column {} has no counterpart in {}", c, target.name());
            }
            present
        })
        .cloned()
        .collect()
}

fn require(table: &TableDescriptor, column: &str, used_by: &str) -> Result<()> {
    if table.has_column(column) {
        Ok(())
    } else {
        Err(LinkageError::Config(format!(
            "{} column {} does not exist in {}",
            used_by, column, table.name
        )))
    }
}

fn check_template(
    expr: &ExprTemplate,
    context: &str,
    source: &TableDescriptor,
    target: Option<&TableDescriptor>,
    capabilities: &Capabilities,
) -> Result<()> {
    for col in expr.columns_for(Side::Source, context) {
        require(source, col, "expression")?;
    }
    if let Some(target) = target {
        for col in expr.columns_for(Side::Target, context) {
            require(target, col, "expression")?;
        }
    }
    for cap in Capability::referenced_in(expr.as_str()) {
        capabilities.require(cap, format!("expression for {}", context))?;
    }
    Ok(())
}
