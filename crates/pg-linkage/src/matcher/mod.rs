//! Match strategy evaluation.
//!
//! A [`MatchStrategy`] is an ordered list of exact-match groups, an ordered
//! list of fuzzy columns and a set of global column constraints. Compiling it
//! against a source and target yields a [`MatchPlan`]:
//!
//! 1. create the working source set (copy of the source + link columns)
//! 2. create the working target pool when any fuzzy column is declared
//! 3. one link pass per exact group, in declaration order
//! 4. one link pass per fuzzy column, in declaration order
//! 5. drop the working tables
//!
//! Link passes only ever touch rows whose link is still NULL, so linkage is
//! write-once. When the pool exists, every pass deletes the target rows it
//! bound from the pool in the same statement, so no target row is bound twice.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::{Capabilities, Capability};
use crate::core::identifier::quote_pg;
use crate::core::{
    Binding, ExprTemplate, Side, Statement, StatementKind, TableDescriptor, TargetDescriptor,
    WorkingNames, MATCH_AUDIT_NAME, SOURCE_KEY_NAME, TARGET_KEY_NAME,
};
use crate::error::{LinkageError, Result};

/// Fuzzy matches are accepted only strictly below this trigram distance.
pub const FUZZY_MATCH_LIMIT: f64 = 0.5;

/// One column equality inside an exact-match group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnPair {
    /// Same column name on both sides.
    Same(String),
    /// Inline foreign-key mapping between differently named columns.
    ForeignKey { source: String, target: String },
}

impl ColumnPair {
    pub fn source_column(&self) -> &str {
        match self {
            ColumnPair::Same(c) => c,
            ColumnPair::ForeignKey { source, .. } => source,
        }
    }

    pub fn target_column(&self) -> &str {
        match self {
            ColumnPair::Same(c) => c,
            ColumnPair::ForeignKey { target, .. } => target,
        }
    }

    fn label(&self) -> String {
        match self {
            ColumnPair::Same(c) => c.clone(),
            ColumnPair::ForeignKey { source, target } => format!("{}->{}", source, target),
        }
    }

    fn condition(&self) -> Result<String> {
        let s = quote_pg(self.source_column())?;
        let t = quote_pg(self.target_column())?;
        Ok(format!("( s.{s} = t.{t} AND t.{t} IS NOT NULL )"))
    }
}

/// Column equalities that must all hold for a binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExactMatchGroup {
    pub columns: Vec<ColumnPair>,
}

impl ExactMatchGroup {
    pub fn new(columns: Vec<ColumnPair>) -> Self {
        Self { columns }
    }

    /// Label used in audit results.
    pub fn label(&self) -> String {
        self.columns
            .iter()
            .map(ColumnPair::label)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn conditions(&self) -> Result<String> {
        let parts = self
            .columns
            .iter()
            .map(ColumnPair::condition)
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("( {} )", parts.join(" AND ")))
    }
}

/// A column compared by trigram distance against the shrinking pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FuzzyMatchColumn {
    pub column: String,
}

impl FuzzyMatchColumn {
    pub fn label(&self) -> String {
        format!("fuzzy {}", self.column)
    }
}

/// A predicate ANDed into every match test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnConstraint {
    /// Column bare `$S` / `$T` refer to.
    pub column: String,
    pub predicate: ExprTemplate,
}

impl ColumnConstraint {
    pub fn new(column: impl Into<String>, predicate: ExprTemplate) -> Self {
        Self {
            column: column.into(),
            predicate,
        }
    }

    /// Constraints without a target reference also filter the merge phases.
    pub fn applies_to_merge(&self) -> bool {
        !self.predicate.references_target()
    }
}

/// The full matching configuration of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchStrategy {
    #[serde(default)]
    pub exact: Vec<ExactMatchGroup>,

    #[serde(default)]
    pub fuzzy: Vec<FuzzyMatchColumn>,

    #[serde(default)]
    pub constraints: Vec<ColumnConstraint>,
}

/// Ephemeral-table setup, link passes and teardown for one run.
#[derive(Debug, Clone, Default)]
pub struct MatchPlan {
    pub setup: Vec<Statement>,
    pub link: Vec<Statement>,
    pub teardown: Vec<Statement>,
}

/// What one compile needs besides the strategy.
#[derive(Debug, Clone, Copy)]
pub struct MatchContext<'a> {
    pub source: &'a TableDescriptor,
    pub target: &'a TargetDescriptor,
    pub names: &'a WorkingNames,
    /// Stamp each binding with the index of the group that made it.
    pub audit: bool,
}

impl MatchStrategy {
    /// Append an exact group of same-named columns.
    pub fn exact_match_group<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exact.push(ExactMatchGroup::new(
            columns.into_iter().map(|c| ColumnPair::Same(c.into())).collect(),
        ));
        self
    }

    /// Append an exact group binding `source` to differently named `target`.
    pub fn foreign_key_match(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.exact.push(ExactMatchGroup::new(vec![ColumnPair::ForeignKey {
            source: source.into(),
            target: target.into(),
        }]));
        self
    }

    pub fn fuzzy_match_column(mut self, column: impl Into<String>) -> Self {
        self.fuzzy.push(FuzzyMatchColumn {
            column: column.into(),
        });
        self
    }

    pub fn constrain_column(mut self, column: impl Into<String>, predicate: ExprTemplate) -> Self {
        self.constraints.push(ColumnConstraint::new(column, predicate));
        self
    }

    /// Whether a working target pool is needed.
    pub fn uses_pool(&self) -> bool {
        !self.fuzzy.is_empty()
    }

    /// Labels of every binding source, exact groups first, then fuzzy columns.
    /// Positions match the audit tag values.
    pub fn group_labels(&self) -> Vec<String> {
        self.exact
            .iter()
            .map(ExactMatchGroup::label)
            .chain(self.fuzzy.iter().map(FuzzyMatchColumn::label))
            .collect()
    }

    /// Check columns, templates and capabilities before anything is emitted.
    pub fn validate(
        &self,
        source: &TableDescriptor,
        target: &TargetDescriptor,
        capabilities: &Capabilities,
    ) -> Result<()> {
        for (i, group) in self.exact.iter().enumerate() {
            if group.columns.is_empty() {
                return Err(LinkageError::Config(format!("exact group {} is empty", i)));
            }
            for pair in &group.columns {
                require_column(source, pair.source_column(), "exact match")?;
                require_column(target.table(), pair.target_column(), "exact match")?;
            }
        }

        if !self.fuzzy.is_empty() {
            let names: Vec<_> = self.fuzzy.iter().map(|f| f.column.as_str()).collect();
            capabilities.require(
                Capability::Trigram,
                format!("fuzzy columns {}", names.join(", ")),
            )?;
        }
        for (i, f) in self.fuzzy.iter().enumerate() {
            require_column(source, &f.column, "fuzzy match")?;
            require_column(target.table(), &f.column, "fuzzy match")?;
            if f.column == target.primary_key().column {
                return Err(LinkageError::Config(format!(
                    "fuzzy column {} cannot be the target primary key",
                    f.column
                )));
            }
            if self.fuzzy[..i].iter().any(|p| p.column == f.column) {
                return Err(LinkageError::Config(format!(
                    "fuzzy column {} declared twice",
                    f.column
                )));
            }
        }

        for c in &self.constraints {
            for col in c.predicate.columns_for(Side::Source, &c.column) {
                require_column(source, col, "constraint")?;
            }
            for col in c.predicate.columns_for(Side::Target, &c.column) {
                require_column(target.table(), col, "constraint")?;
            }
            for cap in Capability::referenced_in(c.predicate.as_str()) {
                capabilities.require(cap, format!("constraint on {}", c.column))?;
            }
        }

        Ok(())
    }

    /// `( c1 AND c2 ... )` over aliases `s` (working source) and `t` (target).
    pub fn constraint_conditions(&self) -> Result<Option<String>> {
        render_conditions(self.constraints.iter(), |c| {
            c.predicate.render(&Binding::aliased("s", "t", &c.column))
        })
    }

    /// Source-only constraints over alias `s`, used by the merge phases.
    pub fn merge_constraint_conditions(&self) -> Result<Option<String>> {
        render_conditions(
            self.constraints.iter().filter(|c| c.applies_to_merge()),
            |c| c.predicate.render(&Binding::source_only("s", &c.column)),
        )
    }

    /// Compile setup, link and teardown statements.
    pub fn compile(&self, ctx: &MatchContext<'_>) -> Result<MatchPlan> {
        let mut plan = MatchPlan {
            setup: self.working_source_statements(ctx)?,
            ..Default::default()
        };

        if self.uses_pool() {
            plan.setup.extend(self.working_pool_statements(ctx)?);
        }

        for (index, group) in self.exact.iter().enumerate() {
            let sql = self.exact_link_sql(ctx, index, group)?;
            let mut stmt = Statement::new(StatementKind::Link, sql)
                .labeled(format!("exact group {}: {}", index, group.label()));
            if self.uses_pool() {
                stmt = stmt.repeated(None);
            }
            plan.link.push(stmt);
        }

        for (position, fuzzy) in self.fuzzy.iter().enumerate() {
            let index = self.exact.len() + position;
            let sql = self.fuzzy_link_sql(ctx, index, fuzzy)?;
            plan.link.push(
                Statement::new(StatementKind::Link, sql)
                    .labeled(fuzzy.label())
                    .repeated(None),
            );
        }

        if self.uses_pool() {
            plan.teardown.push(drop_statement(&ctx.names.pool)?);
        }
        plan.teardown.push(drop_statement(&ctx.names.source)?);

        debug!(
            "Compiled match plan: {} setup, {} link, {} teardown statements",
            plan.setup.len(),
            plan.link.len(),
            plan.teardown.len()
        );
        Ok(plan)
    }

    fn working_source_statements(&self, ctx: &MatchContext<'_>) -> Result<Vec<Statement>> {
        let ws = quote_pg(&ctx.names.source)?;
        let source = ctx.source.quoted_name()?;
        let pk_type = &ctx.target.primary_key().data_type;

        let mut alter = format!(
            "ALTER TABLE {ws} ADD COLUMN {SOURCE_KEY_NAME} SERIAL, ADD COLUMN {TARGET_KEY_NAME} {pk_type}"
        );
        if ctx.audit {
            alter.push_str(&format!(", ADD COLUMN {MATCH_AUDIT_NAME} INT"));
        }

        let columns = ctx
            .source
            .columns
            .iter()
            .map(|c| quote_pg(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let mut insert = format!("INSERT INTO {ws} ({columns}) SELECT {columns} FROM {source}");
        if let Some(pk) = &ctx.source.primary_key {
            insert.push_str(&format!(" ORDER BY {}", quote_pg(&pk.column)?));
        }

        Ok(vec![
            Statement::new(
                StatementKind::CreateWorking,
                format!("CREATE TEMPORARY TABLE {ws} (LIKE {source}) ON COMMIT DROP"),
            ),
            Statement::new(StatementKind::CreateWorking, alter),
            Statement::new(StatementKind::LoadWorking, insert),
            Statement::new(
                StatementKind::CreateWorking,
                format!("CREATE INDEX ON {ws} ({SOURCE_KEY_NAME})"),
            ),
        ])
    }

    fn working_pool_statements(&self, ctx: &MatchContext<'_>) -> Result<Vec<Statement>> {
        let pool = quote_pg(&ctx.names.pool)?;
        let target = ctx.target.table().quoted_name()?;
        let pk = ctx.target.quoted_pk()?;
        let pk_type = &ctx.target.primary_key().data_type;

        let fuzzy = self
            .fuzzy
            .iter()
            .map(|f| quote_pg(&f.column))
            .collect::<Result<Vec<_>>>()?;

        let mut definition = format!("{pk} {pk_type}");
        let mut insert_columns = pk.clone();
        let mut select_columns = format!("t.{pk}");
        for col in &fuzzy {
            definition.push_str(&format!(", {col} TEXT"));
            insert_columns.push_str(&format!(", {col}"));
            select_columns.push_str(&format!(", t.{col}::TEXT"));
        }

        let mut stmts = vec![Statement::new(
            StatementKind::CreateWorking,
            format!("CREATE TEMPORARY TABLE {pool} ({definition}) ON COMMIT DROP"),
        )];
        for col in &fuzzy {
            stmts.push(Statement::new(
                StatementKind::CreateWorking,
                format!("CREATE INDEX ON {pool} USING gist ({col} gist_trgm_ops)"),
            ));
        }
        stmts.push(Statement::new(
            StatementKind::LoadWorking,
            format!("INSERT INTO {pool} ({insert_columns}) SELECT {select_columns} FROM {target} t"),
        ));
        stmts.push(Statement::new(
            StatementKind::CreateWorking,
            format!("CREATE UNIQUE INDEX ON {pool} ({pk})"),
        ));
        Ok(stmts)
    }

    fn match_conditions(&self, base: String) -> Result<String> {
        Ok(match self.constraint_conditions()? {
            Some(constraints) => format!("{base} AND {constraints}"),
            None => base,
        })
    }

    fn exact_link_sql(
        &self,
        ctx: &MatchContext<'_>,
        index: usize,
        group: &ExactMatchGroup,
    ) -> Result<String> {
        let ws = quote_pg(&ctx.names.source)?;
        let target = ctx.target.table().quoted_name()?;
        let pk = ctx.target.quoted_pk()?;
        let conditions = self.match_conditions(group.conditions()?)?;
        let tag = audit_tag(ctx, index);

        if !self.uses_pool() {
            return Ok(format!(
                r#"UPDATE {ws} w SET {TARGET_KEY_NAME} = m.tid{tag}
FROM (
    SELECT DISTINCT ON (s.{SOURCE_KEY_NAME}) s.{SOURCE_KEY_NAME} AS sid, t.{pk} AS tid
    FROM {ws} s
    JOIN {target} t ON {conditions}
    WHERE s.{TARGET_KEY_NAME} IS NULL
    ORDER BY s.{SOURCE_KEY_NAME}, t.{pk}
) m
WHERE w.{SOURCE_KEY_NAME} = m.sid"#
            ));
        }

        let pool = quote_pg(&ctx.names.pool)?;
        Ok(format!(
            r#"WITH candidates AS (
    SELECT DISTINCT ON (s.{SOURCE_KEY_NAME}) s.{SOURCE_KEY_NAME} AS sid, t.{pk} AS tid
    FROM {ws} s
    JOIN {target} t ON {conditions}
    JOIN {pool} p ON p.{pk} = t.{pk}
    WHERE s.{TARGET_KEY_NAME} IS NULL
    ORDER BY s.{SOURCE_KEY_NAME}, t.{pk}
), {tail}"#,
            tail = bind_and_consume(&ws, &pool, &pk, "ORDER BY tid, sid", &tag),
        ))
    }

    fn fuzzy_link_sql(
        &self,
        ctx: &MatchContext<'_>,
        index: usize,
        fuzzy: &FuzzyMatchColumn,
    ) -> Result<String> {
        let ws = quote_pg(&ctx.names.source)?;
        let pool = quote_pg(&ctx.names.pool)?;
        let target = ctx.target.table().quoted_name()?;
        let pk = ctx.target.quoted_pk()?;
        let col = quote_pg(&fuzzy.column)?;
        let distance = format!("s.{col}::TEXT <-> p.{col}");
        let conditions = self.match_conditions(format!("{distance} < {FUZZY_MATCH_LIMIT}"))?;
        let tag = audit_tag(ctx, index);

        Ok(format!(
            r#"WITH candidates AS (
    SELECT s.{SOURCE_KEY_NAME} AS sid, nearest.tid, nearest.dist
    FROM {ws} s
    CROSS JOIN LATERAL (
        SELECT p.{pk} AS tid, {distance} AS dist
        FROM {pool} p
        JOIN {target} t ON t.{pk} = p.{pk}
        WHERE {conditions}
        ORDER BY dist, p.{pk}
        LIMIT 1
    ) nearest
    WHERE s.{TARGET_KEY_NAME} IS NULL
), {tail}"#,
            tail = bind_and_consume(&ws, &pool, &pk, "ORDER BY tid, dist, sid", &tag),
        ))
    }
}

/// Shared tail of pool-aware link passes: pick one source per target, bind it,
/// then delete the bound targets from the pool.
fn bind_and_consume(ws: &str, pool: &str, pk: &str, pair_order: &str, tag: &str) -> String {
    format!(
        r#"pairs AS (
    SELECT DISTINCT ON (tid) sid, tid FROM candidates {pair_order}
), bound AS (
    UPDATE {ws} w SET {TARGET_KEY_NAME} = pairs.tid{tag}
    FROM pairs
    WHERE w.{SOURCE_KEY_NAME} = pairs.sid
    RETURNING w.{TARGET_KEY_NAME}
)
DELETE FROM {pool} p USING bound WHERE p.{pk} = bound.{TARGET_KEY_NAME}"#
    )
}

fn audit_tag(ctx: &MatchContext<'_>, index: usize) -> String {
    if ctx.audit {
        format!(", {MATCH_AUDIT_NAME} = {index}")
    } else {
        String::new()
    }
}

fn render_conditions<'a, I, F>(constraints: I, render: F) -> Result<Option<String>>
where
    I: Iterator<Item = &'a ColumnConstraint>,
    F: Fn(&ColumnConstraint) -> Result<String>,
{
    let parts = constraints.map(render).collect::<Result<Vec<_>>>()?;
    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(format!("( {} )", parts.join(" AND "))))
    }
}

fn require_column(table: &TableDescriptor, column: &str, used_by: &str) -> Result<()> {
    if table.has_column(column) {
        Ok(())
    } else {
        Err(LinkageError::Config(format!(
            "{} column {} does not exist in {}",
            used_by, column, table.name
        )))
    }
}

pub(crate) fn drop_statement(table: &str) -> Result<Statement> {
    Ok(Statement::new(
        StatementKind::DropWorking,
        format!("DROP TABLE IF EXISTS {}", quote_pg(table)?),
    ))
}
