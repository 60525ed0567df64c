//! Match auditing.
//!
//! An audit run performs the same matching as a merge or dedup run, with every
//! binding stamped with the index of the group that made it, and then only
//! counts. It never issues the update, insert or fold-and-delete step, so the
//! real tables are left as they were.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::identifier::quote_pg;
use crate::core::{CountPurpose, CountQuery, WorkingNames, MATCH_AUDIT_NAME};
use crate::error::{LinkageError, Result};

/// Matched rows for one exact group or fuzzy column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCount {
    pub label: String,
    pub count: i64,
    /// Fraction of all source rows, 0.0 to 1.0.
    pub percentage: f64,
}

/// Aggregate statistics of one audited run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    pub total_source_records: i64,
    pub match_counts: Vec<MatchCount>,
    /// Dedup only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflexive_merges: Option<i64>,
    /// Dedup only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symmetric_merges: Option<i64>,
}

impl AuditResult {
    /// Assemble a result from count queries and the values read for them.
    pub fn from_counts(results: &[(CountQuery, i64)]) -> Result<Self> {
        let mut total = 0;
        let mut groups = Vec::new();
        let mut reflexive = None;
        let mut symmetric = None;

        for (query, count) in results {
            match &query.purpose {
                CountPurpose::Total => total = *count,
                CountPurpose::Group { label, .. } => groups.push((label.clone(), *count)),
                CountPurpose::Reflexive => reflexive = Some(*count),
                CountPurpose::Symmetric => symmetric = Some(*count),
            }
        }

        let mut audit = Self::from_group_counts(total, groups)?;
        audit.reflexive_merges = reflexive;
        audit.symmetric_merges = symmetric;
        Ok(audit)
    }

    /// Build from a total and per-group counts in tag order.
    pub fn from_group_counts(total: i64, groups: Vec<(String, i64)>) -> Result<Self> {
        if groups.iter().map(|(_, c)| c).sum::<i64>() > total {
            return Err(LinkageError::Config(format!(
                "audit counts exceed total source records ({})",
                total
            )));
        }

        Ok(AuditResult {
            total_source_records: total,
            match_counts: groups
                .into_iter()
                .map(|(label, count)| MatchCount {
                    percentage: ratio(count, total),
                    label,
                    count,
                })
                .collect(),
            reflexive_merges: None,
            symmetric_merges: None,
        })
    }

    /// Rows bound by any group.
    pub fn matched_total(&self) -> i64 {
        self.match_counts.iter().map(|m| m.count).sum()
    }

    /// Rows left unmatched.
    pub fn unmatched(&self) -> i64 {
        self.total_source_records - self.matched_total()
    }

    /// True when a dedup audit found reflexive or mutual links.
    pub fn has_violations(&self) -> bool {
        self.reflexive_merges.unwrap_or(0) != 0 || self.symmetric_merges.unwrap_or(0) != 0
    }
}

fn ratio(count: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "total source records: {}", self.total_source_records)?;
        for m in &self.match_counts {
            writeln!(
                f,
                "{}: {:.2}% {}",
                m.label,
                m.percentage * 100.0,
                m.count
            )?;
        }
        if let Some(n) = self.reflexive_merges.filter(|n| *n != 0) {
            writeln!(f, "REFLEXIVE MERGE ERROR: {} records are flagged as their own duplicate", n)?;
        }
        if let Some(n) = self.symmetric_merges.filter(|n| *n != 0) {
            writeln!(f, "SYMMETRIC MERGE ERROR: {} record pairs are flagged as each other's duplicate", n)?;
        }
        Ok(())
    }
}

/// Total rows in the working source set.
pub fn source_total_count_sql(names: &WorkingNames) -> Result<String> {
    Ok(format!("SELECT COUNT(*) FROM {}", quote_pg(&names.source)?))
}

/// Rows tagged with one group index.
pub fn matched_count_sql(names: &WorkingNames, index: usize) -> Result<String> {
    Ok(format!(
        "SELECT COUNT(*) FROM {} s WHERE s.{MATCH_AUDIT_NAME} = {index}",
        quote_pg(&names.source)?
    ))
}

/// Total and per-group count queries, groups in tag order.
pub fn count_queries(names: &WorkingNames, labels: &[String]) -> Result<Vec<CountQuery>> {
    let mut queries = vec![CountQuery::new(
        CountPurpose::Total,
        source_total_count_sql(names)?,
    )];
    for (index, label) in labels.iter().enumerate() {
        queries.push(CountQuery::new(
            CountPurpose::Group {
                index,
                label: label.clone(),
            },
            matched_count_sql(names, index)?,
        ));
    }
    Ok(queries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> WorkingNames {
        WorkingNames::with_infix("au")
    }

    fn results(counts: &[i64], dedup: Option<(i64, i64)>) -> Vec<(CountQuery, i64)> {
        let labels: Vec<String> = (0..counts.len() - 1).map(|i| format!("g{}", i)).collect();
        let mut out: Vec<_> = count_queries(&names(), &labels)
            .unwrap()
            .into_iter()
            .zip(counts.iter().copied())
            .collect();
        if let Some((r, s)) = dedup {
            out.push((CountQuery::new(CountPurpose::Reflexive, "r"), r));
            out.push((CountQuery::new(CountPurpose::Symmetric, "s"), s));
        }
        out
    }

    #[test]
    fn test_count_queries() {
        let queries = count_queries(&names(), &["ssn".into(), "fuzzy email".into()]).unwrap();
        assert_eq!(queries.len(), 3);
        assert_eq!(
            queries[0].sql,
            "SELECT COUNT(*) FROM \"tmp_working_table_au_0\""
        );
        assert!(queries[2].sql.ends_with("s.working_exact_match_group = 1"));
        assert_eq!(
            queries[2].purpose,
            CountPurpose::Group {
                index: 1,
                label: "fuzzy email".into()
            }
        );
    }

    #[test]
    fn test_from_counts_percentages() {
        let audit = AuditResult::from_counts(&results(&[200, 50, 30], None)).unwrap();
        assert_eq!(audit.total_source_records, 200);
        assert_eq!(audit.match_counts[0].count, 50);
        assert!((audit.match_counts[0].percentage - 0.25).abs() < 1e-9);
        assert!((audit.match_counts[1].percentage - 0.15).abs() < 1e-9);
        assert_eq!(audit.matched_total(), 80);
        assert_eq!(audit.unmatched(), 120);
        assert!(audit.reflexive_merges.is_none());
        assert!(!audit.has_violations());
    }

    #[test]
    fn test_from_counts_empty_source() {
        let audit = AuditResult::from_counts(&results(&[0, 0], None)).unwrap();
        assert_eq!(audit.match_counts[0].percentage, 0.0);
    }

    #[test]
    fn test_from_counts_rejects_overcount() {
        assert!(AuditResult::from_counts(&results(&[10, 8, 8], None)).is_err());
    }

    #[test]
    fn test_dedup_fields() {
        let audit = AuditResult::from_counts(&results(&[10, 4], Some((0, 1)))).unwrap();
        assert_eq!(audit.reflexive_merges, Some(0));
        assert_eq!(audit.symmetric_merges, Some(1));
        assert!(audit.has_violations());
        let text = audit.to_string();
        assert!(text.contains("SYMMETRIC MERGE ERROR: 1"));
        assert!(!text.contains("REFLEXIVE"));
    }

    #[test]
    fn test_display_and_json() {
        let audit = AuditResult::from_counts(&results(&[4, 1], None)).unwrap();
        assert_eq!(audit.to_string(), "total source records: 4\ng0: 25.00% 1\n");
        let json = serde_json::to_value(&audit).unwrap();
        assert_eq!(json["total_source_records"], 4);
        assert!(json.get("reflexive_merges").is_none());
    }
}
