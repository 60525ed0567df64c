//! In-memory linkage preview.
//!
//! Evaluates a [`MatchStrategy`] over rows held in memory with the same pass
//! order and tie-breaks as the emitted SQL: exact groups in declaration order
//! (lowest target key; contested pool rows go to the lowest source key), then
//! fuzzy columns by trigram distance (nearest first, ties by lowest target key,
//! conflicts by distance then source key, repeated until nothing binds).
//!
//! SQL constraint templates are not evaluated here. Every constraint of the
//! strategy, including dedup orientation rules folded into it, needs a row
//! predicate registered with [`Preview::with_constraint`]; otherwise the
//! preview refuses to run rather than report links the SQL would not make.

mod trigram;

pub use trigram::{distance, similarity, trigrams};

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::audit::AuditResult;
use crate::error::{LinkageError, Result};
use crate::matcher::{ExactMatchGroup, MatchStrategy, FUZZY_MATCH_LIMIT};

/// One in-memory row. Absent columns are NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub key: i64,
    values: HashMap<String, String>,
}

impl Record {
    pub fn new(key: i64) -> Self {
        Self {
            key,
            values: HashMap::new(),
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }
}

/// `(source, target) -> allowed`.
pub type Predicate<'a> = Box<dyn Fn(&Record, &Record) -> bool + 'a>;

/// A binding and the index of the group that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub target: i64,
    pub group: usize,
}

/// Outcome of linking.
#[derive(Debug, Clone, Default)]
pub struct LinkResult {
    /// Source keys in binding-id order.
    pub sources: Vec<i64>,
    pub links: BTreeMap<i64, Link>,
    pub labels: Vec<String>,
}

impl LinkResult {
    pub fn target_of(&self, source: i64) -> Option<i64> {
        self.links.get(&source).map(|l| l.target)
    }

    /// Source rows the update phase would apply.
    pub fn linked(&self) -> Vec<i64> {
        self.links.keys().copied().collect()
    }

    /// Source rows the insert phase would add.
    pub fn unlinked(&self) -> Vec<i64> {
        self.sources
            .iter()
            .filter(|k| !self.links.contains_key(k))
            .copied()
            .collect()
    }

    /// Audit counts for this outcome.
    pub fn audit(&self) -> Result<AuditResult> {
        let groups = self
            .labels
            .iter()
            .enumerate()
            .map(|(index, label)| {
                let count = self.links.values().filter(|l| l.group == index).count();
                (label.clone(), count as i64)
            })
            .collect();
        AuditResult::from_group_counts(self.sources.len() as i64, groups)
    }
}

/// What happens to a row in a dedup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Survives,
    Eliminated { into: i64 },
}

/// Outcome of deduplicating a table.
#[derive(Debug, Clone)]
pub struct DedupPreview {
    pub links: LinkResult,
    pub reflexive: i64,
    pub symmetric: i64,
}

impl DedupPreview {
    /// Every row's fate after chain flattening.
    ///
    /// Fails like the real run: on a non-zero invariant count, or on a cycle.
    pub fn fates(&self) -> Result<BTreeMap<i64, Fate>> {
        if self.reflexive != 0 || self.symmetric != 0 {
            return Err(LinkageError::InvariantViolation {
                reflexive: self.reflexive,
                symmetric: self.symmetric,
            });
        }

        let mut fates = BTreeMap::new();
        for &key in &self.links.sources {
            let mut root = key;
            let mut steps = 0u32;
            while let Some(next) = self.links.target_of(root) {
                root = next;
                steps += 1;
                if steps as usize > self.links.sources.len() {
                    return Err(LinkageError::CyclicLinks { passes: steps });
                }
            }
            let fate = if root == key {
                Fate::Survives
            } else {
                Fate::Eliminated { into: root }
            };
            fates.insert(key, fate);
        }
        Ok(fates)
    }

    pub fn audit(&self) -> Result<AuditResult> {
        let mut audit = self.links.audit()?;
        audit.reflexive_merges = Some(self.reflexive);
        audit.symmetric_merges = Some(self.symmetric);
        Ok(audit)
    }
}

/// Evaluates a strategy in memory.
pub struct Preview<'a> {
    strategy: &'a MatchStrategy,
    predicates: Vec<Predicate<'a>>,
    covered: BTreeSet<String>,
}

impl<'a> Preview<'a> {
    pub fn new(strategy: &'a MatchStrategy) -> Self {
        Self {
            strategy,
            predicates: Vec::new(),
            covered: BTreeSet::new(),
        }
    }

    /// Require `predicate(source, target)` for every binding.
    pub fn with_predicate(mut self, predicate: impl Fn(&Record, &Record) -> bool + 'a) -> Self {
        self.predicates.push(Box::new(predicate));
        self
    }

    /// Evaluate the strategy's constraints on `column` with `predicate`.
    pub fn with_constraint(
        mut self,
        column: impl Into<String>,
        predicate: impl Fn(&Record, &Record) -> bool + 'a,
    ) -> Self {
        self.covered.insert(column.into());
        self.with_predicate(predicate)
    }

    /// Link `source` rows to `target` rows.
    pub fn link(&self, source: &[Record], target: &[Record]) -> Result<LinkResult> {
        self.check_constraints()?;
        Ok(self.evaluate(source, target, &|_, _| true))
    }

    /// Deduplicate with the default orientation: the survivor has the smaller
    /// key.
    pub fn dedup(&self, table: &[Record]) -> Result<DedupPreview> {
        self.dedup_oriented(table, |s, t| t.key < s.key)
    }

    /// Deduplicate with a custom `orientation(source, target)`.
    pub fn dedup_oriented(
        &self,
        table: &[Record],
        orientation: impl Fn(&Record, &Record) -> bool,
    ) -> Result<DedupPreview> {
        self.check_constraints()?;
        let links = self.evaluate(table, table, &orientation);

        let reflexive = links
            .links
            .iter()
            .filter(|(source, link)| **source == link.target)
            .count() as i64;
        let symmetric = links
            .links
            .iter()
            .filter(|(source, link)| {
                **source < link.target && links.target_of(link.target) == Some(**source)
            })
            .count() as i64;

        Ok(DedupPreview {
            links,
            reflexive,
            symmetric,
        })
    }

    fn check_constraints(&self) -> Result<()> {
        let missing: BTreeSet<&str> = self
            .strategy
            .constraints
            .iter()
            .map(|c| c.column.as_str())
            .filter(|column| !self.covered.contains(*column))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(LinkageError::Config(format!(
            "preview needs a row predicate for the constraints on {}",
            missing.into_iter().collect::<Vec<_>>().join(", ")
        )))
    }

    fn allowed(&self, s: &Record, t: &Record, extra: &dyn Fn(&Record, &Record) -> bool) -> bool {
        extra(s, t) && self.predicates.iter().all(|p| p(s, t))
    }

    fn evaluate(
        &self,
        source: &[Record],
        target: &[Record],
        extra: &dyn Fn(&Record, &Record) -> bool,
    ) -> LinkResult {
        let mut sources: Vec<&Record> = source.iter().collect();
        sources.sort_by_key(|r| r.key);
        let mut targets: Vec<&Record> = target.iter().collect();
        targets.sort_by_key(|r| r.key);

        let use_pool = self.strategy.uses_pool();
        let mut pool: BTreeSet<i64> = targets.iter().map(|t| t.key).collect();
        let mut links: BTreeMap<i64, Link> = BTreeMap::new();

        for (index, group) in self.strategy.exact.iter().enumerate() {
            loop {
                // target -> lowest claiming source
                let mut claims: BTreeMap<i64, i64> = BTreeMap::new();
                for s in sources.iter().filter(|s| !links.contains_key(&s.key)) {
                    let candidate = targets.iter().find(|t| {
                        (!use_pool || pool.contains(&t.key))
                            && exact_matches(group, s, t)
                            && self.allowed(s, t, extra)
                    });
                    if let Some(t) = candidate {
                        if use_pool {
                            claims.entry(t.key).or_insert(s.key);
                        } else {
                            claims.insert(s.key, t.key);
                        }
                    }
                }
                if claims.is_empty() {
                    break;
                }
                if !use_pool {
                    for (s, t) in claims {
                        links.insert(s, Link { target: t, group: index });
                    }
                    break;
                }
                for (t, s) in claims {
                    links.insert(s, Link { target: t, group: index });
                    pool.remove(&t);
                }
            }
        }

        for (position, fuzzy) in self.strategy.fuzzy.iter().enumerate() {
            let index = self.strategy.exact.len() + position;
            let column = fuzzy.column.as_str();
            loop {
                // target -> (distance, source)
                let mut claims: BTreeMap<i64, (f64, i64)> = BTreeMap::new();
                for s in sources.iter().filter(|s| !links.contains_key(&s.key)) {
                    let Some(value) = s.get(column) else {
                        continue;
                    };
                    let nearest = targets
                        .iter()
                        .filter(|t| pool.contains(&t.key) && self.allowed(s, t, extra))
                        .filter_map(|t| t.get(column).map(|tv| (distance(value, tv), t.key)))
                        .filter(|(d, _)| *d < FUZZY_MATCH_LIMIT)
                        .min_by(|a, b| by_distance(*a, *b));
                    if let Some((d, t)) = nearest {
                        let claim = claims.entry(t).or_insert((d, s.key));
                        if by_distance((d, s.key), *claim) == Ordering::Less {
                            *claim = (d, s.key);
                        }
                    }
                }
                if claims.is_empty() {
                    break;
                }
                for (t, (_, s)) in claims {
                    links.insert(s, Link { target: t, group: index });
                    pool.remove(&t);
                }
            }
        }

        LinkResult {
            sources: sources.iter().map(|s| s.key).collect(),
            links,
            labels: self.strategy.group_labels(),
        }
    }
}

fn exact_matches(group: &ExactMatchGroup, s: &Record, t: &Record) -> bool {
    group.columns.iter().all(|pair| {
        match (s.get(pair.source_column()), t.get(pair.target_column())) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    })
}

fn by_distance(a: (f64, i64), b: (f64, i64)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::tests::make_test_table;
    use crate::core::{ExprTemplate, TargetDescriptor};
    use crate::dedup::MergeOrientation;

    fn person(key: i64, ssn: &str, email: &str) -> Record {
        Record::new(key).with("ssn", ssn).with("email", email)
    }

    #[test]
    fn test_priority_ordering() {
        let strategy = MatchStrategy::default()
            .exact_match_group(["ssn"])
            .exact_match_group(["email"]);
        let source = vec![person(1, "123", "a@b.com")];
        let target = vec![person(9, "123", "x@y.com"), person(4, "999", "a@b.com")];

        let result = Preview::new(&strategy).link(&source, &target).unwrap();
        assert_eq!(result.links[&1], Link { target: 9, group: 0 });
    }

    #[test]
    fn test_exact_lowest_target_key() {
        let strategy = MatchStrategy::default().exact_match_group(["ssn"]);
        let source = vec![Record::new(1).with("ssn", "1"), Record::new(2).with("ssn", "1")];
        let target = vec![Record::new(8).with("ssn", "1"), Record::new(5).with("ssn", "1")];

        let result = Preview::new(&strategy).link(&source, &target).unwrap();
        // No pool: both sources may bind the same target.
        assert_eq!(result.target_of(1), Some(5));
        assert_eq!(result.target_of(2), Some(5));
    }

    #[test]
    fn test_null_never_matches() {
        let strategy = MatchStrategy::default().exact_match_group(["ssn"]);
        let source = vec![Record::new(1)];
        let target = vec![Record::new(2)];
        let result = Preview::new(&strategy).link(&source, &target).unwrap();
        assert!(result.links.is_empty());
        assert_eq!(result.unlinked(), vec![1]);
    }

    #[test]
    fn test_at_most_one_binding_with_fuzzy() {
        let strategy = MatchStrategy::default()
            .exact_match_group(["ssn"])
            .fuzzy_match_column("name");
        let source: Vec<_> = (1..=4)
            .map(|k| Record::new(k).with("ssn", "1").with("name", "john smith"))
            .collect();
        let target = vec![
            Record::new(10).with("ssn", "1").with("name", "john smith"),
            Record::new(11).with("name", "john smithe"),
            Record::new(12).with("name", "jon smith"),
        ];

        let result = Preview::new(&strategy).link(&source, &target).unwrap();
        let mut seen = BTreeSet::new();
        for link in result.links.values() {
            assert!(seen.insert(link.target), "target {} bound twice", link.target);
        }
        // Exact group consumes 10 for the lowest source key.
        assert_eq!(result.links[&1], Link { target: 10, group: 0 });
        // Fuzzy bindings, nearest first.
        assert_eq!(result.links[&2], Link { target: 11, group: 1 });
        assert_eq!(result.target_of(3), Some(12));
        assert_eq!(result.unlinked(), vec![4]);
    }

    #[test]
    fn test_write_once_linkage() {
        let strategy = MatchStrategy::default()
            .exact_match_group(["ssn"])
            .exact_match_group(["email"]);
        let source = vec![person(1, "123", "a@b.com")];
        let target = vec![person(3, "999", "a@b.com"), person(7, "123", "z@z.com")];
        let result = Preview::new(&strategy).link(&source, &target).unwrap();
        // Group 1 would pick 3, but group 0 already linked to 7.
        assert_eq!(result.links[&1], Link { target: 7, group: 0 });
    }

    #[test]
    fn test_fuzzy_limit() {
        let strategy = MatchStrategy::default().fuzzy_match_column("name");
        let source = vec![Record::new(1).with("name", "alice")];
        let target = vec![Record::new(2).with("name", "bob")];
        assert!(Preview::new(&strategy)
            .link(&source, &target)
            .unwrap()
            .links
            .is_empty());
    }

    #[test]
    fn test_predicates_filter_bindings() {
        let strategy = MatchStrategy::default().exact_match_group(["ssn"]);
        let source = vec![Record::new(1).with("ssn", "1").with("state", "OH")];
        let target = vec![
            Record::new(2).with("ssn", "1").with("state", "PA"),
            Record::new(3).with("ssn", "1").with("state", "OH"),
        ];
        let result = Preview::new(&strategy)
            .with_predicate(|s, t| s.get("state") == t.get("state"))
            .link(&source, &target)
            .unwrap();
        assert_eq!(result.target_of(1), Some(3));
    }

    #[test]
    fn test_constraints_need_row_predicates() {
        let strategy = MatchStrategy::default()
            .exact_match_group(["ssn"])
            .constrain_column("state", ExprTemplate::parse("$S = $T").unwrap());
        let source = vec![Record::new(1).with("ssn", "1").with("state", "OH")];
        let target = vec![
            Record::new(2).with("ssn", "1").with("state", "PA"),
            Record::new(3).with("ssn", "1").with("state", "OH"),
        ];

        let err = Preview::new(&strategy).link(&source, &target).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("state"));

        // a general predicate does not stand in for a column constraint
        assert!(Preview::new(&strategy)
            .with_predicate(|s, t| s.get("state") == t.get("state"))
            .link(&source, &target)
            .is_err());

        let result = Preview::new(&strategy)
            .with_constraint("state", |s, t| s.get("state") == t.get("state"))
            .link(&source, &target)
            .unwrap();
        assert_eq!(result.target_of(1), Some(3));
    }

    #[test]
    fn test_oriented_dedup_strategy_needs_row_predicates() {
        let table_descriptor =
            TargetDescriptor::new(make_test_table("public.voters", &["id", "ssn", "updated_at"]))
                .unwrap();
        let strategy = MergeOrientation::default()
            .rule("updated_at", ExprTemplate::parse("$T > $S").unwrap())
            .apply(
                &MatchStrategy::default().exact_match_group(["ssn"]),
                &table_descriptor,
            )
            .unwrap();
        let table = vec![
            Record::new(1).with("ssn", "1").with("updated_at", "2024-01-01"),
            Record::new(2).with("ssn", "1").with("updated_at", "2025-01-01"),
        ];

        assert!(Preview::new(&strategy).dedup(&table).is_err());

        let preview = Preview::new(&strategy)
            .with_constraint("updated_at", |s, t| t.get("updated_at") > s.get("updated_at"))
            .dedup_oriented(&table, |_, _| true)
            .unwrap();
        let fates = preview.fates().unwrap();
        assert_eq!(fates[&1], Fate::Eliminated { into: 2 });
        assert_eq!(fates[&2], Fate::Survives);
    }

    #[test]
    fn test_update_insert_partition() {
        let strategy = MatchStrategy::default().exact_match_group(["ssn"]);
        let source: Vec<_> = (1..=5).map(|k| Record::new(k).with("ssn", k.to_string())).collect();
        let target = vec![Record::new(20).with("ssn", "2"), Record::new(40).with("ssn", "4")];
        let result = Preview::new(&strategy).link(&source, &target).unwrap();

        let linked: BTreeSet<_> = result.linked().into_iter().collect();
        let unlinked: BTreeSet<_> = result.unlinked().into_iter().collect();
        assert!(linked.is_disjoint(&unlinked));
        assert_eq!(linked.len() + unlinked.len(), source.len());
        assert_eq!(linked, BTreeSet::from([2, 4]));
    }

    #[test]
    fn test_dedup_cluster_default_orientation() {
        let strategy = MatchStrategy::default().exact_match_group(["ssn"]);
        let table: Vec<_> = (1..=3).map(|k| Record::new(k).with("ssn", "555")).collect();

        let preview = Preview::new(&strategy).dedup(&table).unwrap();
        assert_eq!(preview.reflexive, 0);
        assert_eq!(preview.symmetric, 0);
        let fates = preview.fates().unwrap();
        assert_eq!(fates[&1], Fate::Survives);
        assert_eq!(fates[&2], Fate::Eliminated { into: 1 });
        assert_eq!(fates[&3], Fate::Eliminated { into: 1 });
    }

    #[test]
    fn test_dedup_chain_is_flattened() {
        let strategy = MatchStrategy::default().fuzzy_match_column("name");
        let table = vec![
            Record::new(1).with("name", "john smith"),
            Record::new(2).with("name", "john smithe"),
            Record::new(3).with("name", "john smithe"),
        ];

        let preview = Preview::new(&strategy).dedup(&table).unwrap();
        assert_eq!(preview.links.target_of(2), Some(1));
        assert_eq!(preview.links.target_of(3), Some(2));
        assert_eq!(preview.symmetric, 0);

        let fates = preview.fates().unwrap();
        assert_eq!(fates[&1], Fate::Survives);
        assert_eq!(fates[&3], Fate::Eliminated { into: 1 });
    }

    #[test]
    fn test_dedup_mutual_links_fail() {
        let strategy = MatchStrategy::default().exact_match_group(["ssn"]);
        let table = vec![Record::new(1).with("ssn", "7"), Record::new(2).with("ssn", "7")];

        let preview = Preview::new(&strategy)
            .dedup_oriented(&table, |s, t| s.key != t.key)
            .unwrap();
        assert_eq!(preview.symmetric, 1);
        assert!(matches!(
            preview.fates(),
            Err(LinkageError::InvariantViolation { symmetric: 1, .. })
        ));
        assert!(preview.audit().unwrap().has_violations());
    }

    #[test]
    fn test_dedup_reflexive_links_fail() {
        let strategy = MatchStrategy::default().exact_match_group(["ssn"]);
        let table = vec![Record::new(1).with("ssn", "7")];
        let preview = Preview::new(&strategy).dedup_oriented(&table, |_, _| true).unwrap();
        assert_eq!(preview.reflexive, 1);
        assert!(preview.fates().is_err());
    }

    #[test]
    fn test_audit_counts() {
        let strategy = MatchStrategy::default()
            .exact_match_group(["ssn"])
            .exact_match_group(["email"]);
        let source = vec![
            person(1, "1", "a"),
            person(2, "2", "b"),
            person(3, "3", "c"),
            person(4, "4", "d"),
        ];
        let target = vec![person(10, "1", "q"), person(11, "0", "b")];
        let audit = Preview::new(&strategy).link(&source, &target).unwrap().audit().unwrap();
        assert_eq!(audit.total_source_records, 4);
        assert_eq!(audit.match_counts[0].count, 1);
        assert_eq!(audit.match_counts[1].count, 1);
        assert!((audit.match_counts[0].percentage - 0.25).abs() < 1e-9);
        assert_eq!(audit.unmatched(), 2);
    }
}
