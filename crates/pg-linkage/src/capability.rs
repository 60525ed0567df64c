//! Executor capabilities a job may depend on.
//!
//! Fuzzy matching needs the trigram distance operator and index support; some
//! merge expressions call helper functions. Each engine instance is built with
//! an explicit [`Capabilities`] set. Jobs that need something outside the set
//! fail before any statement is emitted.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{Statement, StatementKind};
use crate::error::{LinkageError, Result};

const PARSE_ELECTION_NAME_SQL: &str = r#"CREATE OR REPLACE FUNCTION nb_parse_election_name(elec_date text, elec_type text) RETURNS TEXT AS $fn$
DECLARE
    year TEXT := EXTRACT(YEAR FROM elec_date::DATE)::TEXT;
    type TEXT := lower(elec_type);
BEGIN
    IF type = 'pr' THEN
        RETURN year || '_primary';
    ELSIF type = 'ge' THEN
        RETURN year || '_general';
    ELSIF type = 'pp' THEN
        RETURN year || '_presidential_primary';
    ELSIF type = 'sp' THEN
        RETURN year || '_special';
    ELSE
        RETURN year || '_' || type;
    END IF;
END
$fn$ LANGUAGE plpgsql"#;

const COERCE_DATE_OR_NULL_SQL: &str = r#"CREATE OR REPLACE FUNCTION nb_coerce_to_date_or_null(date text) RETURNS DATE AS $fn$
BEGIN
    BEGIN
        RETURN date::DATE;
    EXCEPTION WHEN OTHERS THEN
        RETURN NULL;
    END;
END
$fn$ LANGUAGE plpgsql"#;

/// A named executor capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// `pg_trgm`: the `<->` distance operator and `gist_trgm_ops`.
    Trigram,
    /// `nb_coerce_to_date_or_null(text)`.
    CoerceDateOrNull,
    /// `nb_parse_election_name(text, text)`.
    ParseElectionName,
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::Trigram,
        Capability::CoerceDateOrNull,
        Capability::ParseElectionName,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Capability::Trigram => "trigram",
            Capability::CoerceDateOrNull => "coerce_date_or_null",
            Capability::ParseElectionName => "parse_election_name",
        }
    }

    /// Function name a template must mention to need this capability.
    fn function_name(&self) -> Option<&'static str> {
        match self {
            Capability::Trigram => None,
            Capability::CoerceDateOrNull => Some("nb_coerce_to_date_or_null"),
            Capability::ParseElectionName => Some("nb_parse_election_name"),
        }
    }

    /// Statement that installs the capability.
    pub fn install_sql(&self) -> &'static str {
        match self {
            Capability::Trigram => "CREATE EXTENSION IF NOT EXISTS pg_trgm",
            Capability::CoerceDateOrNull => COERCE_DATE_OR_NULL_SQL,
            Capability::ParseElectionName => PARSE_ELECTION_NAME_SQL,
        }
    }

    /// Helper-function capabilities called by an SQL fragment.
    pub fn referenced_in(fragment: &str) -> Vec<Capability> {
        let lower = fragment.to_lowercase();
        Self::ALL
            .into_iter()
            .filter(|c| c.function_name().is_some_and(|f| lower.contains(f)))
            .collect()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = LinkageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "trigram" | "pg_trgm" => Ok(Capability::Trigram),
            "coerce_date_or_null" | "nb_coerce_to_date_or_null" => {
                Ok(Capability::CoerceDateOrNull)
            }
            "parse_election_name" | "nb_parse_election_name" => Ok(Capability::ParseElectionName),
            _ => Err(LinkageError::UnsupportedExtension(s.to_string())),
        }
    }
}

/// The capability set declared for one engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    /// Parse declared extension names. Unknown names fail.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        names
            .iter()
            .map(|n| n.as_ref().parse::<Capability>())
            .collect::<Result<BTreeSet<_>>>()
            .map(Self)
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fail unless `cap` is declared.
    pub fn require(&self, cap: Capability, needed_by: impl Into<String>) -> Result<()> {
        if self.contains(cap) {
            Ok(())
        } else {
            Err(LinkageError::MissingCapability {
                capability: cap.name().to_string(),
                needed_by: needed_by.into(),
            })
        }
    }

    /// Install statements, in a stable order.
    pub fn install_statements(&self) -> Vec<Statement> {
        self.iter()
            .map(|c| Statement::new(StatementKind::Extension, c.install_sql()).labeled(c.name()))
            .collect()
    }
}
