//! Expression templates with source/target row placeholders.
//!
//! Job files describe constraints and merge rules as small SQL fragments that
//! refer to "the source row" and "the target row" symbolically:
//!
//! | Placeholder | Renders as                                  |
//! |-------------|---------------------------------------------|
//! | `$S`        | source alias + the column the rule is for    |
//! | `$T`        | target alias + the column the rule is for    |
//! | `$S.col`    | source alias + `col`                         |
//! | `$T.col`    | target alias + `col`                         |
//! | `$$`        | a literal `$`                               |
//!
//! Single-quoted literals are copied as written.
//!
//! Templates are parsed once into segments, so what a rule references is known
//! up front and rendering a placeholder whose side is not in scope is an error
//! instead of leftover text in a statement.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::identifier::{quote_pg, validate_expression};
use crate::error::{LinkageError, Result};

/// Which row a placeholder refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl Side {
    fn marker(self) -> &'static str {
        match self {
            Side::Source => "$S",
            Side::Target => "$T",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder { side: Side, column: Option<String> },
}

/// How a side is spelled when rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideBinding<'a> {
    /// `alias."col"`
    Alias(&'a str),
    /// `"col"` with no qualifier (e.g. inside `INSERT ... RETURNING`).
    Bare,
    /// The side is not available; referencing it is an error.
    Unavailable,
}

/// Rendering context for an [`ExprTemplate`].
#[derive(Debug, Clone, Copy)]
pub struct Binding<'a> {
    pub source: SideBinding<'a>,
    pub target: SideBinding<'a>,
    /// Column used by bare `$S` / `$T`.
    pub column: Option<&'a str>,
}

impl<'a> Binding<'a> {
    /// Both sides aliased, as in a match or update statement.
    pub fn aliased(source: &'a str, target: &'a str, column: &'a str) -> Self {
        Self {
            source: SideBinding::Alias(source),
            target: SideBinding::Alias(target),
            column: Some(column),
        }
    }

    /// Only the source side is in scope.
    pub fn source_only(source: &'a str, column: &'a str) -> Self {
        Self {
            source: SideBinding::Alias(source),
            target: SideBinding::Unavailable,
            column: Some(column),
        }
    }

    fn side(&self, side: Side) -> SideBinding<'a> {
        match side {
            Side::Source => self.source,
            Side::Target => self.target,
        }
    }
}

/// A parsed SQL fragment with `$S`/`$T` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl ExprTemplate {
    /// Parse a template, rejecting unknown placeholders and injection markers.
    pub fn parse(raw: &str) -> Result<Self> {
        validate_expression(raw)?;

        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = raw.char_indices().peekable();
        let mut in_literal = false;

        while let Some((pos, c)) = chars.next() {
            if c == '\'' {
                // '' inside a literal toggles twice and stays in the literal
                in_literal = !in_literal;
            }
            if c != '$' || in_literal {
                text.push(c);
                continue;
            }

            let side = match chars.peek().map(|&(_, n)| n) {
                Some('$') => {
                    chars.next();
                    text.push('$');
                    continue;
                }
                Some('S') => Side::Source,
                Some('T') => Side::Target,
                _ => {
                    return Err(LinkageError::template(
                        raw,
                        format!("unknown placeholder at byte {}", pos),
                    ))
                }
            };
            chars.next();

            if matches!(chars.peek(), Some(&(_, n)) if is_ident_char(n)) {
                return Err(LinkageError::template(
                    raw,
                    format!("unknown placeholder at byte {}", pos),
                ));
            }

            let mut column = None;
            if matches!(chars.peek(), Some(&(_, '.'))) {
                let mut lookahead = chars.clone();
                lookahead.next();
                if matches!(lookahead.peek(), Some(&(_, n)) if is_ident_char(n)) {
                    chars.next();
                    let mut name = String::new();
                    while let Some(&(_, n)) = chars.peek() {
                        if !is_ident_char(n) {
                            break;
                        }
                        name.push(n);
                        chars.next();
                    }
                    column = Some(name);
                }
            }

            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }
            segments.push(Segment::Placeholder { side, column });
        }

        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The template as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn references_source(&self) -> bool {
        self.references(Side::Source)
    }

    pub fn references_target(&self) -> bool {
        self.references(Side::Target)
    }

    fn references(&self, side: Side) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder { side: p, .. } if *p == side))
    }

    /// Columns named explicitly via `$S.col` / `$T.col` for one side.
    pub fn explicit_columns(&self, side: Side) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder {
                    side: p,
                    column: Some(c),
                } if *p == side => Some(c.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Every column one side resolves to, with bare placeholders bound to `context`.
    pub fn columns_for<'s>(&'s self, side: Side, context: &'s str) -> Vec<&'s str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder { side: p, column } if *p == side => {
                    Some(column.as_deref().unwrap_or(context))
                }
                _ => None,
            })
            .collect()
    }

    /// Render against a binding.
    pub fn render(&self, binding: &Binding<'_>) -> Result<String> {
        let mut out = String::with_capacity(self.raw.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Placeholder { side, column } => {
                    let column = match column.as_deref().or(binding.column) {
                        Some(c) => c,
                        None => {
                            return Err(LinkageError::template(
                                &self.raw,
                                format!("{} has no column in this context", side.marker()),
                            ))
                        }
                    };
                    match binding.side(*side) {
                        SideBinding::Alias(alias) => {
                            out.push_str(alias);
                            out.push('.');
                            out.push_str(&quote_pg(column)?);
                        }
                        SideBinding::Bare => out.push_str(&quote_pg(column)?),
                        SideBinding::Unavailable => {
                            return Err(LinkageError::template(
                                &self.raw,
                                format!("{} is not available in this context", side.marker()),
                            ))
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl fmt::Display for ExprTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for ExprTemplate {
    type Err = LinkageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ExprTemplate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for ExprTemplate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ExprTemplate::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_placeholders_use_context_column() {
        let t = ExprTemplate::parse("$T < $S").unwrap();
        let sql = t.render(&Binding::aliased("s", "t", "id")).unwrap();
        assert_eq!(sql, "t.\"id\" < s.\"id\"");
        assert!(t.references_source());
        assert!(t.references_target());
    }

    #[test]
    fn test_explicit_columns() {
        let t = ExprTemplate::parse("COALESCE($S.email, $T.email_address)").unwrap();
        let sql = t.render(&Binding::aliased("s", "t", "ignored")).unwrap();
        assert_eq!(sql, "COALESCE(s.\"email\", t.\"email_address\")");
        assert_eq!(t.explicit_columns(Side::Source), vec!["email"]);
        assert_eq!(t.explicit_columns(Side::Target), vec!["email_address"]);
    }

    #[test]
    fn test_columns_for_resolves_bare_placeholders() {
        let t = ExprTemplate::parse("$S = $T.other OR $T IS NULL").unwrap();
        assert_eq!(t.columns_for(Side::Source, "zip"), vec!["zip"]);
        assert_eq!(t.columns_for(Side::Target, "zip"), vec!["other", "zip"]);
    }

    #[test]
    fn test_cast_after_placeholder() {
        let t = ExprTemplate::parse("$S::TEXT").unwrap();
        let sql = t.render(&Binding::source_only("s", "zip")).unwrap();
        assert_eq!(sql, "s.\"zip\"::TEXT");
    }

    #[test]
    fn test_dollar_escape() {
        let t = ExprTemplate::parse("$S || $$S").unwrap();
        let sql = t.render(&Binding::source_only("s", "name")).unwrap();
        assert_eq!(sql, "s.\"name\" || $S");
    }

    #[test]
    fn test_dollar_inside_literal_is_text() {
        let t = ExprTemplate::parse("COALESCE($S, '$5.00')").unwrap();
        let sql = t.render(&Binding::source_only("s", "price")).unwrap();
        assert_eq!(sql, "COALESCE(s.\"price\", '$5.00')");
        assert_eq!(t.columns_for(Side::Source, "price"), vec!["price"]);

        let t = ExprTemplate::parse("$S || 'it''s $T' || $T").unwrap();
        let sql = t.render(&Binding::aliased("s", "t", "name")).unwrap();
        assert_eq!(sql, "s.\"name\" || 'it''s $T' || t.\"name\"");
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        assert!(ExprTemplate::parse("$1 = $S").is_err());
        assert!(ExprTemplate::parse("$Source = 1").is_err());
        assert!(ExprTemplate::parse("$X").is_err());
    }

    #[test]
    fn test_injection_rejected() {
        assert!(ExprTemplate::parse("$S; DELETE FROM voters").is_err());
    }

    #[test]
    fn test_out_of_scope_side_is_error() {
        let t = ExprTemplate::parse("$T").unwrap();
        let err = t.render(&Binding::source_only("s", "id")).unwrap_err();
        assert!(err.to_string().contains("$T is not available"));
    }

    #[test]
    fn test_bare_binding() {
        let t = ExprTemplate::parse("$T.id").unwrap();
        let binding = Binding {
            source: SideBinding::Unavailable,
            target: SideBinding::Bare,
            column: None,
        };
        assert_eq!(t.render(&binding).unwrap(), "\"id\"");
    }

    #[test]
    fn test_missing_context_column() {
        let t = ExprTemplate::parse("upper($S)").unwrap();
        let binding = Binding {
            source: SideBinding::Alias("s"),
            target: SideBinding::Alias("t"),
            column: None,
        };
        assert!(t.render(&binding).is_err());
    }

    #[test]
    fn test_serde_roundtrip_through_yaml() {
        let t: ExprTemplate = serde_yaml::from_str("\"$T < $S\"").unwrap();
        assert_eq!(t.as_str(), "$T < $S");
        let bad: std::result::Result<ExprTemplate, _> = serde_yaml::from_str("\"$Q\"");
        assert!(bad.is_err());
    }
}
