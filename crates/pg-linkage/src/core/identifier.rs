//! Identifier validation and quoting for emitted SQL.
//!
//! Table and column names cannot be bound as statement parameters, so every
//! identifier the engine writes into a statement passes through this module:
//!
//! 1. Validate it (non-empty, no NUL byte, bounded length)
//! 2. Wrap it in double quotes
//! 3. Double any embedded double quote
//!
//! Expression templates written by job authors are screened separately by
//! [`validate_expression`] because they are pasted into statements verbatim.

use crate::error::{LinkageError, Result};

/// Maximum identifier length accepted from job files.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// Rejects:
/// - Empty identifiers
/// - Identifiers containing null bytes
/// - Identifiers exceeding maximum length
///
/// # Errors
///
/// Returns `LinkageError::Config` for invalid identifiers with a descriptive message.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LinkageError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(LinkageError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(LinkageError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// ```ignore
/// assert_eq!(quote_pg("voters")?, "\"voters\"");
/// assert_eq!(quote_pg("odd\"name")?, "\"odd\"\"name\"");
/// ```
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a PostgreSQL table name with schema.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Quote a possibly schema-qualified relation name given as `schema.table` or `table`.
pub fn quote_relation(name: &str) -> Result<String> {
    match split_relation(name) {
        (Some(schema), table) => qualify_pg(schema, table),
        (None, table) => quote_pg(table),
    }
}

/// Split `schema.table` into its parts. Only the first dot separates.
pub fn split_relation(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}

/// Screen an author-supplied SQL fragment (constraint, merge expression) for
/// statement injection.
///
/// # Rejected Patterns
///
/// - Semicolons (statement chaining)
/// - SQL comments (`--`, `/*`, `*/`)
/// - Empty or whitespace-only text
pub fn validate_expression(fragment: &str) -> Result<()> {
    if fragment.trim().is_empty() {
        return Err(LinkageError::template(fragment, "expression is empty"));
    }

    // Quoted literals may legitimately contain these characters; strip them first.
    let unquoted = strip_string_literals(fragment);

    if unquoted.contains(';') {
        return Err(LinkageError::template(
            fragment,
            "SECURITY: expression contains semicolon (possible injection)",
        ));
    }

    if unquoted.contains("--") || unquoted.contains("/*") || unquoted.contains("*/") {
        return Err(LinkageError::template(
            fragment,
            "SECURITY: expression contains SQL comment markers (possible injection)",
        ));
    }

    Ok(())
}

/// Validate a column type written into DDL (e.g. `integer`, `character varying(40)`).
///
/// Types are pasted unquoted, so only letters, digits, spaces, underscores,
/// parentheses, commas and brackets are accepted.
pub fn validate_type_name(data_type: &str) -> Result<()> {
    let ok = !data_type.trim().is_empty()
        && data_type.len() <= MAX_IDENTIFIER_LENGTH
        && data_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '(' | ')' | ',' | '[' | ']'));
    if !ok {
        return Err(LinkageError::Config(format!(
            "SECURITY: invalid column type: {:?}",
            data_type
        )));
    }
    Ok(())
}

/// Quote a text value as a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn strip_string_literals(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut in_literal = false;
    for c in fragment.chars() {
        if c == '\'' {
            // '' inside a literal toggles twice and stays in the literal
            in_literal = !in_literal;
            continue;
        }
        if !in_literal {
            out.push(c);
        }
    }
    out
}
