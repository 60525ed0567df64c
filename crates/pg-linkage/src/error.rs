//! Error types for the linkage library.

use thiserror::Error;

/// Main error type for linkage, merge and dedup runs.
#[derive(Error, Debug)]
pub enum LinkageError {
    /// Configuration error (invalid YAML, missing fields, bad job definition)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Target table has no primary key (required for matching and merging)
    #[error("Table {0} has no primary key - matching and merging require one")]
    NoPrimaryKey(String),

    /// Extension name not known to the engine
    #[error("Unsupported extension: {0}")]
    UnsupportedExtension(String),

    /// A job needs a capability that was not declared for this engine
    #[error("Capability '{capability}' is required by {needed_by} but was not declared")]
    MissingCapability {
        capability: String,
        needed_by: String,
    },

    /// Expression template could not be parsed or rendered
    #[error("Invalid expression template {template:?}: {message}")]
    InvalidTemplate { template: String, message: String },

    /// Relation does not exist in the catalog
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Dedup pre-flight check found reflexive or mutual links
    #[error(
        "Dedup invariant violated: {reflexive} reflexive and {symmetric} symmetric merges found"
    )]
    InvariantViolation { reflexive: i64, symmetric: i64 },

    /// Dedup links did not settle into chains ending at a survivor
    #[error("Dedup links still unresolved after {passes} flattening passes (cycle?)")]
    CyclicLinks { passes: u32 },

    /// Statement failed in the PostgreSQL executor
    #[error("Executor error: {0}")]
    Executor(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Bulk load into a working table failed
    #[error("Load failed for table {table}: {message}")]
    Load { table: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Run cancelled")]
    Cancelled,
}

impl LinkageError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        LinkageError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Load error
    pub fn load(table: impl Into<String>, message: impl Into<String>) -> Self {
        LinkageError::Load {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidTemplate error
    pub fn template(template: impl Into<String>, message: impl Into<String>) -> Self {
        LinkageError::InvalidTemplate {
            template: template.into(),
            message: message.into(),
        }
    }

    /// True for errors detected before any statement reaches the executor.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LinkageError::Config(_)
                | LinkageError::NoPrimaryKey(_)
                | LinkageError::UnsupportedExtension(_)
                | LinkageError::MissingCapability { .. }
                | LinkageError::InvalidTemplate { .. }
                | LinkageError::TableNotFound(_)
                | LinkageError::Yaml(_)
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            e if e.is_configuration() => 1,
            LinkageError::InvariantViolation { .. } | LinkageError::CyclicLinks { .. } => 2,
            LinkageError::Executor(_) | LinkageError::Pool { .. } | LinkageError::Load { .. } => 3,
            LinkageError::Io(_) => 7,
            LinkageError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for linkage operations.
pub type Result<T> = std::result::Result<T, LinkageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_exit_with_one() {
        let errors = [
            LinkageError::Config("jobs is required".into()),
            LinkageError::NoPrimaryKey("public.voters".into()),
            LinkageError::UnsupportedExtension("postgis".into()),
            LinkageError::MissingCapability {
                capability: "trigram".into(),
                needed_by: "fuzzy column last_name".into(),
            },
            LinkageError::template("$X", "unknown placeholder"),
            LinkageError::TableNotFound("public.missing".into()),
        ];
        for e in &errors {
            assert!(e.is_configuration(), "{e}");
            assert_eq!(e.exit_code(), 1);
        }
    }

    #[test]
    fn test_runtime_exit_codes() {
        let violation = LinkageError::InvariantViolation {
            reflexive: 0,
            symmetric: 2,
        };
        assert!(!violation.is_configuration());
        assert_eq!(violation.exit_code(), 2);
        assert_eq!(LinkageError::CyclicLinks { passes: 64 }.exit_code(), 2);
        assert_eq!(LinkageError::load("ws", "copy failed").exit_code(), 3);
        assert_eq!(LinkageError::pool("timeout", "connecting").exit_code(), 3);
        assert_eq!(LinkageError::Cancelled.exit_code(), 130);

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(LinkageError::from(io).exit_code(), 7);
    }

    #[test]
    fn test_invariant_message_carries_counts() {
        let e = LinkageError::InvariantViolation {
            reflexive: 3,
            symmetric: 1,
        };
        let msg = e.to_string();
        assert!(msg.contains("3 reflexive"));
        assert!(msg.contains("1 symmetric"));
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let e = LinkageError::from(io);
        let detailed = e.format_detailed();
        assert!(detailed.starts_with("Error: IO error: denied"));
    }
}
