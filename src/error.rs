use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuditError {
    #[error("Schema error: required field '{0}' is absent from every row")]
    Schema(String),

    #[error("Degenerate reference split: {0}")]
    DegenerateReference(String),

    #[error("Degenerate rate: {0}")]
    DegenerateRate(String),

    #[error("Insufficient cells: {0}")]
    InsufficientCells(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Empty group: arm '{0}' has no observations")]
    EmptyGroup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, AuditError>;

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        AuditError::Json(e.to_string())
    }
}

impl AuditError {
    /// Fatal errors halt the call that raised them. Slice-level errors only
    /// skip the slice (one reference split, one covariate, one stratum) and
    /// leave sibling computations running.
    pub fn is_fatal(&self) -> bool {
        match self {
            AuditError::Schema(_)
            | AuditError::InvalidInput(_)
            | AuditError::Config(_)
            | AuditError::Io(_)
            | AuditError::Json(_) => true,
            AuditError::DegenerateReference(_)
            | AuditError::DegenerateRate(_)
            | AuditError::InsufficientCells(_)
            | AuditError::EmptyGroup(_) => false,
        }
    }

    /// Stable snake_case code used when a skipped slice is serialized.
    pub fn code(&self) -> &'static str {
        match self {
            AuditError::Schema(_) => "schema_error",
            AuditError::DegenerateReference(_) => "degenerate_reference",
            AuditError::DegenerateRate(_) => "degenerate_rate",
            AuditError::InsufficientCells(_) => "insufficient_cells",
            AuditError::InvalidInput(_) => "invalid_input",
            AuditError::EmptyGroup(_) => "empty_group",
            AuditError::Config(_) => "config_error",
            AuditError::Io(_) => "io_error",
            AuditError::Json(_) => "json_error",
        }
    }
}
