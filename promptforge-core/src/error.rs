//! Error Taxonomy
//!
//! Configuration-time errors (spec, asset, template, composition) are fatal
//! and never retried. Provider errors are scoped to a single candidate.

use thiserror::Error;

use crate::controller::RunRecord;

/// Defects in a diagram specification document.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("Failed to parse diagram spec: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Empty value for field: {0}")]
    EmptyField(String),

    #[error("Duplicate component id: {0}")]
    DuplicateComponent(String),

    #[error("Connection {index} references unknown component id '{id}' ({end})")]
    DanglingConnection {
        index: usize,
        end: &'static str,
        id: String,
    },

    #[error("Component '{component}' references unknown logo '{logo}'")]
    UnknownLogo { component: String, logo: String },

    #[error("Unsupported spec format: {0}")]
    UnsupportedFormat(String),
}

/// Defects in a logo asset. This is the only error that may name a file.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Cannot read asset {file}: {reason}")]
    Unreadable { file: String, reason: String },

    #[error("Unsupported asset format for {file}: expected jpg, jpeg or png")]
    UnsupportedFormat { file: String },

    #[error("Asset {file} content does not match its extension")]
    FormatMismatch { file: String },

    #[error("Asset {file} is {size} bytes, limit is {limit} bytes")]
    TooLarge { file: String, size: u64, limit: u64 },

    #[error("Asset {file} has a file name stem shorter than {min} characters; rename the file")]
    StemTooShort { file: String, min: usize },

    #[error("Assets {first} and {second} both resolve to logo name '{name}'")]
    NameCollision {
        name: String,
        first: String,
        second: String,
    },

    #[error("Invalid asset catalog {file}: {reason}")]
    Catalog { file: String, reason: String },

    #[error("Asset directory {path} is not readable: {reason}")]
    Directory { path: String, reason: String },
}

/// Defects in a prompt template file.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Cannot read template: {0}")]
    Io(#[from] std::io::Error),

    #[error("Template is empty")]
    Empty,
}

/// Composition failures. All are deterministic and therefore fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComposeError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("Unresolved placeholders: {}", .0.join(", "))]
    UnresolvedPlaceholder(Vec<String>),

    #[error("Composed prompt leaks internal file name of logo '{asset}'")]
    Leakage { asset: String },
}

/// Provider-side failure for one candidate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Candidate {index}: transient provider failure after {attempts} attempts: {reason}")]
    Transient {
        index: usize,
        attempts: u32,
        reason: String,
    },

    #[error("Candidate {index}: timed out after {attempts} attempts: {reason}")]
    Timeout {
        index: usize,
        attempts: u32,
        reason: String,
    },

    #[error("Candidate {index}: rejected by provider: {reason}")]
    Permanent { index: usize, reason: String },

    #[error("Candidate {index}: cancelled")]
    Cancelled { index: usize },

    #[error("Candidate {index}: invalid provider response: {reason}")]
    InvalidResponse { index: usize, reason: String },
}

impl GenerationError {
    pub fn index(&self) -> usize {
        match self {
            Self::Transient { index, .. }
            | Self::Timeout { index, .. }
            | Self::Permanent { index, .. }
            | Self::Cancelled { index }
            | Self::InvalidResponse { index, .. } => *index,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Invalid run name '{0}'")]
    InvalidRunName(String),

    #[error("Run '{0}' already exists; clean it up before reusing the name")]
    RunExists(String),

    #[error("Output I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Refusing to write prompt text leaking logo '{0}'")]
    Leakage(String),
}

/// Top-level error surfaced to the CLI.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Output(#[from] OutputError),

    /// The run reached a terminal state but its output could not be
    /// written. The in-memory record, candidate bytes included, is kept.
    #[error("Run '{}' ended {} but was not persisted: {source}", .record.run_name, .record.state.as_str())]
    Persist {
        record: Box<RunRecord>,
        #[source]
        source: OutputError,
    },

    #[error("Provider setup failed: {0}")]
    Provider(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    /// Exit code for the CLI: 2 for configuration defects, 3 for bad invocation.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidInput(_)
            | Self::Template(TemplateError::Io(_))
            | Self::Output(OutputError::InvalidRunName(_)) => 3,
            _ => 2,
        }
    }
}
