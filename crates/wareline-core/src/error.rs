//! Error taxonomy for pipeline runs
//!
//! - [`SourceError`]: fetch failures, retryable or not (see [`SourceError::is_retryable`])
//! - [`IntegrityError`]: configuration or referential problems, fatal before load
//! - [`SinkError`]: write failures reported by a sink adapter
//! - [`PipelineError`]: the run-level error a [`crate::PipelineRun`] records
//!
//! Per-record validation failures are not errors at this level; see
//! [`crate::normalize::ValidationError`].

use std::fmt;

use serde::Serialize;

use crate::fetch::Cursor;

/// Error from fetching one page of a paginated source.
#[derive(Debug)]
pub enum SourceError {
    /// HTTP error with optional status code (no status = network/timeout)
    Http {
        status: Option<u16>,
        message: String,
    },
    /// Local I/O error (feed files, archived pages)
    Io(std::io::Error),
    /// Payload could not be decoded into raw records
    Decode { message: String },
    /// The source returned a continuation cursor that was already visited
    CursorStalled { cursor: Cursor },
    /// Transient failures persisted past the retry budget
    RetriesExhausted {
        attempts: u32,
        last: Box<SourceError>,
    },
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Http {
                status: None,
                message,
            } => write!(f, "HTTP error: {message}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
            Self::Decode { message } => write!(f, "decode error: {message}"),
            Self::CursorStalled { cursor } => {
                write!(f, "cursor did not advance (repeated cursor {cursor})")
            }
            Self::RetriesExhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

impl SourceError {
    /// Transient failures worth another attempt: network errors without a
    /// status, 429 and 5xx responses, interrupted or timed-out I/O.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status: None, .. } => true,
            Self::Http {
                status: Some(s), ..
            } => *s == 429 || (500..=599).contains(s),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            Self::Decode { .. } | Self::CursorStalled { .. } | Self::RetriesExhausted { .. } => {
                false
            }
        }
    }
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Configuration or referential-integrity failure. Always fatal, always
/// raised before anything is written to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// The dependency graph contains a cycle through these entities
    Cycle { entities: Vec<String> },
    /// An edge or reference names an entity that is not declared
    UnknownEntity { entity: String },
    /// An entity column names a field the schema does not declare
    UnknownField { entity: String, field: String },
    /// A foreign key's column count differs from the target's natural key
    KeyArity {
        entity: String,
        target: String,
        expected: usize,
        found: usize,
    },
    /// The layout itself is malformed (fact count, duplicate names, empty keys)
    LayoutShape { message: String },
    /// The schema declaration is inconsistent
    InvalidSchema { schema: String, message: String },
    /// A non-null foreign key does not resolve to any row of its target set
    DanglingReference {
        entity: String,
        target: String,
        key: String,
    },
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle { entities } => {
                write!(f, "dependency cycle between: {}", entities.join(", "))
            }
            Self::UnknownEntity { entity } => write!(f, "unknown entity '{entity}'"),
            Self::UnknownField { entity, field } => {
                write!(f, "entity '{entity}' uses undeclared field '{field}'")
            }
            Self::KeyArity {
                entity,
                target,
                expected,
                found,
            } => write!(
                f,
                "reference {entity} -> {target} has {found} columns, key has {expected}"
            ),
            Self::LayoutShape { message } => write!(f, "invalid entity layout: {message}"),
            Self::InvalidSchema { schema, message } => {
                write!(f, "invalid schema '{schema}': {message}")
            }
            Self::DanglingReference {
                entity,
                target,
                key,
            } => write!(f, "{entity} references missing {target} row ({key})"),
        }
    }
}

impl std::error::Error for IntegrityError {}

/// Failure reported by a sink adapter while writing a batch.
#[derive(Debug)]
pub enum SinkError {
    /// Lost or refused connection to the warehouse
    Connection(String),
    /// Constraint violation reported by the warehouse
    Constraint(String),
    /// Existing table layout differs from the declared entity
    SchemaDrift {
        entity: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
    Other(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "connection error: {msg}"),
            Self::Constraint(msg) => write!(f, "constraint violation: {msg}"),
            Self::SchemaDrift {
                entity,
                expected,
                found,
            } => write!(
                f,
                "table '{entity}' drifted: expected columns [{}], found [{}]",
                expected.join(", "),
                found.join(", ")
            ),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for SinkError {}

/// Pipeline stage, used to attribute errors and cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Normalize,
    Split,
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Extract => "extract",
            Self::Normalize => "normalize",
            Self::Split => "split",
            Self::Load => "load",
        })
    }
}

/// Run-level error: the first failure that stopped a pipeline run.
#[derive(Debug)]
pub enum PipelineError {
    Source(SourceError),
    Integrity(IntegrityError),
    /// A batch write failed; `committed` rows of `entity` stayed committed
    Sink {
        entity: String,
        committed: usize,
        source: SinkError,
    },
    Cancelled { stage: Stage },
    /// Local persistence failed (page archive, canonical output, audit record)
    Io(std::io::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(e) => write!(f, "source: {e}"),
            Self::Integrity(e) => write!(f, "integrity: {e}"),
            Self::Sink {
                entity,
                committed,
                source,
            } => write!(
                f,
                "sink: loading '{entity}' failed after {committed} committed rows: {source}"
            ),
            Self::Cancelled { stage } => write!(f, "cancelled during {stage}"),
            Self::Io(e) => write!(f, "IO: {e}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Source(e) => Some(e),
            Self::Integrity(e) => Some(e),
            Self::Sink { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            Self::Cancelled { .. } => None,
        }
    }
}

impl PipelineError {
    /// Whether the failure happened while loading, after the sink may
    /// already hold rows from this run.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            Self::Sink { .. }
                | Self::Cancelled {
                    stage: Stage::Load
                }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<SourceError> for PipelineError {
    fn from(e: SourceError) -> Self {
        Self::Source(e)
    }
}

impl From<IntegrityError> for PipelineError {
    fn from(e: IntegrityError) -> Self {
        Self::Integrity(e)
    }
}
