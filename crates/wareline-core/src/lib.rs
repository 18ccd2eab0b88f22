//! Wareline Core - extract → normalize → split → load pipeline engine
//!
//! Sources and sinks are traits ([`Source`], [`Sink`]); this crate owns the
//! paging and retry loop, record normalization against a declared schema,
//! entity splitting with natural-key dedup, and the dependency-ordered,
//! idempotent batch loader.

pub mod archive;
pub mod cancel;
pub mod error;
pub mod fetch;
pub mod graph;
pub mod layout;
pub mod load;
pub mod logging;
pub mod ndjson;
pub mod normalize;
pub mod progress;
pub mod retry;
pub mod runner;
pub mod schema;
pub mod sink;
pub mod split;
pub mod value;

// Re-exports for convenience
pub use archive::{ArchiveManifest, ArchiveSource, PageArchive};
pub use cancel::CancelToken;
pub use error::{IntegrityError, PipelineError, SinkError, SourceError, Stage};
pub use fetch::{Cursor, FetchedPage, Page, PageFetcher, Source};
pub use graph::DependencyGraph;
pub use layout::{BoundEntity, BoundLayout, Column, EntityKind, EntityLayout, EntitySpec};
pub use load::{BatchLoader, EntityLoad, EntityOutcome, LoadReport, TransactionScope};
pub use logging::{init_logging, PipelineLogger};
pub use normalize::{CanonicalRecord, RawRecord, RecordNormalizer, RejectionReason, ValidationError};
pub use progress::{fmt_num, ProgressContext, SharedProgress};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use runner::{PipelineConfig, PipelineRun, PipelineRunner, RunStatus, StageCounts};
pub use schema::{Coercion, DerivedRule, FieldDefault, FieldSpec, FieldType, Schema};
pub use sink::{MemorySink, Sink};
pub use split::{split_records, EntitySet, EntitySets, EntitySplitter, Row, SplitStats};
pub use value::{NaturalKey, Value};
