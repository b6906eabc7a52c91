//! Incremental semantic index of a repository's functions and methods, kept
//! in step with a moving commit pointer.

pub mod chunk;
pub mod diff;
pub mod embedding;
pub mod entity_table;
pub mod environment;
pub mod fuzzy;
pub mod parser;
pub mod retrieval;
pub mod retry;
pub mod scan;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod tokens;
pub mod vcs;

pub use chunk::Chunker;
pub use embedding::{create_embedder, Embedder, EmbeddingBackend, EmbeddingError};
pub use entity_table::{Entity, EntityTable, FileRecord, FileSnapshotRow};
pub use parser::{EntityParser, SourceLanguage};
pub use retrieval::{Candidate, CandidateList, RetrievalRanker};
pub use retry::RetryPolicy;
pub use snapshot::{SegmentResult, SnapshotStore};
pub use store::{IndexChunk, IndexStore, SqliteIndexStore};
pub use sync::{IndexSynchronizer, SyncMode, SyncOutcome, SyncSettings};
pub use tokens::{token_counter_for, TokenCounter};
pub use vcs::{ChangeRecord, ChangeType, GitRepository, VersionControl};
