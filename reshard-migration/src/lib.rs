//! Live data migration: the per-range chunk loop and the multi-partition executor that fans
//! ranges out to source partition threads.

pub mod executor;
pub mod session;

pub use executor::{
    EngineSink, MigrationExecutor, MigrationTask, SharedEngine, SourcePartitionRouter,
    without_replicated,
};
pub use session::{ChunkSink, ChunkSource, ExtractionSession, MigrationReport, UndoTokenSequence};
