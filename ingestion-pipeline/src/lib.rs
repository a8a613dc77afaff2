#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunker;
pub mod pipeline;
pub mod utils;
pub mod worker;

pub use chunker::{Chunker, ChunkerConfig};
pub use pipeline::{
    DefaultPipelineServices, IngestionConfig, IngestionTuning, PipelineOrchestrator,
    PipelineServices, StageRunner,
};
pub use worker::{run_worker_loop, PendingScanner, WorkerTuning};
