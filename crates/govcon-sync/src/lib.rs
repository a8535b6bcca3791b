//! Ingestion, on-demand description retrieval, and batch backfill.

pub mod backfill;
pub mod config;
pub mod context;
pub mod description;
pub mod ingest;
pub mod pipeline;

pub use backfill::{BackfillOrchestrator, BackfillOutcome, BackfillReport};
pub use config::{AppConfig, BackfillConfig, DescriptionServiceConfig, FetchConfig};
pub use context::AppContext;
pub use description::{DescriptionError, DescriptionService};
pub use ingest::{opportunity_hash, posted_window, IngestOutcome, IngestionAborted, IngestionService, IngestionStats};
pub use pipeline::{stored_source_text, DescriptionPipeline, ProcessedDescription};
