//! Core coregistration processing modules

pub mod engine;
pub mod conditioner;
pub mod orchestrator;
pub mod aggregate;
pub mod filter;
pub mod propagate;
pub mod triage;
pub mod pipeline;

// Re-export main types
pub use engine::{CoregistrationEngine, EngineResult};
pub use conditioner::{ConditionedPair, RasterConditioner};
pub use orchestrator::{CoregisteredFile, CoregistrationOrchestrator};
pub use aggregate::{aggregate, aggregate_flat, ResultLayout, ResultSet};
pub use filter::{apply_filters, FilterChain, FilterCounts, FilterRow, FilterStage, FilterTable};
pub use propagate::{PropagationReport, ShiftPropagator, Sibling, SiblingPolicy};
pub use triage::{triage, TriageReport};
pub use pipeline::{postprocess, RunSummary, SessionRunner};
