//! LLM analysis of stored news events.
//!
//! Wires [`newsflow_ai::LlmClient`] to the event store. Failures are reported as
//! an [`AnalysisReport`] status, never raised, so the job worker decides what a
//! failure means for the job row.

pub mod analysis_service;

pub use analysis_service::{AnalysisReport, AnalysisRunner, AnalysisService, build_input_text};
