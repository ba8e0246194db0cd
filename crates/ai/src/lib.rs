//! `newsflow-ai`
//!
//! **Responsibility:** LLM-based news analysis.
//!
//! - The model vendor is reached only through [`LlmProvider`] (`generate(prompt, timeout)`).
//! - Output is parsed and validated against a closed schema ([`AnalysisResult`]).
//! - [`LlmClient`] retries with a stricter prompt and keeps the full attempt history.
//!
//! This crate does not persist anything; callers decide what to do with results.

pub mod client;
pub mod prompt;
pub mod provider;
pub mod result;

pub use client::{AnalysisError, AnalysisRun, LlmAttempt, LlmClient, LlmClientConfig};
pub use prompt::{build_prompt, build_retry_prompt};
pub use provider::{LlmProvider, ProviderError};
pub use result::{AnalysisResult, Sentiment, ValidationError, parse_analysis_json};
