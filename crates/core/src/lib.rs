//! `newsflow-core`: data model shared by the ingestion and analysis pipeline.
//!
//! This crate contains **pure** types (no infrastructure concerns): identifiers,
//! the queue wire record and the persisted news event row.

pub mod article;
pub mod error;
pub mod id;

pub use article::{MARKET_SYMBOL, NewsArticle, NewsEvent};
pub use error::{DomainError, DomainResult};
pub use id::{JobUuid, NewsEventId, TraceId};
