//! Infrastructure layer: queue, storage, jobs, ingestion and analysis wiring.
//!
//! Every external dependency sits behind a trait with an in-memory
//! implementation for tests and dev:
//!
//! - [`queue::NewsQueue`]: Redis list or in-memory FIFO
//! - [`news_store::NewsEventStore`]: Postgres or in-memory
//! - [`jobs::JobStore`]: Postgres or in-memory

pub mod ai;
pub mod clock;
pub mod ingest;
pub mod jobs;
pub mod news_store;
pub mod queue;
pub mod workers;


pub use clock::{Clock, ManualClock, SystemClock};
pub use workers::{ShutdownSignal, WorkerHandle, shutdown_channel};
