//! Local blocks engine.
//!
//! Buffers a tenant's server spans by trace, writes idle traces into an
//! append-only head block, rolls head blocks into write-ahead blocks,
//! compacts those into complete blocks and expires old data.

pub mod blocks;
pub mod clock;
pub mod config;
pub mod error;
pub mod filter;
pub mod live_traces;
pub mod metrics;
pub mod model;
pub mod processor;
mod recovery;
pub mod scheduler;
pub mod storage;

pub use blocks::{BlockInventory, BlockManager};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BlockConfig, Compression, LocalBlocksConfig};
pub use error::{Error, Result};
pub use metrics::{PrometheusMetrics, ProcessorMetrics};
pub use processor::{Processor, SpanProcessor, PROCESSOR_NAME};
