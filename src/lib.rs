//! Client-metrics aggregation and registration deduplication for a
//! feature-flag service.
//!
//! SDK usage reports are folded into live last-minute and last-hour
//! per-feature totals, client heartbeats are deduplicated in memory, and all
//! persistence happens in periodic batches off the request path. Entry
//! point: [`service::ClientMetricsService`].

pub mod config;
pub mod error;
pub mod export;
pub mod ingest;
pub mod lastseen;
pub mod model;
pub mod registration;
pub mod sdk;
pub mod service;
pub mod store;
pub mod window;

pub use error::{Error, Result};
pub use ingest::{Accepted, WindowSnapshot};
pub use service::ClientMetricsService;
