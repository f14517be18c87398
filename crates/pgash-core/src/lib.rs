//! pgash-core — adaptive Active Session History pipeline.
//!
//! Provides:
//! - `config` — YAML configuration model and validation
//! - `model` — session samples, sampling decisions, output datapoints
//! - `source` — query-execution capability (`QueryExecutor`), PostgreSQL and mock implementations
//! - `sampler` — periodic session sampler with a bounded ring buffer
//! - `adaptive` — closed-loop adaptive sampling rate
//! - `breaker` — circuit breaker for guarded database calls
//! - `correlator` — query normalization, grouping and categorization
//! - `plan` — EXPLAIN plan extraction, caching and regression detection
//! - `cost` — datapoint budget enforcement
//! - `pipeline` — per-batch processing in fixed order
//! - `export` — record sinks
//! - `shutdown` — cooperative cancellation token

pub mod adaptive;
pub mod breaker;
pub mod config;
pub mod correlator;
pub mod cost;
pub mod export;
pub mod model;
pub mod pipeline;
pub mod plan;
pub mod sampler;
pub mod shutdown;
pub mod source;
