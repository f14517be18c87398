//! Data models flowing through the pipeline.
//!
//! - [`session`]: point-in-time session observations (`SessionSample`) and batches
//! - [`decision`]: per-sample sampling outcome
//! - [`point`]: output datapoints handed to a record sink
//!
//! ```text
//! SampleBatch (one collection tick)
//!   └── SessionSample[]
//!         └── SamplingDecision ──► Correlation ──► DataPoint[]
//! ```

mod decision;
mod point;
mod session;

pub use decision::{SampleReason, SamplingDecision};
pub use point::{
    AttrValue, DataPoint, METRIC_ACTIVE_SESSIONS, METRIC_BLOCKED_SESSIONS,
    METRIC_LONG_RUNNING_QUERIES, METRIC_WAIT_EVENTS,
};
pub use session::{SampleBatch, SessionSample, SessionState};
