//! In-memory executor and canned session scenarios for tests.

mod executor;
mod scenarios;

pub use executor::MockExecutor;
pub use scenarios::{SIMPLE_PLAN_JSON, blocking_chain, busy_system, mixed_workload};
