//! Sampling decisions made by the adaptive sampler.

use serde::{Deserialize, Serialize};

/// Why a sample was admitted or rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleReason {
    /// Admitted by the hash-vs-rate rule.
    Rate,
    /// Always-sample: session is blocked by another backend.
    Blocked,
    /// Always-sample: query runs longer than the slow threshold.
    LongRunning,
    /// Always-sample: maintenance operation.
    Maintenance,
    /// Not admitted.
    Rejected,
}

impl SampleReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SampleReason::Rate => "rate",
            SampleReason::Blocked => "blocked",
            SampleReason::LongRunning => "long_running",
            SampleReason::Maintenance => "maintenance",
            SampleReason::Rejected => "rejected",
        }
    }
}

/// Per-sample decision plus the rate in force when it was made.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingDecision {
    pub sampled: bool,
    pub rate: f64,
    pub reason: SampleReason,
}

impl SamplingDecision {
    pub fn always(rate: f64, reason: SampleReason) -> Self {
        Self {
            sampled: true,
            rate,
            reason,
        }
    }

    pub fn by_rate(sampled: bool, rate: f64) -> Self {
        Self {
            sampled,
            rate,
            reason: if sampled {
                SampleReason::Rate
            } else {
                SampleReason::Rejected
            },
        }
    }
}
