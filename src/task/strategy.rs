//! Report strategies
//!
//! A strategy decides how many parts a subtask contributes to its parent,
//! given the subtask's own total. The subtask's tracker then rescales its
//! progress onto that ceiling as it reports.

use crate::task::types::*;
use std::fmt;
use std::sync::Arc;

type ManualFn = dyn Fn(u64) -> i64 + Send + Sync;

#[derive(Clone)]
enum Policy {
    None,
    All,
    Constant(u64),
    Scale(f64),
    Manual(Arc<ManualFn>),
}

/// Policy converting a subtask's own parts into parts reported upward
#[derive(Clone)]
pub struct ReportStrategy {
    policy: Policy,
}

impl ReportStrategy {
    /// Report nothing. Peers stay balanced, granularity is lost.
    pub fn none() -> Self {
        Self {
            policy: Policy::None,
        }
    }

    /// Report every part. Maximum granularity, but a large subtask can
    /// dominate its peers.
    pub fn all() -> Self {
        Self { policy: Policy::All }
    }

    /// Every subtask contributes exactly `parts`, whatever its own total
    pub fn constant(parts: u64) -> Result<Self> {
        if parts >= MAX_PARTS {
            return Err(TaskError::invalid(format!(
                "constant strategy parts {} exceed the maximum of {}",
                parts,
                MAX_PARTS - 1
            )));
        }
        Ok(Self {
            policy: Policy::Constant(parts),
        })
    }

    /// Contribute `total * factor`, with `factor` in `[0, 1]`
    pub fn scale(factor: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(TaskError::invalid(format!(
                "scale factor {} is outside [0, 1]",
                factor
            )));
        }
        Ok(Self {
            policy: Policy::Scale(factor),
        })
    }

    /// Caller-supplied mapping from a subtask total to reported parts.
    ///
    /// The mapping must be monotonic. Results outside `[0, MAX_PARTS)` are
    /// reported as protocol violations when the mapping is applied.
    pub fn manual<F>(mapping: F) -> Self
    where
        F: Fn(u64) -> i64 + Send + Sync + 'static,
    {
        Self {
            policy: Policy::Manual(Arc::new(mapping)),
        }
    }

    /// Number of parts a subtask with `total` parts reports to its parent
    pub fn parts_to_report(&self, total: u64) -> Result<u64> {
        match &self.policy {
            Policy::None => Ok(0),
            Policy::All => Ok(total),
            Policy::Constant(parts) => Ok(*parts),
            Policy::Scale(factor) => {
                let scaled = (total as f64 * factor).floor() as u64;
                Ok(scaled.min(total))
            }
            Policy::Manual(mapping) => {
                let parts = mapping(total);
                if parts < 0 || parts as u64 >= MAX_PARTS {
                    return Err(TaskError::protocol(format!(
                        "manual report strategy mapped {} parts to {}",
                        total, parts
                    )));
                }
                Ok(parts as u64)
            }
        }
    }
}

impl Default for ReportStrategy {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for ReportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.policy {
            Policy::None => write!(f, "ReportStrategy::None"),
            Policy::All => write!(f, "ReportStrategy::All"),
            Policy::Constant(parts) => write!(f, "ReportStrategy::Constant({})", parts),
            Policy::Scale(factor) => write!(f, "ReportStrategy::Scale({})", factor),
            Policy::Manual(_) => write!(f, "ReportStrategy::Manual(..)"),
        }
    }
}
