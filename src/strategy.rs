//! Claiming strategies.
//!
//! A strategy decides which queued task a worker gets next. Every strategy
//! renders to a single SQL selection that runs inside the claim statement,
//! so the choice and the ownership update happen atomically.
//!
//! Starvation: LIFO can starve old tasks under continuous inserts, and
//! Priority can starve low-priority tasks while higher ones keep arriving.
//! WeightedRandom softens the latter but gives no bound.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default candidate pool for weighted sampling.
pub const DEFAULT_TOP_K: u32 = 10;

/// Ordering policy used when a worker asks for the next task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClaimStrategy {
    /// Oldest first.
    #[default]
    Fifo,
    /// Newest first.
    Lifo,
    /// Highest priority first, oldest first within a priority.
    Priority,
    /// Weighted sample among the `top_k` highest-priority tasks.
    WeightedRandom {
        #[serde(default = "default_top_k")]
        top_k: u32,
        #[serde(default)]
        weighting: Weighting,
    },
}

fn default_top_k() -> u32 {
    DEFAULT_TOP_K
}

/// Weight of a candidate as a function of its priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    /// `max(priority, 0) + 1`
    #[default]
    Linear,
    /// `(max(priority, 0) + 1)^2`
    Quadratic,
}

impl Weighting {
    /// SQL expression over the `priority` column. Always >= 1.0.
    ///
    /// Evaluated as REAL: integer `SUM` over large quadratic weights
    /// overflows.
    fn sql(self) -> &'static str {
        match self {
            Weighting::Linear => "(MAX(priority, 0) + 1.0)",
            Weighting::Quadratic => "((MAX(priority, 0) + 1.0) * (MAX(priority, 0) + 1.0))",
        }
    }

    /// Same function evaluated in Rust.
    pub fn weight(self, priority: i32) -> u64 {
        let base = priority.max(0) as u64 + 1;
        match self {
            Weighting::Linear => base,
            Weighting::Quadratic => base * base,
        }
    }
}

const PRIORITY_ORDER: &str = "priority DESC, created_at ASC, seq ASC";

impl ClaimStrategy {
    pub fn weighted() -> Self {
        ClaimStrategy::WeightedRandom {
            top_k: DEFAULT_TOP_K,
            weighting: Weighting::Linear,
        }
    }

    /// ORDER BY clause over queued rows.
    pub fn order_by(&self) -> &'static str {
        match self {
            ClaimStrategy::Fifo => "created_at ASC, seq ASC",
            ClaimStrategy::Lifo => "created_at DESC, seq DESC",
            ClaimStrategy::Priority | ClaimStrategy::WeightedRandom { .. } => PRIORITY_ORDER,
        }
    }

    /// Does the selection consume a random sample?
    pub fn is_random(&self) -> bool {
        matches!(self, ClaimStrategy::WeightedRandom { .. })
    }

    /// Draw the uniform sample in [0, 1) bound into the selection.
    pub fn sample(&self) -> f64 {
        if self.is_random() {
            rand::random::<f64>()
        } else {
            0.0
        }
    }

    /// Subquery yielding the id of the task to claim.
    ///
    /// Binds: `?3` = task type, `?4` = sample in [0, 1). Weighted sampling
    /// walks cumulative weights of the top-K candidates and takes the first
    /// one whose running total exceeds `sample * total`.
    pub fn selection_sql(&self) -> String {
        match self {
            ClaimStrategy::WeightedRandom { top_k, weighting } => format!(
                "WITH candidates AS (
                     SELECT id, priority, created_at, seq, {weight} AS weight
                     FROM tasks
                     WHERE status = 'queued' AND task_type = ?3
                     ORDER BY {PRIORITY_ORDER}
                     LIMIT {k}
                 ),
                 ranked AS (
                     SELECT id,
                            SUM(weight) OVER (ORDER BY {PRIORITY_ORDER} ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW) AS upto,
                            SUM(weight) OVER () AS total
                     FROM candidates
                 )
                 SELECT id FROM ranked WHERE upto > ?4 * total ORDER BY upto LIMIT 1",
                weight = weighting.sql(),
                k = (*top_k).max(1),
            ),
            ordered => format!(
                "SELECT id FROM tasks
                 WHERE status = 'queued' AND task_type = ?3
                 ORDER BY {}
                 LIMIT 1",
                ordered.order_by()
            ),
        }
    }
}

impl std::fmt::Display for ClaimStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimStrategy::Fifo => f.write_str("fifo"),
            ClaimStrategy::Lifo => f.write_str("lifo"),
            ClaimStrategy::Priority => f.write_str("priority"),
            ClaimStrategy::WeightedRandom { top_k, .. } => write!(f, "weighted_random(top_k={top_k})"),
        }
    }
}

impl std::str::FromStr for ClaimStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(ClaimStrategy::Fifo),
            "lifo" => Ok(ClaimStrategy::Lifo),
            "priority" => Ok(ClaimStrategy::Priority),
            "weighted" | "weighted_random" | "weighted-random" => Ok(ClaimStrategy::weighted()),
            other => Err(Error::Config(format!("unknown claiming strategy: {other}"))),
        }
    }
}
