//! Core domain model for optimization passes and their cluster assignments.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_N_CLUSTERS: usize = 256;

/// Lifecycle status of a task row, as polled by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Processing => "Processing",
            TaskStatus::Done => "Done",
            TaskStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown task status {0:?}")]
pub struct UnknownTaskStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownTaskStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Pending" => Ok(TaskStatus::Pending),
            "Processing" => Ok(TaskStatus::Processing),
            "Done" => Ok(TaskStatus::Done),
            "Failed" => Ok(TaskStatus::Failed),
            other => Err(UnknownTaskStatus(other.to_string())),
        }
    }
}

/// Performance metrics of a pass that take part in clustering.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PassMetrics {
    pub profit: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub balance_dd_relative: f64,
    pub equity_dd_relative: f64,
    pub expected_payoff: f64,
    pub profit_factor: f64,
    pub recovery_factor: f64,
    pub sharpe_ratio: f64,
    pub trades: f64,
    pub complex_criterion: f64,
    pub custom_ontester: f64,
}

/// Named projection of a pass onto the clustering feature space.
///
/// Columns are always addressed by name so that a reordered `passes` table
/// cannot silently change which metrics are clustered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureColumn {
    Profit,
    GrossProfit,
    GrossLoss,
    BalanceDdRelative,
    EquityDdRelative,
    ExpectedPayoff,
    ProfitFactor,
    RecoveryFactor,
    SharpeRatio,
    Trades,
    ComplexCriterion,
    CustomOntester,
}

impl FeatureColumn {
    /// Projection order of the feature vector.
    pub const ALL: [FeatureColumn; 12] = [
        FeatureColumn::Profit,
        FeatureColumn::GrossProfit,
        FeatureColumn::GrossLoss,
        FeatureColumn::BalanceDdRelative,
        FeatureColumn::EquityDdRelative,
        FeatureColumn::ExpectedPayoff,
        FeatureColumn::ProfitFactor,
        FeatureColumn::RecoveryFactor,
        FeatureColumn::SharpeRatio,
        FeatureColumn::Trades,
        FeatureColumn::ComplexCriterion,
        FeatureColumn::CustomOntester,
    ];

    pub const DIMENSIONS: usize = Self::ALL.len();

    pub fn column_name(&self) -> &'static str {
        match self {
            FeatureColumn::Profit => "profit",
            FeatureColumn::GrossProfit => "gross_profit",
            FeatureColumn::GrossLoss => "gross_loss",
            FeatureColumn::BalanceDdRelative => "balance_dd_relative",
            FeatureColumn::EquityDdRelative => "equity_dd_relative",
            FeatureColumn::ExpectedPayoff => "expected_payoff",
            FeatureColumn::ProfitFactor => "profit_factor",
            FeatureColumn::RecoveryFactor => "recovery_factor",
            FeatureColumn::SharpeRatio => "sharpe_ratio",
            FeatureColumn::Trades => "trades",
            FeatureColumn::ComplexCriterion => "complex_criterion",
            FeatureColumn::CustomOntester => "custom_ontester",
        }
    }

    pub fn value(&self, metrics: &PassMetrics) -> f64 {
        match self {
            FeatureColumn::Profit => metrics.profit,
            FeatureColumn::GrossProfit => metrics.gross_profit,
            FeatureColumn::GrossLoss => metrics.gross_loss,
            FeatureColumn::BalanceDdRelative => metrics.balance_dd_relative,
            FeatureColumn::EquityDdRelative => metrics.equity_dd_relative,
            FeatureColumn::ExpectedPayoff => metrics.expected_payoff,
            FeatureColumn::ProfitFactor => metrics.profit_factor,
            FeatureColumn::RecoveryFactor => metrics.recovery_factor,
            FeatureColumn::SharpeRatio => metrics.sharpe_ratio,
            FeatureColumn::Trades => metrics.trades,
            FeatureColumn::ComplexCriterion => metrics.complex_criterion,
            FeatureColumn::CustomOntester => metrics.custom_ontester,
        }
    }

    pub fn slot_mut<'a>(&self, metrics: &'a mut PassMetrics) -> &'a mut f64 {
        match self {
            FeatureColumn::Profit => &mut metrics.profit,
            FeatureColumn::GrossProfit => &mut metrics.gross_profit,
            FeatureColumn::GrossLoss => &mut metrics.gross_loss,
            FeatureColumn::BalanceDdRelative => &mut metrics.balance_dd_relative,
            FeatureColumn::EquityDdRelative => &mut metrics.equity_dd_relative,
            FeatureColumn::ExpectedPayoff => &mut metrics.expected_payoff,
            FeatureColumn::ProfitFactor => &mut metrics.profit_factor,
            FeatureColumn::RecoveryFactor => &mut metrics.recovery_factor,
            FeatureColumn::SharpeRatio => &mut metrics.sharpe_ratio,
            FeatureColumn::Trades => &mut metrics.trades,
            FeatureColumn::ComplexCriterion => &mut metrics.complex_criterion,
            FeatureColumn::CustomOntester => &mut metrics.custom_ontester,
        }
    }
}

/// One optimization trial result, linked to the task and job that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pass {
    pub id_pass: i64,
    pub id_task: i64,
    pub id_job: i64,
    pub metrics: PassMetrics,
}

impl Pass {
    pub fn feature_vector(&self) -> [f64; FeatureColumn::DIMENSIONS] {
        FeatureColumn::ALL.map(|column| column.value(&self.metrics))
    }
}

/// Inclusive minimums a pass must reach to be considered for clustering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub min_custom_ontester: f64,
    pub min_trades: f64,
    pub min_sharpe_ratio: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_custom_ontester: 0.0,
            min_trades: 40.0,
            min_sharpe_ratio: 0.7,
        }
    }
}

impl QualityThresholds {
    pub fn is_finite(&self) -> bool {
        self.min_custom_ontester.is_finite()
            && self.min_trades.is_finite()
            && self.min_sharpe_ratio.is_finite()
    }

    /// In-memory form of the store-side quality predicate (job membership excluded).
    pub fn admits(&self, metrics: &PassMetrics) -> bool {
        metrics.profit > 0.0
            && metrics.custom_ontester >= self.min_custom_ontester
            && metrics.trades >= self.min_trades
            && metrics.sharpe_ratio >= self.min_sharpe_ratio
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParentJobsError {
    #[error("no parent job id given")]
    Empty,
    #[error("invalid parent job id {0:?}")]
    InvalidId(String),
}

/// Non-empty set of parent job ids whose passes are eligible for clustering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentJobs(Vec<i64>);

impl ParentJobs {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Result<Self, ParentJobsError> {
        let mut out: Vec<i64> = Vec::new();
        for id in ids {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        if out.is_empty() {
            return Err(ParentJobsError::Empty);
        }
        Ok(Self(out))
    }

    pub fn ids(&self) -> &[i64] {
        &self.0
    }

    pub fn contains(&self, id_job: i64) -> bool {
        self.0.contains(&id_job)
    }
}

impl FromStr for ParentJobs {
    type Err = ParentJobsError;

    /// Parses `"7"`, `"7,8"` or `"7, 8 9"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ids = s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .map(|token| {
                token
                    .parse::<i64>()
                    .map_err(|_| ParentJobsError::InvalidId(token.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(ids)
    }
}

impl fmt::Display for ParentJobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

/// Persisted link between a representative pass and its cluster for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub id_task: i64,
    pub id_pass: i64,
    pub cluster: i64,
}
