//! Mean-variance portfolio optimization.
//!
//! Turns annualized [`Estimates`] into portfolio weights for one of four objectives,
//! cleans the weights for presentation and reports the realized performance of the
//! cleaned weights.

use crate::allocation::DiscreteAllocation;
use crate::error::{OptimizerError, Result};
use crate::estimation::{cholesky, Estimates, DEFAULT_FREQUENCY};
use crate::solver::{ConicProblem, ConicSolver};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Optimization objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// Tangency portfolio: maximize (return - risk-free rate) / volatility.
    #[default]
    MaxSharpe,
    /// Global minimum-variance portfolio.
    MinimumVolatility,
    /// Maximize return for a target volatility.
    EfficientRisk,
    /// Minimize volatility for a target return.
    EfficientReturn,
}

impl OptimizerKind {
    pub const ALL: [OptimizerKind; 4] = [
        OptimizerKind::MaxSharpe,
        OptimizerKind::MinimumVolatility,
        OptimizerKind::EfficientRisk,
        OptimizerKind::EfficientReturn,
    ];
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::MaxSharpe => "MaxSharpe",
            OptimizerKind::MinimumVolatility => "MinimumVolatility",
            OptimizerKind::EfficientRisk => "EfficientRisk",
            OptimizerKind::EfficientReturn => "EfficientReturn",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for OptimizerKind {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "maxsharpe" => Ok(OptimizerKind::MaxSharpe),
            "minimumvolatility" | "minvolatility" | "minvol" => Ok(OptimizerKind::MinimumVolatility),
            "efficientrisk" => Ok(OptimizerKind::EfficientRisk),
            "efficientreturn" => Ok(OptimizerKind::EfficientReturn),
            _ => Err(OptimizerError::InvalidOptimizerParameter(format!(
                "unknown optimizer {:?}",
                s
            ))),
        }
    }
}

/// An objective with its target resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Objective {
    MaxSharpe,
    MinimumVolatility,
    EfficientRisk { target_volatility: f64 },
    EfficientReturn { target_return: f64 },
}

/// Per-call optimizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OptimizerParameters {
    pub optimizer: OptimizerKind,
    /// Annual risk-free rate used in the Sharpe ratio.
    pub risk_free_rate: f64,
    /// Required by [`OptimizerKind::EfficientRisk`].
    pub target_volatility: Option<f64>,
    /// Required by [`OptimizerKind::EfficientReturn`].
    pub target_return: Option<f64>,
    /// Allow weights in [-1, 1] instead of [0, 1].
    pub shorting: bool,
    /// Subtract expense ratios from expected returns.
    #[serde(rename = "removeTER")]
    pub remove_ter: bool,
    /// Weights with a smaller magnitude are set to zero.
    pub asset_cutoff: f64,
    /// Decimals kept in cleaned weights.
    pub asset_rounding: u32,
    /// Trailing rows of the price matrix to use (0 = full history).
    pub rolling_window_in_days: usize,
    /// Cap on the number of instruments handed to the solver.
    #[serde(rename = "maxETFListSize")]
    pub max_etf_list_size: usize,
    /// Cash budget for the discrete allocation. No allocation when unset.
    pub initial_value: Option<f64>,
    /// Ignore prices after this date.
    pub final_date: Option<NaiveDate>,
    pub minimum_days_with_data: usize,
    /// Return periods per year.
    pub frequency: f64,
}

impl Default for OptimizerParameters {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::MaxSharpe,
            risk_free_rate: 0.02,
            target_volatility: None,
            target_return: None,
            shorting: false,
            remove_ter: true,
            asset_cutoff: 0.01,
            asset_rounding: 4,
            rolling_window_in_days: 0,
            max_etf_list_size: 600,
            initial_value: None,
            final_date: None,
            minimum_days_with_data: 500,
            frequency: DEFAULT_FREQUENCY,
        }
    }
}

impl OptimizerParameters {
    /// Check the parameters before any computation starts.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OptimizerError::InvalidOptimizerParameter(msg));

        if !self.risk_free_rate.is_finite() {
            return invalid("riskFreeRate must be finite".to_string());
        }
        if !(self.asset_cutoff >= 0.0) {
            return invalid(format!("assetCutoff must be >= 0, got {}", self.asset_cutoff));
        }
        if !(self.frequency > 0.0) {
            return invalid(format!("frequency must be > 0, got {}", self.frequency));
        }
        if self.max_etf_list_size < 2 {
            return invalid("maxETFListSize must allow at least 2 instruments".to_string());
        }
        if self.asset_rounding > MAX_ASSET_ROUNDING {
            return invalid(format!(
                "assetRounding must be at most {}, got {}",
                MAX_ASSET_ROUNDING, self.asset_rounding
            ));
        }
        if let Some(value) = self.initial_value {
            if !(value > 0.0) {
                return invalid(format!("initialValue must be > 0, got {}", value));
            }
        }
        self.objective().map(|_| ())
    }

    /// Resolve the objective and its target.
    pub fn objective(&self) -> Result<Objective> {
        match self.optimizer {
            OptimizerKind::MaxSharpe => Ok(Objective::MaxSharpe),
            OptimizerKind::MinimumVolatility => Ok(Objective::MinimumVolatility),
            OptimizerKind::EfficientRisk => match self.target_volatility {
                Some(v) if v > 0.0 && v.is_finite() => Ok(Objective::EfficientRisk {
                    target_volatility: v,
                }),
                Some(v) => Err(OptimizerError::InvalidOptimizerParameter(format!(
                    "targetVolatility must be > 0, got {}",
                    v
                ))),
                None => Err(OptimizerError::InvalidOptimizerParameter(
                    "EfficientRisk requires targetVolatility".to_string(),
                )),
            },
            OptimizerKind::EfficientReturn => match self.target_return {
                Some(r) if r.is_finite() => Ok(Objective::EfficientReturn { target_return: r }),
                Some(r) => Err(OptimizerError::InvalidOptimizerParameter(format!(
                    "targetReturn must be finite, got {}",
                    r
                ))),
                None => Err(OptimizerError::InvalidOptimizerParameter(
                    "EfficientReturn requires targetReturn".to_string(),
                )),
            },
        }
    }

    pub fn weight_bounds(&self) -> WeightBounds {
        if self.shorting {
            WeightBounds::SHORTING
        } else {
            WeightBounds::LONG_ONLY
        }
    }
}

/// Per-asset weight bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightBounds {
    pub lower: f64,
    pub upper: f64,
}

impl WeightBounds {
    pub const LONG_ONLY: WeightBounds = WeightBounds {
        lower: 0.0,
        upper: 1.0,
    };
    pub const SHORTING: WeightBounds = WeightBounds {
        lower: -1.0,
        upper: 1.0,
    };

    pub fn contains(&self, weight: f64) -> bool {
        weight >= self.lower && weight <= self.upper
    }
}

/// Expected return, volatility and Sharpe ratio of a set of weights.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub expected_return: f64,
    pub annual_volatility: f64,
    pub sharpe_ratio: f64,
}

impl Performance {
    pub fn new(expected_return: f64, annual_volatility: f64, risk_free_rate: f64) -> Self {
        Self {
            expected_return,
            annual_volatility,
            sharpe_ratio: sharpe_ratio(expected_return, annual_volatility, risk_free_rate),
        }
    }

    pub fn of_weights(estimates: &Estimates, weights: &[f64], risk_free_rate: f64) -> Self {
        Self::new(
            estimates.portfolio_return(weights),
            estimates.portfolio_volatility(weights),
            risk_free_rate,
        )
    }
}

/// (return - risk-free rate) / volatility, or 0 for a riskless portfolio.
pub fn sharpe_ratio(expected_return: f64, volatility: f64, risk_free_rate: f64) -> f64 {
    if volatility > 0.0 {
        (expected_return - risk_free_rate) / volatility
    } else {
        0.0
    }
}

/// Optimizer output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub optimizer: OptimizerKind,
    /// Non-zero cleaned weights by instrument id.
    pub weights: BTreeMap<String, f64>,
    pub performance: Performance,
    /// Sum of the weights; below 1 when small positions were cut off.
    pub total: f64,
    pub allocation: Option<DiscreteAllocation>,
}

impl Portfolio {
    pub fn weight(&self, id: &str) -> f64 {
        self.weights.get(id).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Largest accepted `assetRounding`; finer steps no longer fit the integer step count.
pub const MAX_ASSET_ROUNDING: u32 = 15;

/// Round weights to `rounding` decimals and zero out those whose rounded magnitude is below
/// `cutoff`.
///
/// When rounding lifts the sum above 1, the excess is taken back in rounding steps from the
/// largest weights. The result is otherwise not renormalized.
pub fn clean_weights(weights: &[f64], bounds: WeightBounds, cutoff: f64, rounding: u32) -> Vec<f64> {
    let scale = 10f64.powi(rounding.min(MAX_ASSET_ROUNDING) as i32);
    let lower = (bounds.lower * scale).ceil() as i64;
    let upper = (bounds.upper * scale).floor() as i64;
    let below_cutoff = |s: i64| (s.abs() as f64 / scale) < cutoff;

    // Weights as integer multiples of the rounding step.
    let mut steps: Vec<i64> = weights
        .iter()
        .map(|&w| {
            let s = ((w.clamp(bounds.lower, bounds.upper) * scale).round() as i64).clamp(lower, upper);
            if below_cutoff(s) {
                0
            } else {
                s
            }
        })
        .collect();

    let one = scale as i64;
    if steps.iter().sum::<i64>() > one {
        // Cap the positive weights at the highest level that keeps the sum at or below 1,
        // then hand the remaining steps back to capped weights in order.
        let capped_sum = |level: i64| -> i64 { steps.iter().map(|&s| s.min(level)).sum() };
        let (mut low, mut high) = (0, steps.iter().copied().max().unwrap_or(0));
        while low < high {
            let mid = (low + high + 1) / 2;
            if capped_sum(mid) <= one {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        let mut slack = one - capped_sum(low);
        for s in steps.iter_mut().filter(|s| **s > low) {
            *s = if slack > 0 {
                slack -= 1;
                low + 1
            } else {
                low
            };
            if below_cutoff(*s) {
                *s = 0;
            }
        }
    }

    steps.into_iter().map(|s| s as f64 / scale).collect()
}

/// Drives the solver for each objective.
pub struct PortfolioOptimizer<'a> {
    solver: &'a dyn ConicSolver,
    estimates: &'a Estimates,
    bounds: WeightBounds,
}

impl<'a> PortfolioOptimizer<'a> {
    pub fn new(solver: &'a dyn ConicSolver, estimates: &'a Estimates, bounds: WeightBounds) -> Self {
        Self {
            solver,
            estimates,
            bounds,
        }
    }

    fn budget_problem(&self, num_variables: usize) -> ConicProblem {
        let n = self.estimates.len();
        let mut ones = vec![1.0; n];
        ones.resize(num_variables, 0.0);
        let mut problem = ConicProblem::new(num_variables).equal(ones, 1.0);
        for i in 0..n {
            problem = problem.bounded(i, self.bounds.lower, self.bounds.upper);
        }
        problem
    }

    /// Minimize variance with fully invested, bounded weights.
    pub fn minimum_volatility(&self) -> Result<Vec<f64>> {
        let n = self.estimates.len();
        let problem = self
            .budget_problem(n)
            .quadratic(self.estimates.covariance.clone());
        self.solver.solve(&problem)
    }

    /// Maximize the Sharpe ratio.
    ///
    /// Solved as: minimize yᵀΣy subject to (μ - rf)ᵀy = 1, Σy = k, k >= 0 and the bounds
    /// scaled by k. The weights are y / k.
    pub fn max_sharpe(&self, risk_free_rate: f64) -> Result<Vec<f64>> {
        let n = self.estimates.len();
        let excess: Vec<f64> = self
            .estimates
            .expected_returns
            .iter()
            .map(|r| r - risk_free_rate)
            .collect();

        if excess.iter().all(|&r| r <= 0.0) {
            return Err(OptimizerError::SolverFailure(
                "at least one asset must have an expected return exceeding the risk-free rate"
                    .to_string(),
            ));
        }

        let mut p = vec![vec![0.0; n + 1]; n + 1];
        for i in 0..n {
            p[i][..n].copy_from_slice(&self.estimates.covariance[i]);
        }

        let mut excess_row = excess;
        excess_row.push(0.0);
        let mut sum_row = vec![1.0; n];
        sum_row.push(-1.0);
        let mut k_unit = vec![0.0; n + 1];
        k_unit[n] = 1.0;

        let mut problem = ConicProblem::new(n + 1)
            .quadratic(p)
            .equal(excess_row, 1.0)
            .equal(sum_row, 0.0)
            .greater_equal(k_unit, 0.0);
        for i in 0..n {
            // y_i <= upper * k and y_i >= lower * k
            let mut upper = vec![0.0; n + 1];
            upper[i] = 1.0;
            upper[n] = -self.bounds.upper;
            let mut lower = vec![0.0; n + 1];
            lower[i] = 1.0;
            lower[n] = -self.bounds.lower;
            problem = problem.less_equal(upper, 0.0).greater_equal(lower, 0.0);
        }

        let solution = self.solver.solve(&problem)?;
        let k = solution[n];
        if !(k > 1e-12) {
            return Err(OptimizerError::SolverFailure(format!(
                "max Sharpe scaling factor degenerate: {}",
                k
            )));
        }
        Ok(solution[..n].iter().map(|y| y / k).collect())
    }

    /// Highest expected return attainable under the weight constraints.
    pub fn max_attainable_return(&self) -> Result<f64> {
        let n = self.estimates.len();
        let negated: Vec<f64> = self.estimates.expected_returns.iter().map(|r| -r).collect();
        let problem = self.budget_problem(n).linear(negated);
        let weights = self.solver.solve(&problem)?;
        Ok(self.estimates.portfolio_return(&weights))
    }

    /// Minimize variance for a return of at least `target_return`.
    pub fn efficient_return(&self, target_return: f64) -> Result<Vec<f64>> {
        let max_return = self.max_attainable_return()?;
        if target_return > max_return + 1e-9 {
            return Err(OptimizerError::InvalidOptimizerParameter(format!(
                "targetReturn {:.4} must be lower than the maximum possible return {:.4}",
                target_return, max_return
            )));
        }

        let n = self.estimates.len();
        let problem = self
            .budget_problem(n)
            .quadratic(self.estimates.covariance.clone())
            .greater_equal(self.estimates.expected_returns.clone(), target_return);
        self.solver.solve(&problem)
    }

    /// Maximize expected return for a volatility of at most `target_volatility`.
    pub fn efficient_risk(&self, target_volatility: f64) -> Result<Vec<f64>> {
        let min_vol_weights = self.minimum_volatility()?;
        let min_volatility = self.estimates.portfolio_volatility(&min_vol_weights);
        if target_volatility < min_volatility - 1e-9 {
            return Err(OptimizerError::InvalidOptimizerParameter(format!(
                "the minimum volatility is {:.4}, use a higher targetVolatility",
                min_volatility
            )));
        }

        let n = self.estimates.len();
        let l = cholesky(&self.estimates.covariance)?;
        // ‖Lᵀw‖ = sqrt(wᵀΣw)
        let rows: Vec<Vec<f64>> = (0..n).map(|i| (0..n).map(|j| l[j][i]).collect()).collect();
        let negated: Vec<f64> = self.estimates.expected_returns.iter().map(|r| -r).collect();
        let problem = self
            .budget_problem(n)
            .linear(negated)
            .norm_bound(rows, target_volatility);
        self.solver.solve(&problem)
    }

    /// Solve for the raw (uncleaned) weights of an objective.
    pub fn raw_weights(&self, objective: Objective, risk_free_rate: f64) -> Result<Vec<f64>> {
        debug!("Solving {:?} over {} instruments", objective, self.estimates.len());
        let weights = match objective {
            Objective::MaxSharpe => self.max_sharpe(risk_free_rate)?,
            Objective::MinimumVolatility => self.minimum_volatility()?,
            Objective::EfficientRisk { target_volatility } => self.efficient_risk(target_volatility)?,
            Objective::EfficientReturn { target_return } => self.efficient_return(target_return)?,
        };

        if weights.len() != self.estimates.len() || weights.iter().any(|w| !w.is_finite()) {
            return Err(OptimizerError::SolverFailure(
                "solver returned a malformed weight vector".to_string(),
            ));
        }
        Ok(weights)
    }

    /// Solve, clean and score. Returns the cleaned weights in estimate order and their
    /// performance against the original estimates.
    pub fn optimize(&self, params: &OptimizerParameters) -> Result<(Vec<f64>, Performance)> {
        let objective = params.objective()?;
        let raw = self.raw_weights(objective, params.risk_free_rate)?;
        let cleaned = clean_weights(&raw, self.bounds, params.asset_cutoff, params.asset_rounding);
        let performance = Performance::of_weights(self.estimates, &cleaned, params.risk_free_rate);

        info!(
            "{}: expected return {:.4}, volatility {:.4}, sharpe {:.4}",
            params.optimizer,
            performance.expected_return,
            performance.annual_volatility,
            performance.sharpe_ratio
        );

        Ok((cleaned, performance))
    }
}
