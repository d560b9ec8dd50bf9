//! Expected returns and covariance estimation from a price matrix.
//!
//! Missing prices are gaps: a period return is only defined on rows that carry a price,
//! and it is measured from the previous available price so that no move is lost.

use crate::error::{OptimizerError, Result};
use crate::prices::PriceMatrix;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Trading days per year.
pub const DEFAULT_FREQUENCY: f64 = 252.0;

/// Pivots below this fraction of the largest variance count as zero in [`cholesky`].
const PIVOT_TOLERANCE: f64 = 1e-10;

/// Annualized expected returns and covariance for a set of instruments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimates {
    /// Instrument identifiers, in the order of the vectors below.
    pub ids: Vec<String>,
    pub expected_returns: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
}

impl Estimates {
    pub fn new(ids: Vec<String>, expected_returns: Vec<f64>, covariance: Vec<Vec<f64>>) -> Result<Self> {
        let n = ids.len();
        if expected_returns.len() != n {
            return Err(OptimizerError::DataError(
                "Expected returns length must match number of instruments".to_string(),
            ));
        }
        if covariance.len() != n || covariance.iter().any(|row| row.len() != n) {
            return Err(OptimizerError::DataError(
                "Covariance matrix must be square and match number of instruments".to_string(),
            ));
        }
        Ok(Self {
            ids,
            expected_returns,
            covariance,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Subtract each instrument's annual expense ratio from its expected return.
    pub fn remove_expense_ratios(&mut self, expense_ratios: &HashMap<String, f64>) {
        for (id, expected) in self.ids.iter().zip(self.expected_returns.iter_mut()) {
            if let Some(ter) = expense_ratios.get(id) {
                *expected -= ter;
            }
        }
    }

    /// Expected return of a weight vector.
    pub fn portfolio_return(&self, weights: &[f64]) -> f64 {
        weights
            .iter()
            .zip(&self.expected_returns)
            .map(|(w, r)| w * r)
            .sum()
    }

    /// Variance of a weight vector.
    pub fn portfolio_variance(&self, weights: &[f64]) -> f64 {
        let mut variance = 0.0;
        for (i, wi) in weights.iter().enumerate() {
            for (j, wj) in weights.iter().enumerate() {
                variance += wi * wj * self.covariance[i][j];
            }
        }
        variance
    }

    pub fn portfolio_volatility(&self, weights: &[f64]) -> f64 {
        self.portfolio_variance(weights).max(0.0).sqrt()
    }

    /// Check that every covariance entry is finite and every variance positive.
    pub fn validate(&self) -> Result<()> {
        for (i, id) in self.ids.iter().enumerate() {
            let variance = self.covariance[i][i];
            if !variance.is_finite() || variance <= 0.0 {
                return Err(OptimizerError::SolverFailure(format!(
                    "variance of {} is not positive ({})",
                    id, variance
                )));
            }
            if !self.expected_returns[i].is_finite() {
                return Err(OptimizerError::SolverFailure(format!(
                    "expected return of {} is not finite",
                    id
                )));
            }
            if let Some(j) = self.covariance[i].iter().position(|c| !c.is_finite()) {
                return Err(OptimizerError::SolverFailure(format!(
                    "covariance of {} and {} cannot be estimated (no overlapping returns)",
                    id, self.ids[j]
                )));
            }
        }
        Ok(())
    }
}

/// Period-over-period simple returns; NaN where the price is missing or no earlier
/// price exists.
pub fn period_returns(prices: &[f64]) -> Vec<f64> {
    let mut last: Option<f64> = None;
    prices
        .iter()
        .map(|&p| {
            if p.is_nan() {
                return f64::NAN;
            }
            let r = last.map_or(f64::NAN, |prev| p / prev - 1.0);
            last = Some(p);
            r
        })
        .collect()
}

/// Compounded annualized mean historical return of a price column.
///
/// Equals compounding the forward-filled period returns: the growth between the first and
/// last price, annualized over the number of rows between them.
pub fn mean_historical_return(prices: &[f64], frequency: f64) -> f64 {
    let first = prices.iter().position(|p| !p.is_nan());
    let last = prices.iter().rposition(|p| !p.is_nan());
    match (first, last) {
        (Some(f), Some(l)) if l > f => {
            let growth = prices[l] / prices[f];
            growth.powf(frequency / (l - f) as f64) - 1.0
        }
        _ => f64::NAN,
    }
}

/// Sample covariance (n - 1 denominator) over rows where both series are defined.
/// NaN when fewer than two such rows exist.
pub fn pairwise_covariance(a: &[f64], b: &[f64]) -> f64 {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b)
        .filter(|(x, y)| !x.is_nan() && !y.is_nan())
        .map(|(x, y)| (*x, *y))
        .collect();
    if pairs.len() < 2 {
        return f64::NAN;
    }
    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;
    pairs
        .iter()
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum::<f64>()
        / (n - 1.0)
}

/// Estimates annualized returns and covariance from a price matrix.
#[derive(Debug, Clone, Copy)]
pub struct ReturnsAndRiskEstimator {
    frequency: f64,
}

impl Default for ReturnsAndRiskEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_FREQUENCY)
    }
}

impl ReturnsAndRiskEstimator {
    pub fn new(frequency: f64) -> Self {
        Self { frequency }
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn estimate(&self, prices: &PriceMatrix) -> Result<Estimates> {
        let expected_returns: Vec<f64> = prices
            .columns()
            .iter()
            .map(|c| mean_historical_return(c, self.frequency))
            .collect();

        let returns: Vec<Vec<f64>> = prices.columns().iter().map(|c| period_returns(c)).collect();
        let n = returns.len();
        let mut covariance = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in i..n {
                let cov = pairwise_covariance(&returns[i], &returns[j]) * self.frequency;
                covariance[i][j] = cov;
                covariance[j][i] = cov;
            }
        }

        debug!("Estimated returns and covariance for {} instruments", n);

        let estimates = Estimates::new(prices.ids().to_vec(), expected_returns, covariance)?;
        estimates.validate()?;
        Ok(estimates)
    }
}

/// Lower-triangular factor `L` with `L Lᵀ = matrix` for a positive semidefinite matrix.
///
/// Pivots that vanish up to rounding (duplicated instruments, fewer return rows than
/// instruments) leave a zero column instead of failing. A clearly negative pivot is a
/// solver failure.
pub fn cholesky(matrix: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    let n = matrix.len();
    let scale = (0..n).map(|i| matrix[i][i].abs()).fold(0.0, f64::max);
    let tolerance = PIVOT_TOLERANCE * scale.max(f64::MIN_POSITIVE);

    let mut l = vec![vec![0.0; n]; n];
    for j in 0..n {
        let d = matrix[j][j] - (0..j).map(|k| l[j][k] * l[j][k]).sum::<f64>();
        if d.is_nan() || d < -tolerance {
            return Err(OptimizerError::SolverFailure(
                "covariance matrix is not positive semidefinite".to_string(),
            ));
        }
        if d <= tolerance {
            continue;
        }
        let pivot = d.sqrt();
        l[j][j] = pivot;
        for i in j + 1..n {
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            l[i][j] = (matrix[i][j] - sum) / pivot;
        }
    }
    Ok(l)
}
