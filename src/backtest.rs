//! Periodic-rebalancing backtest.
//!
//! Starting from a cash amount, the simulator optimizes and allocates on the starting date
//! using only prices visible on that date, holds the shares, marks them to market every
//! `step_days` and rebalances every `rebalance_period_months` months until `today`.

use crate::allocation::DiscreteAllocation;
use crate::engine::Engine;
use crate::error::{OptimizerError, Result};
use crate::filter::Filters;
use crate::optimizer::{sharpe_ratio, OptimizerParameters, Portfolio};
use crate::prices::PriceMatrixBuilder;
use chrono::{Months, NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Configuration for a backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BacktestParameters {
    /// Cash at the starting date.
    pub initial_value: f64,
    pub starting_date: NaiveDate,
    /// Calendar months between rebalances.
    pub rebalance_period_months: u32,
    /// Days between mark-to-market snapshots.
    pub step_days: u32,
    /// Last simulated date. The current UTC date when unset.
    pub today: Option<NaiveDate>,
    /// Show a progress bar while simulating.
    #[serde(skip)]
    pub show_progress: bool,
}

impl Default for BacktestParameters {
    fn default() -> Self {
        Self {
            initial_value: 100_000.0,
            starting_date: NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or_default(),
            rebalance_period_months: 12,
            step_days: 7,
            today: None,
            show_progress: false,
        }
    }
}

impl BacktestParameters {
    pub fn end_date(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OptimizerError::InvalidOptimizerParameter(msg));

        if !(self.initial_value > 0.0) || !self.initial_value.is_finite() {
            return invalid(format!("initialValue must be > 0, got {}", self.initial_value));
        }
        if self.rebalance_period_months == 0 {
            return invalid("rebalancePeriodMonths must be at least 1".to_string());
        }
        if self.step_days == 0 {
            return invalid("stepDays must be at least 1".to_string());
        }
        let end = self.end_date();
        if self.starting_date >= end {
            return invalid(format!(
                "startingDate {} must be before {}",
                self.starting_date, end
            ));
        }
        Ok(())
    }
}

/// Portfolio value at one date. Rebalance dates also carry the portfolio chosen there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub date: NaiveDate,
    pub portfolio_value: f64,
    pub portfolio: Option<Portfolio>,
}

impl Snapshot {
    pub fn is_rebalance(&self) -> bool {
        self.portfolio.is_some()
    }
}

/// Terminal metrics of an equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestPerformance {
    pub annual_return: f64,
    pub annual_volatility: f64,
    pub sharpe_ratio: f64,
    pub total_return: f64,
    /// Largest peak-to-trough loss as a positive fraction.
    pub max_drawdown: f64,
}

impl BacktestPerformance {
    /// Score a value curve sampled every `step_days` days.
    pub fn from_history(
        history: &[Snapshot],
        initial_value: f64,
        step_days: u32,
        risk_free_rate: f64,
    ) -> Self {
        let (Some(first), Some(last)) = (history.first(), history.last()) else {
            return Self::default();
        };

        let final_value = last.portfolio_value;
        let days_elapsed = (last.date - first.date).num_days();
        let annual_return = if days_elapsed > 0 && initial_value > 0.0 {
            (final_value / initial_value).powf(365.0 / days_elapsed as f64) - 1.0
        } else {
            0.0
        };

        let values: Vec<f64> = history.iter().map(|s| s.portfolio_value).collect();
        let returns: Vec<f64> = values
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .collect();
        let annual_volatility = sample_std(&returns) * (365.0 / step_days as f64).sqrt();

        Self {
            annual_return,
            annual_volatility,
            sharpe_ratio: sharpe_ratio(annual_return, annual_volatility, risk_free_rate),
            total_return: if initial_value > 0.0 {
                final_value / initial_value - 1.0
            } else {
                0.0
            },
            max_drawdown: max_drawdown(&values),
        }
    }
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0f64;
    for &v in values {
        peak = peak.max(v);
        if peak > 0.0 {
            worst = worst.max((peak - v) / peak);
        }
    }
    worst
}

/// Outcome of a backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub run_id: Uuid,
    pub initial_value: f64,
    pub final_value: f64,
    pub starting_date: NaiveDate,
    pub end_date: NaiveDate,
    pub rebalance_count: usize,
    pub trading_history: Vec<Snapshot>,
    pub performance: BacktestPerformance,
}

/// Shares and cash held between two rebalances.
#[derive(Debug, Clone)]
struct Holdings {
    allocation: DiscreteAllocation,
    /// Last known price per held instrument.
    last_prices: HashMap<String, f64>,
}

impl Holdings {
    fn new(allocation: DiscreteAllocation) -> Self {
        let last_prices = allocation
            .positions
            .iter()
            .map(|(id, p)| (id.clone(), p.price))
            .collect();
        Self {
            allocation,
            last_prices,
        }
    }
}

/// Drives an [`Engine`] through time.
pub struct BacktestSimulator<'a> {
    engine: &'a Engine,
}

impl<'a> BacktestSimulator<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    pub fn run(
        &self,
        optimizer: &OptimizerParameters,
        filters: &Filters,
        params: &BacktestParameters,
    ) -> Result<BacktestResult> {
        params.validate()?;
        optimizer.validate()?;

        let started = Instant::now();
        let end = params.end_date();
        let step = chrono::Duration::days(params.step_days as i64);

        info!(
            "Starting backtest from {} to {} with {:.2}",
            params.starting_date, end, params.initial_value
        );

        let progress = if params.show_progress {
            let pb = ProgressBar::new((end - params.starting_date).num_days().max(0) as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} days ({eta})")
                    .map_err(|e| OptimizerError::ConfigError(e.to_string()))?
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        let mut current_date = params.starting_date;
        let mut current_value = params.initial_value;
        let mut history: Vec<Snapshot> = Vec::new();
        let mut rebalance_count = 0;

        loop {
            let portfolio = self.rebalance(optimizer, filters, current_date, current_value)?;
            rebalance_count += 1;
            let mut holdings = Holdings::new(
                portfolio
                    .allocation
                    .clone()
                    .unwrap_or_else(|| DiscreteAllocation::cash_only(current_value)),
            );

            match history.last_mut() {
                Some(last) if last.date == current_date => last.portfolio = Some(portfolio),
                _ => history.push(Snapshot {
                    date: current_date,
                    portfolio_value: current_value,
                    portfolio: Some(portfolio),
                }),
            }

            let next_rebalance = current_date
                .checked_add_months(Months::new(params.rebalance_period_months))
                .ok_or_else(|| {
                    OptimizerError::DataError(format!(
                        "cannot add {} months to {}",
                        params.rebalance_period_months, current_date
                    ))
                })?;

            while current_date < next_rebalance && current_date < end {
                current_date = (current_date + step).min(next_rebalance).min(end);
                current_value = self.mark_to_market(&mut holdings, current_date);
                history.push(Snapshot {
                    date: current_date,
                    portfolio_value: current_value,
                    portfolio: None,
                });
                if let Some(pb) = &progress {
                    pb.set_position((current_date - params.starting_date).num_days() as u64);
                }
            }

            if current_date >= end {
                break;
            }
        }

        if let Some(pb) = progress {
            pb.finish_with_message("Backtest complete");
        }

        let performance = BacktestPerformance::from_history(
            &history,
            params.initial_value,
            params.step_days,
            optimizer.risk_free_rate,
        );

        info!(
            "Backtest completed in {:?}: final value {:.2}, annual return {:.2}%, {} rebalances",
            started.elapsed(),
            current_value,
            performance.annual_return * 100.0,
            rebalance_count
        );

        Ok(BacktestResult {
            run_id: Uuid::new_v4(),
            initial_value: params.initial_value,
            final_value: current_value,
            starting_date: params.starting_date,
            end_date: current_date,
            rebalance_count,
            trading_history: history,
            performance,
        })
    }

    fn rebalance(
        &self,
        optimizer: &OptimizerParameters,
        filters: &Filters,
        date: NaiveDate,
        budget: f64,
    ) -> Result<Portfolio> {
        debug!("Rebalancing on {} with {:.2}", date, budget);
        let params = OptimizerParameters {
            final_date: Some(date),
            initial_value: Some(budget),
            ..optimizer.clone()
        };
        self.engine.optimize(&params, filters)
    }

    /// Value of the held shares at the latest cleaned price on or before `date`, plus cash.
    fn mark_to_market(&self, holdings: &mut Holdings, date: NaiveDate) -> f64 {
        let held: Vec<_> = holdings
            .allocation
            .positions
            .keys()
            .filter_map(|id| self.engine.universe().get(id))
            .collect();

        let latest = PriceMatrixBuilder::new()
            .final_date(Some(date))
            .build(&held)
            .latest_prices();

        let mut value = holdings.allocation.leftover_cash;
        for (id, position) in &holdings.allocation.positions {
            let price = match latest.get(id) {
                Some(&p) => {
                    holdings.last_prices.insert(id.clone(), p);
                    p
                }
                None => holdings.last_prices.get(id).copied().unwrap_or(position.price),
            };
            value += position.shares as f64 * price;
        }
        value
    }
}
