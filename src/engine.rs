//! Entry points over a loaded universe.

use crate::allocation::DiscreteAllocator;
use crate::backtest::{BacktestParameters, BacktestResult, BacktestSimulator};
use crate::error::{OptimizerError, Result};
use crate::estimation::ReturnsAndRiskEstimator;
use crate::filter::{self, FilterCounts, FilterDomainValues, Filters, UniverseFilter};
use crate::optimizer::{OptimizerParameters, Portfolio, PortfolioOptimizer};
use crate::prices::PriceMatrixBuilder;
use crate::solver::{ClarabelSolver, ConicSolver};
use crate::types::Universe;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{info, warn};

/// One backtest configuration for [`Engine::backtest_many`].
#[derive(Debug, Clone, Default)]
pub struct BacktestRun {
    pub optimizer: OptimizerParameters,
    pub filters: Filters,
    pub backtest: BacktestParameters,
}

/// Optimization and backtesting over an immutable universe snapshot.
pub struct Engine {
    universe: Universe,
    solver: Box<dyn ConicSolver>,
}

impl Engine {
    /// Create an engine backed by the Clarabel solver.
    pub fn new(universe: Universe) -> Self {
        Self::with_solver(universe, Box::new(ClarabelSolver::default()))
    }

    pub fn with_solver(universe: Universe, solver: Box<dyn ConicSolver>) -> Self {
        Self { universe, solver }
    }

    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    pub fn solver(&self) -> &dyn ConicSolver {
        self.solver.as_ref()
    }

    /// Filter, estimate, optimize and (when `initial_value` is set) allocate.
    pub fn optimize(&self, params: &OptimizerParameters, filters: &Filters) -> Result<Portfolio> {
        params.validate()?;
        let started = Instant::now();

        let instruments = UniverseFilter::new(params.minimum_days_with_data, params.max_etf_list_size)
            .as_of(params.final_date)
            .apply(&self.universe, filters)?;

        let prices = PriceMatrixBuilder::new()
            .final_date(params.final_date)
            .rolling_window(params.rolling_window_in_days)
            .build(&instruments);
        match prices.width() {
            0 => return Err(OptimizerError::FilterExhausted),
            1 => return Err(OptimizerError::InsufficientUniverse { remaining: 1 }),
            _ => {}
        }

        let mut estimates = ReturnsAndRiskEstimator::new(params.frequency).estimate(&prices)?;
        if params.remove_ter {
            let expense_ratios: HashMap<String, f64> = instruments
                .iter()
                .map(|i| (i.id.clone(), i.metadata.expense_ratio))
                .collect();
            estimates.remove_expense_ratios(&expense_ratios);
        }

        let (weights, performance) =
            PortfolioOptimizer::new(self.solver(), &estimates, params.weight_bounds())
                .optimize(params)?;

        let weights: BTreeMap<String, f64> = estimates
            .ids
            .iter()
            .cloned()
            .zip(weights)
            .filter(|(_, w)| *w != 0.0)
            .collect();
        let total = weights.values().sum();

        let allocation = match params.initial_value {
            Some(budget) => {
                let pairs: Vec<(String, f64)> =
                    weights.iter().map(|(id, w)| (id.clone(), *w)).collect();
                Some(DiscreteAllocator::new(self.solver()).allocate(
                    &pairs,
                    &prices.latest_prices(),
                    budget,
                )?)
            }
            None => None,
        };

        info!(
            "Optimized {} instruments into {} positions in {:?}",
            estimates.len(),
            weights.len(),
            started.elapsed()
        );

        Ok(Portfolio {
            optimizer: params.optimizer,
            weights,
            performance,
            total,
            allocation,
        })
    }

    /// Count the instruments matching `filters`. Never fails.
    pub fn filter_universe(&self, filters: &Filters) -> FilterCounts {
        filter::count_matching(&self.universe, filters)
    }

    pub fn backtest(
        &self,
        optimizer: &OptimizerParameters,
        filters: &Filters,
        params: &BacktestParameters,
    ) -> Result<BacktestResult> {
        BacktestSimulator::new(self).run(optimizer, filters, params)
    }

    /// Run independent backtests in parallel. Progress bars are disabled for every run.
    pub fn backtest_many(&self, runs: &[BacktestRun]) -> Vec<Result<BacktestResult>> {
        runs.par_iter()
            .map(|run| {
                let backtest = BacktestParameters {
                    show_progress: false,
                    ..run.backtest.clone()
                };
                let result = self.backtest(&run.optimizer, &run.filters, &backtest);
                if let Err(e) = &result {
                    warn!("Backtest run failed: {}", e);
                }
                result
            })
            .collect()
    }

    pub fn list_filter_domain_values(&self) -> FilterDomainValues {
        filter::filter_domain_values(&self.universe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerKind;
    use crate::types::{Instrument, InstrumentMetadata, PricePoint};
    use chrono::{Duration, NaiveDate};

    fn instrument(id: &str, drift: f64, amplitude: f64, frequency: f64) -> Instrument {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let history = (0..600)
            .map(|i| {
                let t = i as f64;
                let close = 100.0 * (1.0 + drift * t) + amplitude * (t * frequency).sin();
                PricePoint::new(start + Duration::days(i), close)
            })
            .collect();
        Instrument::new(
            id,
            InstrumentMetadata {
                name: format!("Fund {}", id),
                isin: format!("IE000{}", id),
                domicile_country: "Ireland".to_string(),
                fund_currency: "EUR".to_string(),
                expense_ratio: 0.002,
                ..Default::default()
            },
            history,
        )
        .unwrap()
    }

    fn engine() -> Engine {
        Engine::new(Universe::new(vec![
            instrument("A", 0.0008, 2.0, 0.31),
            instrument("B", 0.0005, 1.0, 0.17),
            instrument("C", 0.0003, 0.5, 0.73),
        ]))
    }

    #[test]
    fn test_minimum_volatility_long_only() {
        let params = OptimizerParameters {
            optimizer: OptimizerKind::MinimumVolatility,
            ..Default::default()
        };
        let portfolio = engine().optimize(&params, &Filters::default()).unwrap();
        assert!(portfolio.total <= 1.0 + 1e-12);
        assert!(portfolio.weights.values().all(|&w| w >= 0.0));
        assert!(portfolio.allocation.is_none());
    }

    #[test]
    fn test_optimize_with_budget_allocates() {
        let params = OptimizerParameters {
            initial_value: Some(10_000.0),
            ..Default::default()
        };
        let portfolio = engine().optimize(&params, &Filters::default()).unwrap();
        let allocation = portfolio.allocation.unwrap();
        assert!(allocation.invested() <= 10_000.0 + 1e-9);
        assert!(allocation.leftover_cash >= 0.0);
    }

    #[test]
    fn test_domicile_filter_exhausts() {
        let filters = Filters {
            domicile_country: Some("Luxembourg".to_string()),
            ..Default::default()
        };
        let result = engine().optimize(&OptimizerParameters::default(), &filters);
        assert!(matches!(result, Err(OptimizerError::FilterExhausted)));
    }

    #[test]
    fn test_filter_universe_counts() {
        let counts = engine().filter_universe(&Filters::default());
        assert_eq!(counts.matching_count, 3);
        assert_eq!(counts.total_count, 3);
    }

    #[test]
    fn test_list_filter_domain_values() {
        let values = engine().list_filter_domain_values();
        assert_eq!(values.domicile_countries, vec!["Ireland"]);
        assert_eq!(values.available_optimizers.len(), 4);
    }
}
