//! ETF Optimizer - mean-variance portfolio construction and backtesting for ETF universes.
//!
//! # Overview
//!
//! The crate turns a universe of ETFs with daily closing prices into optimized portfolios
//! and replays those portfolios through time:
//!
//! - **Universe filtering**: allow lists, data sufficiency and categorical metadata filters
//! - **Price cleaning**: outlier spike removal and calendar alignment into a price matrix
//! - **Estimation**: annualized expected returns and sample covariance, net of expense ratios
//! - **Optimization**: max Sharpe, minimum volatility, efficient risk and efficient return
//! - **Discrete allocation**: whole-share allocation of a cash budget
//! - **Backtesting**: periodic rebalancing with weekly mark-to-market and summary statistics
//! - **Configuration files**: TOML-based run files for reproducible runs
//!
//! # Quick Start
//!
//! ```no_run
//! use etf_optimizer::{
//!     data::load_universe,
//!     engine::Engine,
//!     filter::Filters,
//!     optimizer::{OptimizerKind, OptimizerParameters},
//! };
//!
//! let universe = load_universe("data/universe.json").unwrap();
//! let engine = Engine::new(universe);
//!
//! let params = OptimizerParameters {
//!     optimizer: OptimizerKind::MinimumVolatility,
//!     initial_value: Some(10_000.0),
//!     ..Default::default()
//! };
//! let portfolio = engine.optimize(&params, &Filters::default()).unwrap();
//!
//! for (id, weight) in &portfolio.weights {
//!     println!("{}: {:.2}%", id, weight * 100.0);
//! }
//! ```
//!
//! # Modules
//!
//! - [`types`]: Instruments, price points and the universe
//! - [`filter`]: Universe filters and filter domain values
//! - [`prices`]: Spike filter and aligned price matrix
//! - [`estimation`]: Expected returns and covariance
//! - [`solver`]: Conic problem description and the Clarabel backend
//! - [`optimizer`]: Optimization objectives and weight cleaning
//! - [`allocation`]: Whole-share allocation of a budget
//! - [`backtest`]: Rebalancing simulation and performance statistics
//! - [`engine`]: Facade tying the pipeline together
//! - [`data`]: Loading universes from JSON or CSV directories
//! - [`config`]: TOML run configuration
//! - [`report`]: Terminal tables and summaries
//! - [`export`]: CSV and JSON export

pub mod allocation;
pub mod backtest;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod estimation;
pub mod export;
pub mod filter;
pub mod optimizer;
pub mod prices;
pub mod report;
pub mod solver;
pub mod types;

// Re-exports for convenience
pub use allocation::{AllocatedPosition, DiscreteAllocation, DiscreteAllocator};
pub use backtest::{
    BacktestParameters, BacktestPerformance, BacktestResult, BacktestSimulator, Snapshot,
};
pub use engine::{BacktestRun, Engine};
pub use error::{ErrorHelp, OptimizerError, Result};
pub use estimation::{Estimates, ReturnsAndRiskEstimator};
pub use filter::{FilterCounts, FilterDomainValues, Filters, UniverseFilter};
pub use optimizer::{
    clean_weights, OptimizerKind, OptimizerParameters, Performance, Portfolio, PortfolioOptimizer,
    WeightBounds,
};
pub use prices::{PriceMatrix, PriceMatrixBuilder, SpikeFilter};
pub use solver::{ClarabelSolver, ConicProblem, ConicSolver};
pub use types::{Instrument, InstrumentMetadata, PricePoint, Universe};

// Reporting and export
pub use config::RunFileConfig;
pub use export::{export_portfolio_csv, ExportConfig, Exporter};
pub use report::ResultFormatter;
