//! Integration tests for the optimization and backtest pipeline.

use chrono::{Duration, NaiveDate};
use etf_optimizer::config::RunFileConfig;
use etf_optimizer::data::{load_universe, save_universe_json};
use etf_optimizer::engine::{BacktestRun, Engine};
use etf_optimizer::error::OptimizerError;
use etf_optimizer::filter::Filters;
use etf_optimizer::optimizer::{OptimizerKind, OptimizerParameters};
use etf_optimizer::types::{Instrument, InstrumentMetadata, PricePoint, Universe};
use etf_optimizer::BacktestParameters;
use tempfile::tempdir;

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
}

/// Daily closes with a linear drift and a sine wave so that no two series are collinear.
fn synthetic_instrument(
    id: &str,
    days: i64,
    drift: f64,
    amplitude: f64,
    frequency: f64,
    domicile: &str,
) -> Instrument {
    let history = (0..days)
        .map(|i| {
            let t = i as f64;
            let close = 100.0 * (1.0 + drift * t) + amplitude * (t * frequency).sin();
            PricePoint::new(start() + Duration::days(i), close)
        })
        .collect();

    Instrument::new(
        id,
        InstrumentMetadata {
            name: format!("Synthetic {}", id),
            isin: format!("IE00SYN{}", id),
            domicile_country: domicile.to_string(),
            replication_method: "Physical".to_string(),
            distribution_policy: "Accumulating".to_string(),
            fund_currency: "EUR".to_string(),
            expense_ratio: 0.002,
            ..Default::default()
        },
        history,
    )
    .unwrap()
}

fn create_universe(days: i64) -> Universe {
    Universe::new(vec![
        synthetic_instrument("A", days, 0.0008, 2.0, 0.31, "Ireland"),
        synthetic_instrument("B", days, 0.0005, 1.0, 0.17, "Ireland"),
        synthetic_instrument("C", days, 0.0003, 0.5, 0.73, "Luxembourg"),
    ])
}

/// Rebuild `universe` with every history passed through `f`.
fn map_histories(universe: &Universe, f: impl Fn(&[PricePoint]) -> Vec<PricePoint>) -> Universe {
    Universe::new(
        universe
            .iter()
            .map(|i| Instrument::new(i.id.clone(), i.metadata.clone(), f(&i.history)).unwrap())
            .collect(),
    )
}

fn min_volatility() -> OptimizerParameters {
    OptimizerParameters {
        optimizer: OptimizerKind::MinimumVolatility,
        minimum_days_with_data: 100,
        ..Default::default()
    }
}

#[test]
fn test_minimum_volatility_end_to_end() {
    let engine = Engine::new(create_universe(600));
    let portfolio = engine.optimize(&min_volatility(), &Filters::default()).unwrap();

    assert_eq!(portfolio.optimizer, OptimizerKind::MinimumVolatility);
    assert!(!portfolio.is_empty());
    assert!(portfolio.total > 0.9 && portfolio.total <= 1.0 + 1e-12);
    assert!(portfolio.weights.values().all(|&w| (0.0..=1.0).contains(&w)));
    assert!(portfolio.performance.annual_volatility > 0.0);
}

#[test]
fn test_objectives_on_the_same_universe() {
    let engine = Engine::new(create_universe(600));

    let min_vol = engine.optimize(&min_volatility(), &Filters::default()).unwrap();
    let max_sharpe = engine
        .optimize(
            &OptimizerParameters {
                optimizer: OptimizerKind::MaxSharpe,
                ..min_volatility()
            },
            &Filters::default(),
        )
        .unwrap();

    // Cutoff and rounding move both portfolios slightly off their optima.
    assert!(
        min_vol.performance.annual_volatility
            <= max_sharpe.performance.annual_volatility + 1e-2
    );
    assert!(max_sharpe.performance.sharpe_ratio >= min_vol.performance.sharpe_ratio - 5e-2);
}

#[test]
fn test_efficient_risk_respects_target() {
    let engine = Engine::new(create_universe(600));
    let min_vol = engine.optimize(&min_volatility(), &Filters::default()).unwrap();
    let target = min_vol.performance.annual_volatility * 1.5;

    let params = OptimizerParameters {
        optimizer: OptimizerKind::EfficientRisk,
        target_volatility: Some(target),
        ..min_volatility()
    };
    let portfolio = engine.optimize(&params, &Filters::default()).unwrap();
    assert!(portfolio.performance.annual_volatility <= target + 1e-3);
}

#[test]
fn test_efficient_risk_with_duplicated_fund() {
    let mut instruments: Vec<Instrument> = create_universe(600).iter().cloned().collect();
    let mut twin = instruments[0].clone();
    twin.id = "A2".to_string();
    twin.metadata.isin = "IE00SYNA2".to_string();
    instruments.push(twin);
    let engine = Engine::new(Universe::new(instruments));

    let min_vol = engine.optimize(&min_volatility(), &Filters::default()).unwrap();
    let target = min_vol.performance.annual_volatility * 2.0;
    let params = OptimizerParameters {
        optimizer: OptimizerKind::EfficientRisk,
        target_volatility: Some(target),
        ..min_volatility()
    };
    let portfolio = engine.optimize(&params, &Filters::default()).unwrap();
    assert!(portfolio.performance.annual_volatility <= target + 1e-3);
    assert!(portfolio.total <= 1.0 + 1e-12);
}

#[test]
fn test_final_date_matches_truncated_universe() {
    let full = create_universe(900);
    let cut = NaiveDate::from_ymd_opt(2021, 6, 1).unwrap();
    let truncated = map_histories(&full, |history| {
        history.iter().copied().filter(|p| p.date <= cut).collect()
    });

    let params = OptimizerParameters {
        final_date: Some(cut),
        initial_value: Some(10_000.0),
        ..min_volatility()
    };
    let from_full = Engine::new(full).optimize(&params, &Filters::default()).unwrap();
    let from_truncated = Engine::new(truncated)
        .optimize(
            &OptimizerParameters {
                final_date: None,
                ..params.clone()
            },
            &Filters::default(),
        )
        .unwrap();

    assert_eq!(from_full.weights, from_truncated.weights);
    assert_eq!(from_full.allocation, from_truncated.allocation);
}

#[test]
fn test_backtest_ignores_prices_after_rebalance_date() {
    let starting_date = NaiveDate::from_ymd_opt(2021, 6, 1).unwrap();
    let original = create_universe(900);
    let altered = map_histories(&original, |history| {
        history
            .iter()
            .map(|p| {
                if p.date > starting_date {
                    PricePoint::new(p.date, p.close * 1.5)
                } else {
                    *p
                }
            })
            .collect()
    });

    let backtest = BacktestParameters {
        initial_value: 50_000.0,
        starting_date,
        today: NaiveDate::from_ymd_opt(2021, 12, 1),
        ..Default::default()
    };
    let first = Engine::new(original)
        .backtest(&min_volatility(), &Filters::default(), &backtest)
        .unwrap();
    let second = Engine::new(altered)
        .backtest(&min_volatility(), &Filters::default(), &backtest)
        .unwrap();

    assert!(first.trading_history[0].portfolio.is_some());
    assert_eq!(
        first.trading_history[0].portfolio,
        second.trading_history[0].portfolio
    );
    assert_ne!(first.final_value, second.final_value);
}

#[test]
fn test_efficient_risk_without_target_is_rejected() {
    let engine = Engine::new(create_universe(600));
    let params = OptimizerParameters {
        optimizer: OptimizerKind::EfficientRisk,
        ..min_volatility()
    };
    let result = engine.optimize(&params, &Filters::default());
    assert!(matches!(
        result,
        Err(OptimizerError::InvalidOptimizerParameter(_))
    ));
}

#[test]
fn test_filters_that_match_nothing() {
    let engine = Engine::new(create_universe(600));
    let filters = Filters {
        fund_currency: Some("JPY".to_string()),
        ..Default::default()
    };
    let result = engine.optimize(&min_volatility(), &filters);
    assert!(matches!(result, Err(OptimizerError::FilterExhausted)));
    assert_eq!(engine.filter_universe(&filters).matching_count, 0);
}

#[test]
fn test_single_instrument_left() {
    let engine = Engine::new(create_universe(600));
    let filters = Filters {
        domicile_country: Some("Luxembourg".to_string()),
        ..Default::default()
    };
    let result = engine.optimize(&min_volatility(), &filters);
    assert!(matches!(
        result,
        Err(OptimizerError::InsufficientUniverse { remaining: 1 })
    ));
}

#[test]
fn test_short_history_is_filtered_out() {
    let engine = Engine::new(create_universe(600));
    let params = OptimizerParameters {
        minimum_days_with_data: 1_000,
        ..min_volatility()
    };
    let result = engine.optimize(&params, &Filters::default());
    assert!(matches!(result, Err(OptimizerError::FilterExhausted)));
}

#[test]
fn test_allocation_stays_within_budget() {
    let engine = Engine::new(create_universe(600));
    let params = OptimizerParameters {
        initial_value: Some(25_000.0),
        ..min_volatility()
    };
    let portfolio = engine.optimize(&params, &Filters::default()).unwrap();
    let allocation = portfolio.allocation.unwrap();

    assert!(allocation.leftover_cash >= 0.0);
    assert!((allocation.invested() + allocation.leftover_cash - 25_000.0).abs() < 1e-6);
    for id in allocation.positions.keys() {
        assert!(portfolio.weights.contains_key(id));
    }
}

#[test]
fn test_backtest_with_fixed_today() {
    let engine = Engine::new(create_universe(900));
    let backtest = BacktestParameters {
        initial_value: 50_000.0,
        starting_date: NaiveDate::from_ymd_opt(2021, 6, 1).unwrap(),
        rebalance_period_months: 6,
        step_days: 7,
        today: NaiveDate::from_ymd_opt(2022, 6, 1),
        show_progress: false,
    };

    let result = engine
        .backtest(&min_volatility(), &Filters::default(), &backtest)
        .unwrap();

    assert_eq!(result.rebalance_count, 2);
    assert_eq!(result.end_date, NaiveDate::from_ymd_opt(2022, 6, 1).unwrap());
    assert_eq!(result.trading_history[0].portfolio_value, 50_000.0);
    assert!(result.trading_history[0].is_rebalance());
    assert!(result.final_value > 0.0);

    for snapshot in &result.trading_history {
        assert!(snapshot.portfolio_value >= 0.0);
    }
    for pair in result.trading_history.windows(2) {
        assert!(pair[0].date < pair[1].date);
    }

    let rebalance_dates: Vec<NaiveDate> = result
        .trading_history
        .iter()
        .filter(|s| s.is_rebalance())
        .map(|s| s.date)
        .collect();
    assert_eq!(
        rebalance_dates,
        vec![
            NaiveDate::from_ymd_opt(2021, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 12, 1).unwrap(),
        ]
    );
}

#[test]
fn test_backtest_rejects_start_after_today() {
    let engine = Engine::new(create_universe(600));
    let backtest = BacktestParameters {
        starting_date: NaiveDate::from_ymd_opt(2021, 6, 1).unwrap(),
        today: NaiveDate::from_ymd_opt(2021, 1, 1),
        ..Default::default()
    };
    let result = engine.backtest(&min_volatility(), &Filters::default(), &backtest);
    assert!(matches!(
        result,
        Err(OptimizerError::InvalidOptimizerParameter(_))
    ));
}

#[test]
fn test_backtest_many_in_parallel() {
    let engine = Engine::new(create_universe(900));
    let base = BacktestParameters {
        starting_date: NaiveDate::from_ymd_opt(2021, 6, 1).unwrap(),
        today: NaiveDate::from_ymd_opt(2022, 1, 1),
        ..Default::default()
    };
    let runs = vec![
        BacktestRun {
            optimizer: min_volatility(),
            filters: Filters::default(),
            backtest: base.clone(),
        },
        BacktestRun {
            optimizer: min_volatility(),
            filters: Filters {
                fund_currency: Some("JPY".to_string()),
                ..Default::default()
            },
            backtest: base,
        },
    ];

    let results = engine.backtest_many(&runs);
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(OptimizerError::FilterExhausted)));
}

#[test]
fn test_universe_file_round_trip_through_engine() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("universe.json");
    save_universe_json(&create_universe(600), &path).unwrap();

    let engine = Engine::new(load_universe(&path).unwrap());
    assert_eq!(engine.universe().len(), 3);

    let values = engine.list_filter_domain_values();
    assert_eq!(values.domicile_countries, vec!["Ireland", "Luxembourg"]);

    let portfolio = engine.optimize(&min_volatility(), &Filters::default()).unwrap();
    assert!(!portfolio.is_empty());
}

#[test]
fn test_run_file_drives_the_engine() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.toml");
    std::fs::write(
        &path,
        r#"
[optimizer]
optimizer = "min-volatility"
minimum_days_with_data = 100
initial_value = 10000.0

[filters]
domicile_country = "Ireland"
"#,
    )
    .unwrap();

    let config = RunFileConfig::load(&path).unwrap();
    let engine = Engine::new(create_universe(600));
    let portfolio = engine
        .optimize(
            &config.to_optimizer_parameters().unwrap(),
            &config.to_filters(),
        )
        .unwrap();

    assert!(portfolio.weights.keys().all(|id| id == "A" || id == "B"));
    assert!(portfolio.allocation.is_some());
}
