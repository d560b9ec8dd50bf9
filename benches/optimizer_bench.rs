//! Performance benchmarks for the optimization pipeline.
//!
//! Run with: cargo bench

use chrono::{Duration, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use etf_optimizer::allocation::DiscreteAllocator;
use etf_optimizer::engine::Engine;
use etf_optimizer::estimation::ReturnsAndRiskEstimator;
use etf_optimizer::filter::Filters;
use etf_optimizer::optimizer::{OptimizerKind, OptimizerParameters};
use etf_optimizer::prices::{PriceMatrixBuilder, SpikeFilter};
use etf_optimizer::solver::ClarabelSolver;
use etf_optimizer::types::{Instrument, InstrumentMetadata, PricePoint, Universe};
use std::collections::HashMap;

/// Generate a synthetic universe of `count` instruments with `days` daily closes each.
fn generate_universe(count: usize, days: usize) -> Universe {
    let start = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
    let instruments = (0..count)
        .map(|k| {
            let drift = 0.0002 + 0.00005 * k as f64;
            let frequency = 0.11 + 0.07 * k as f64;
            let history = (0..days)
                .map(|i| {
                    let t = i as f64;
                    let close = 100.0 * (1.0 + drift * t) + 2.0 * (t * frequency).sin();
                    PricePoint::new(start + Duration::days(i as i64), close)
                })
                .collect();
            Instrument::new(format!("ETF{:03}", k), InstrumentMetadata::default(), history)
                .unwrap()
        })
        .collect();
    Universe::new(instruments)
}

fn bench_spike_filter(c: &mut Criterion) {
    let prices: Vec<f64> = (0..5000)
        .map(|i| {
            if i % 97 == 0 {
                2000.0
            } else {
                100.0 + (i as f64 * 0.3).sin()
            }
        })
        .collect();
    let filter = SpikeFilter::default();

    c.bench_function("spike_filter_5000", |b| {
        b.iter(|| filter.apply(black_box(&prices)))
    });
}

fn bench_estimation(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimation");

    for count in [10, 50] {
        let universe = generate_universe(count, 1500);
        let instruments: Vec<&Instrument> = universe.iter().collect();
        let matrix = PriceMatrixBuilder::new().build(&instruments);
        let estimator = ReturnsAndRiskEstimator::default();

        group.bench_with_input(BenchmarkId::new("estimate", count), &matrix, |b, matrix| {
            b.iter(|| estimator.estimate(black_box(matrix)))
        });
    }

    group.finish();
}

fn bench_optimize(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimize");
    group.sample_size(10); // Fewer samples for slow benchmarks

    let engine = Engine::new(generate_universe(20, 1000));
    for kind in [OptimizerKind::MinimumVolatility, OptimizerKind::MaxSharpe] {
        let params = OptimizerParameters {
            optimizer: kind,
            ..Default::default()
        };
        group.bench_function(kind.to_string(), |b| {
            b.iter(|| engine.optimize(black_box(&params), &Filters::default()))
        });
    }

    group.finish();
}

fn bench_allocation(c: &mut Criterion) {
    let solver = ClarabelSolver::default();
    let weights: Vec<(String, f64)> = (0..8)
        .map(|i| (format!("ETF{}", i), 1.0 / 8.0))
        .collect();
    let prices: HashMap<String, f64> = (0..8)
        .map(|i| (format!("ETF{}", i), 37.0 + 13.5 * i as f64))
        .collect();

    c.bench_function("allocate_8", |b| {
        b.iter(|| DiscreteAllocator::new(&solver).allocate(&weights, &prices, black_box(25_000.0)))
    });
}

criterion_group!(
    benches,
    bench_spike_filter,
    bench_estimation,
    bench_optimize,
    bench_allocation,
);

criterion_main!(benches);
