//! Terminal reports for portfolios and backtests.

use crate::backtest::BacktestResult;
use crate::filter::{FilterCounts, FilterDomainValues};
use crate::optimizer::Portfolio;
use crate::types::Universe;
use colored::Colorize;
use serde::Serialize;
use tabled::{builder::Builder, settings::Style};

/// Format results for terminal display.
pub struct ResultFormatter;

impl ResultFormatter {
    /// Label for an instrument id, "name - isin" when the universe knows it.
    fn label(universe: &Universe, id: &str) -> String {
        universe
            .get(id)
            .map(|i| i.display_name())
            .unwrap_or_else(|| id.to_string())
    }

    /// Weights (largest first) and, when present, the share allocation.
    pub fn portfolio_table(portfolio: &Portfolio, universe: &Universe) -> String {
        let mut rows: Vec<(&String, &f64)> = portfolio.weights.iter().collect();
        rows.sort_by(|a, b| b.1.total_cmp(a.1));

        let mut builder = Builder::new();
        let with_allocation = portfolio.allocation.is_some();
        if with_allocation {
            builder.push_record(["Instrument", "Weight %", "Shares", "Price", "Value"]);
        } else {
            builder.push_record(["Instrument", "Weight %"]);
        }

        for (id, weight) in rows {
            let mut record = vec![Self::label(universe, id), format!("{:.2}", weight * 100.0)];
            if let Some(allocation) = &portfolio.allocation {
                match allocation.positions.get(id) {
                    Some(p) => {
                        record.push(p.shares.to_string());
                        record.push(format!("{:.2}", p.price));
                        record.push(format!("{:.2}", p.value));
                    }
                    None => record.extend(["0".to_string(), "-".to_string(), "0.00".to_string()]),
                }
            }
            builder.push_record(record);
        }

        builder.build().with(Style::rounded()).to_string()
    }

    /// Print an optimized portfolio to stdout.
    pub fn print_portfolio(portfolio: &Portfolio, universe: &Universe) {
        let perf = &portfolio.performance;

        println!();
        println!("{}", "═".repeat(60).blue());
        println!("{}", format!(" PORTFOLIO ({}) ", portfolio.optimizer).bold().blue());
        println!("{}", "═".repeat(60).blue());
        println!();

        println!("{}", "Performance".bold().underline());
        println!("  Expected Return: {:>12.2}%", perf.expected_return * 100.0);
        println!("  Volatility:      {:>12.2}%", perf.annual_volatility * 100.0);
        println!("  Sharpe Ratio:    {:>12.2}", perf.sharpe_ratio);
        println!(
            "  Invested Weight: {:>12.2}%  ({} instruments)",
            portfolio.total * 100.0,
            portfolio.len()
        );
        println!();

        println!("{}", Self::portfolio_table(portfolio, universe));

        if let Some(allocation) = &portfolio.allocation {
            println!("  Leftover Cash:   {:>12.2}", allocation.leftover_cash);
        }
        println!();
    }

    /// Format percentage change with color.
    fn format_pct_change(pct: f64) -> String {
        if pct >= 0.0 {
            format!("(+{:.2}%)", pct).green().to_string()
        } else {
            format!("({:.2}%)", pct).red().to_string()
        }
    }

    /// Print a backtest summary to stdout.
    pub fn print_backtest_report(result: &BacktestResult) {
        let perf = &result.performance;

        println!();
        println!("{}", "═".repeat(60).blue());
        println!("{}", " BACKTEST RESULTS ".bold().blue());
        println!("{}", "═".repeat(60).blue());
        println!();

        println!("{}", "Overview".bold().underline());
        println!("  Run:             {}", result.run_id);
        println!(
            "  Period:          {} to {}",
            result.starting_date, result.end_date
        );
        println!("  Rebalances:      {:>12}", result.rebalance_count);
        println!("  Snapshots:       {:>12}", result.trading_history.len());
        println!();

        println!("{}", "Performance".bold().underline());
        println!("  Initial Value:   {:>12.2}", result.initial_value);
        println!(
            "  Final Value:     {:>12.2}  {}",
            result.final_value,
            Self::format_pct_change(perf.total_return * 100.0)
        );
        println!("  Annual Return:   {:>12.2}%", perf.annual_return * 100.0);
        println!();

        println!("{}", "Risk Metrics".bold().underline());
        println!("  Volatility:      {:>12.2}%", perf.annual_volatility * 100.0);
        println!("  Sharpe Ratio:    {:>12.2}", perf.sharpe_ratio);
        println!("  Max Drawdown:    {:>12.2}%", -perf.max_drawdown * 100.0);
        println!();

        println!("{}", "═".repeat(60).blue());
    }

    pub fn print_filter_counts(counts: &FilterCounts) {
        println!(
            "{} of {} instruments match the filters",
            counts.matching_count.to_string().bold(),
            counts.total_count
        );
    }

    pub fn domain_values_table(values: &FilterDomainValues) -> String {
        let mut builder = Builder::new();
        builder.push_record(["Filter", "Values"]);
        builder.push_record(["domicile_country".to_string(), values.domicile_countries.join(", ")]);
        builder.push_record([
            "distribution_policy".to_string(),
            values.distribution_policies.join(", "),
        ]);
        builder.push_record([
            "replication_method".to_string(),
            values.replication_methods.join(", "),
        ]);
        builder.push_record(["fund_currency".to_string(), values.fund_currencies.join(", ")]);
        builder.push_record(["optimizer".to_string(), values.available_optimizers.join(", ")]);
        builder.build().with(Style::rounded()).to_string()
    }

    /// Pretty JSON for any result type.
    pub fn to_json<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    }
}
