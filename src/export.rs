//! CSV and JSON export of backtest results and portfolios.

use crate::backtest::BacktestResult;
use crate::error::Result;
use crate::optimizer::Portfolio;
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

/// Configuration for exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Decimal precision for numeric values.
    pub precision: usize,
    /// Whether to include headers in CSV.
    pub include_headers: bool,
    /// Delimiter for CSV files.
    pub delimiter: u8,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            precision: 4,
            include_headers: true,
            delimiter: b',',
        }
    }
}

impl ExportConfig {
    fn writer(&self, path: impl AsRef<Path>) -> Result<csv::Writer<File>> {
        Ok(WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .from_path(path)?)
    }

    fn number(&self, value: f64) -> String {
        format!("{:.prec$}", value, prec = self.precision)
    }
}

/// Exporter for backtest results.
pub struct Exporter<'a> {
    result: &'a BacktestResult,
    config: ExportConfig,
}

impl<'a> Exporter<'a> {
    pub fn new(result: &'a BacktestResult) -> Self {
        Self {
            result,
            config: ExportConfig::default(),
        }
    }

    pub fn with_config(result: &'a BacktestResult, config: ExportConfig) -> Self {
        Self { result, config }
    }

    /// One row per snapshot: date, value, whether the date was a rebalance.
    pub fn export_history_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = self.config.writer(path)?;
        if self.config.include_headers {
            writer.write_record(["date", "portfolio_value", "rebalance"])?;
        }
        for snapshot in &self.result.trading_history {
            writer.write_record([
                snapshot.date.to_string(),
                self.config.number(snapshot.portfolio_value),
                snapshot.is_rebalance().to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Weights at every rebalance, one column per instrument ever held.
    pub fn export_weights_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let rebalances: Vec<_> = self
            .result
            .trading_history
            .iter()
            .filter_map(|s| s.portfolio.as_ref().map(|p| (s.date, p)))
            .collect();
        let ids: BTreeSet<&String> = rebalances
            .iter()
            .flat_map(|(_, p)| p.weights.keys())
            .collect();

        let mut writer = self.config.writer(path)?;
        if self.config.include_headers {
            let mut header = vec!["date".to_string()];
            header.extend(ids.iter().map(|id| id.to_string()));
            writer.write_record(&header)?;
        }
        for (date, portfolio) in rebalances {
            let mut record = vec![date.to_string()];
            record.extend(ids.iter().map(|id| self.config.number(portfolio.weight(id))));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Share allocations at every rebalance.
    pub fn export_allocations_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = self.config.writer(path)?;
        if self.config.include_headers {
            writer.write_record(["date", "instrument", "shares", "price", "value"])?;
        }
        for snapshot in &self.result.trading_history {
            let Some(allocation) = snapshot.portfolio.as_ref().and_then(|p| p.allocation.as_ref())
            else {
                continue;
            };
            for (id, position) in &allocation.positions {
                writer.write_record([
                    snapshot.date.to_string(),
                    id.clone(),
                    position.shares.to_string(),
                    self.config.number(position.price),
                    self.config.number(position.value),
                ])?;
            }
            writer.write_record([
                snapshot.date.to_string(),
                "cash".to_string(),
                String::new(),
                String::new(),
                self.config.number(allocation.leftover_cash),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Full result as pretty JSON.
    pub fn export_summary_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self.result)?;
        Ok(())
    }
}

/// Export a single portfolio's weights (and allocation when present) to CSV.
pub fn export_portfolio_csv(portfolio: &Portfolio, path: impl AsRef<Path>) -> Result<()> {
    let config = ExportConfig::default();
    let mut writer = config.writer(path)?;
    writer.write_record(["instrument", "weight", "shares", "value"])?;
    for (id, weight) in &portfolio.weights {
        let position = portfolio
            .allocation
            .as_ref()
            .and_then(|a| a.positions.get(id));
        writer.write_record([
            id.clone(),
            config.number(*weight),
            position.map(|p| p.shares.to_string()).unwrap_or_default(),
            position.map(|p| config.number(p.value)).unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
