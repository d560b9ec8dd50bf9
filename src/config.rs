//! Run configuration files.
//!
//! A TOML file with `[data]`, `[optimizer]`, `[filters]` and `[backtest]` tables describes
//! a complete optimization or backtest run, so runs can be repeated exactly.

use crate::backtest::BacktestParameters;
use crate::data::parse_date;
use crate::error::{OptimizerError, Result};
use crate::estimation::DEFAULT_FREQUENCY;
use crate::filter::Filters;
use crate::optimizer::{OptimizerKind, OptimizerParameters};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete run configuration loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFileConfig {
    #[serde(default)]
    pub data: DataSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    #[serde(default)]
    pub filters: FilterSettings,
    #[serde(default)]
    pub backtest: BacktestSettings,
}

/// Where the universe is read from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSettings {
    /// JSON file or CSV directory.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// "max-sharpe", "min-volatility", "efficient-risk" or "efficient-return".
    #[serde(default = "default_optimizer")]
    pub optimizer: String,
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,
    pub target_volatility: Option<f64>,
    pub target_return: Option<f64>,
    #[serde(default)]
    pub shorting: bool,
    #[serde(default = "default_true")]
    pub remove_ter: bool,
    #[serde(default = "default_asset_cutoff")]
    pub asset_cutoff: f64,
    #[serde(default = "default_asset_rounding")]
    pub asset_rounding: u32,
    #[serde(default)]
    pub rolling_window_in_days: usize,
    #[serde(default = "default_max_etf_list_size")]
    pub max_etf_list_size: usize,
    pub initial_value: Option<f64>,
    /// YYYY-MM-DD.
    pub final_date: Option<String>,
    #[serde(default = "default_minimum_days_with_data")]
    pub minimum_days_with_data: usize,
    #[serde(default = "default_frequency")]
    pub frequency: f64,
}

fn default_optimizer() -> String { "max-sharpe".to_string() }
fn default_risk_free_rate() -> f64 { 0.02 }
fn default_true() -> bool { true }
fn default_asset_cutoff() -> f64 { 0.01 }
fn default_asset_rounding() -> u32 { 4 }
fn default_max_etf_list_size() -> usize { 600 }
fn default_minimum_days_with_data() -> usize { 500 }
fn default_frequency() -> f64 { DEFAULT_FREQUENCY }

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            optimizer: default_optimizer(),
            risk_free_rate: default_risk_free_rate(),
            target_volatility: None,
            target_return: None,
            shorting: false,
            remove_ter: true,
            asset_cutoff: default_asset_cutoff(),
            asset_rounding: default_asset_rounding(),
            rolling_window_in_days: 0,
            max_etf_list_size: default_max_etf_list_size(),
            initial_value: None,
            final_date: None,
            minimum_days_with_data: default_minimum_days_with_data(),
            frequency: default_frequency(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSettings {
    pub isin_allow_list: Option<Vec<String>>,
    pub minimum_days_with_data: Option<usize>,
    pub domicile_country: Option<String>,
    pub replication_method: Option<String>,
    pub distribution_policy: Option<String>,
    pub fund_currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSettings {
    #[serde(default = "default_initial_value")]
    pub initial_value: f64,
    /// YYYY-MM-DD.
    #[serde(default = "default_starting_date")]
    pub starting_date: String,
    #[serde(default = "default_rebalance_period_months")]
    pub rebalance_period_months: u32,
    #[serde(default = "default_step_days")]
    pub step_days: u32,
    /// YYYY-MM-DD, the current date when unset.
    pub today: Option<String>,
}

fn default_initial_value() -> f64 { 100_000.0 }
fn default_starting_date() -> String { "2010-01-01".to_string() }
fn default_rebalance_period_months() -> u32 { 12 }
fn default_step_days() -> u32 { 7 }

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_value: default_initial_value(),
            starting_date: default_starting_date(),
            rebalance_period_months: default_rebalance_period_months(),
            step_days: default_step_days(),
            today: None,
        }
    }
}

impl RunFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: RunFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| OptimizerError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn to_optimizer_parameters(&self) -> Result<OptimizerParameters> {
        let s = &self.optimizer;
        let params = OptimizerParameters {
            optimizer: s.optimizer.parse::<OptimizerKind>()?,
            risk_free_rate: s.risk_free_rate,
            target_volatility: s.target_volatility,
            target_return: s.target_return,
            shorting: s.shorting,
            remove_ter: s.remove_ter,
            asset_cutoff: s.asset_cutoff,
            asset_rounding: s.asset_rounding,
            rolling_window_in_days: s.rolling_window_in_days,
            max_etf_list_size: s.max_etf_list_size,
            initial_value: s.initial_value,
            final_date: s.final_date.as_deref().map(parse_date).transpose()?,
            minimum_days_with_data: s.minimum_days_with_data,
            frequency: s.frequency,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn to_filters(&self) -> Filters {
        let f = &self.filters;
        Filters {
            isin_allow_list: f.isin_allow_list.clone(),
            minimum_days_with_data: f.minimum_days_with_data,
            domicile_country: f.domicile_country.clone(),
            replication_method: f.replication_method.clone(),
            distribution_policy: f.distribution_policy.clone(),
            fund_currency: f.fund_currency.clone(),
        }
    }

    /// Backtest parameters; dates are parsed but not checked against each other.
    pub fn to_backtest_parameters(&self) -> Result<BacktestParameters> {
        let b = &self.backtest;
        Ok(BacktestParameters {
            initial_value: b.initial_value,
            starting_date: parse_date(&b.starting_date)?,
            rebalance_period_months: b.rebalance_period_months,
            step_days: b.step_days,
            today: b.today.as_deref().map(parse_date).transpose()?,
            show_progress: true,
        })
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# ETF optimizer run configuration

[data]
path = "data/universe.json"

[optimizer]
optimizer = "max-sharpe"   # max-sharpe, min-volatility, efficient-risk, efficient-return
risk_free_rate = 0.02
# target_volatility = 0.15  # required by efficient-risk
# target_return = 0.08      # required by efficient-return
shorting = false
remove_ter = true
asset_cutoff = 0.01
asset_rounding = 4
rolling_window_in_days = 0  # 0 = full history
max_etf_list_size = 600
minimum_days_with_data = 500
# initial_value = 10000.0   # enables the discrete allocation
# final_date = "2020-12-31"

[filters]
# domicile_country = "Ireland"
# replication_method = "Physical"
# distribution_policy = "Accumulating"
# fund_currency = "EUR"
# isin_allow_list = ["IE00B4L5Y983", "IE00B5BMR087"]

[backtest]
initial_value = 100000.0
starting_date = "2010-01-01"
rebalance_period_months = 12
step_days = 7
# today = "2023-12-31"
"#
        .to_string()
    }
}
