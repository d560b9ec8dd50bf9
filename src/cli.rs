//! Command-line interface for the optimizer.

use etf_optimizer::backtest::BacktestParameters;
use etf_optimizer::config::RunFileConfig;
use etf_optimizer::data::{load_universe, parse_date};
use etf_optimizer::engine::Engine;
use etf_optimizer::error::{OptimizerError, Result};
use etf_optimizer::export::{export_portfolio_csv, Exporter};
use etf_optimizer::filter::Filters;
use etf_optimizer::optimizer::{OptimizerKind, OptimizerParameters};
use etf_optimizer::report::ResultFormatter;
use etf_optimizer::types::Universe;

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Mean-variance ETF portfolio optimization and rebalancing backtests.
#[derive(Parser)]
#[command(name = "etf-optimizer")]
#[command(version)]
#[command(about = "Optimize ETF portfolios and backtest periodic rebalancing")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compute an optimal portfolio
    Optimize {
        /// Universe JSON file or CSV directory
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Run configuration file (overrides the flags below)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        optimizer: OptimizerArgs,

        #[command(flatten)]
        filters: FilterArgs,

        /// Write the portfolio to this CSV file
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Simulate periodic rebalancing over history
    Backtest {
        /// Universe JSON file or CSV directory
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Run configuration file (overrides the flags below)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        optimizer: OptimizerArgs,

        #[command(flatten)]
        filters: FilterArgs,

        /// Starting cash
        #[arg(long, default_value = "100000")]
        initial_value: f64,

        /// First rebalance date (YYYY-MM-DD)
        #[arg(long, default_value = "2010-01-01")]
        start: String,

        /// Months between rebalances
        #[arg(long, default_value = "12")]
        months: u32,

        /// Days between valuations
        #[arg(long, default_value = "7")]
        step_days: u32,

        /// Last simulated date (YYYY-MM-DD), today when omitted
        #[arg(long)]
        today: Option<String>,

        /// Write history, weights and allocations CSV files to this directory
        #[arg(long)]
        export_dir: Option<PathBuf>,
    },

    /// Count the instruments matching a set of filters
    Matching {
        /// Universe JSON file or CSV directory
        #[arg(short, long)]
        data: PathBuf,

        /// Minimum number of observations
        #[arg(long)]
        min_days: Option<usize>,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// List the values each filter can take
    Parameters {
        /// Universe JSON file or CSV directory
        #[arg(short, long)]
        data: PathBuf,
    },

    /// Generate an example configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "etf-optimizer.toml")]
        output: PathBuf,
    },

    /// Validate a universe file or directory
    Validate {
        /// Universe JSON file or CSV directory
        #[arg(short, long)]
        data: PathBuf,
    },
}

#[derive(Args, Clone)]
pub struct OptimizerArgs {
    /// Optimization objective
    #[arg(short = 'O', long, value_enum, default_value = "max-sharpe")]
    pub objective: ObjectiveArg,

    /// Target volatility for efficient-risk
    #[arg(long)]
    pub target_volatility: Option<f64>,

    /// Target return for efficient-return
    #[arg(long)]
    pub target_return: Option<f64>,

    /// Annual risk-free rate
    #[arg(long, default_value = "0.02")]
    pub risk_free_rate: f64,

    /// Allow negative weights
    #[arg(long)]
    pub shorting: bool,

    /// Keep expense ratios in the expected returns
    #[arg(long)]
    pub keep_ter: bool,

    /// Cash budget for a share allocation
    #[arg(long)]
    pub budget: Option<f64>,

    /// Ignore prices after this date (YYYY-MM-DD)
    #[arg(long)]
    pub final_date: Option<String>,

    /// Trailing rows of history to use (0 = all)
    #[arg(long, default_value = "0")]
    pub rolling_window: usize,

    /// Maximum number of instruments to optimize over
    #[arg(long, default_value = "600")]
    pub max_size: usize,

    /// Minimum number of observations per instrument
    #[arg(long, default_value = "500")]
    pub min_days: usize,
}

#[derive(Args, Clone, Default)]
pub struct FilterArgs {
    /// Keep only these ISINs (repeatable)
    #[arg(long = "isin")]
    pub isins: Vec<String>,

    #[arg(long)]
    pub domicile_country: Option<String>,

    #[arg(long)]
    pub replication_method: Option<String>,

    #[arg(long)]
    pub distribution_policy: Option<String>,

    #[arg(long)]
    pub fund_currency: Option<String>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum ObjectiveArg {
    MaxSharpe,
    MinVolatility,
    EfficientRisk,
    EfficientReturn,
}

impl From<ObjectiveArg> for OptimizerKind {
    fn from(arg: ObjectiveArg) -> Self {
        match arg {
            ObjectiveArg::MaxSharpe => OptimizerKind::MaxSharpe,
            ObjectiveArg::MinVolatility => OptimizerKind::MinimumVolatility,
            ObjectiveArg::EfficientRisk => OptimizerKind::EfficientRisk,
            ObjectiveArg::EfficientReturn => OptimizerKind::EfficientReturn,
        }
    }
}

impl OptimizerArgs {
    fn to_parameters(&self) -> Result<OptimizerParameters> {
        let params = OptimizerParameters {
            optimizer: self.objective.into(),
            risk_free_rate: self.risk_free_rate,
            target_volatility: self.target_volatility,
            target_return: self.target_return,
            shorting: self.shorting,
            remove_ter: !self.keep_ter,
            initial_value: self.budget,
            final_date: self.final_date.as_deref().map(parse_date).transpose()?,
            rolling_window_in_days: self.rolling_window,
            max_etf_list_size: self.max_size,
            minimum_days_with_data: self.min_days,
            ..Default::default()
        };
        params.validate()?;
        Ok(params)
    }
}

impl FilterArgs {
    fn to_filters(&self, minimum_days_with_data: Option<usize>) -> Filters {
        Filters {
            isin_allow_list: (!self.isins.is_empty()).then(|| self.isins.clone()),
            minimum_days_with_data,
            domicile_country: self.domicile_country.clone(),
            replication_method: self.replication_method.clone(),
            distribution_policy: self.distribution_policy.clone(),
            fund_currency: self.fund_currency.clone(),
        }
    }
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {}", e);
        }
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Optimize {
            data,
            config,
            optimizer,
            filters,
            export,
        } => {
            let (data, params, filters) = match config {
                Some(path) => {
                    let file_config = RunFileConfig::load(path)?;
                    (
                        data_path(data.as_deref(), &file_config)?,
                        file_config.to_optimizer_parameters()?,
                        file_config.to_filters(),
                    )
                }
                None => (
                    required(data.as_deref())?,
                    optimizer.to_parameters()?,
                    filters.to_filters(None),
                ),
            };
            run_optimize(&data, &params, &filters, export.as_deref(), cli.output)
        }

        Commands::Backtest {
            data,
            config,
            optimizer,
            filters,
            initial_value,
            start,
            months,
            step_days,
            today,
            export_dir,
        } => {
            let (data, params, filters, backtest) = match config {
                Some(path) => {
                    let file_config = RunFileConfig::load(path)?;
                    (
                        data_path(data.as_deref(), &file_config)?,
                        file_config.to_optimizer_parameters()?,
                        file_config.to_filters(),
                        file_config.to_backtest_parameters()?,
                    )
                }
                None => (
                    required(data.as_deref())?,
                    optimizer.to_parameters()?,
                    filters.to_filters(None),
                    BacktestParameters {
                        initial_value: *initial_value,
                        starting_date: parse_date(start)?,
                        rebalance_period_months: *months,
                        step_days: *step_days,
                        today: today.as_deref().map(parse_date).transpose()?,
                        show_progress: true,
                    },
                ),
            };
            let backtest = BacktestParameters {
                show_progress: cli.output == OutputFormat::Text,
                ..backtest
            };
            run_backtest(&data, &params, &filters, &backtest, export_dir.as_deref(), cli.output)
        }

        Commands::Matching {
            data,
            min_days,
            filters,
        } => {
            let engine = Engine::new(load_universe(data)?);
            let counts = engine.filter_universe(&filters.to_filters(*min_days));
            match cli.output {
                OutputFormat::Text => ResultFormatter::print_filter_counts(&counts),
                OutputFormat::Json => println!("{}", ResultFormatter::to_json(&counts)),
                OutputFormat::Csv => {
                    println!("matching_count,total_count");
                    println!("{},{}", counts.matching_count, counts.total_count);
                }
            }
            Ok(())
        }

        Commands::Parameters { data } => {
            let engine = Engine::new(load_universe(data)?);
            let values = engine.list_filter_domain_values();
            match cli.output {
                OutputFormat::Json => println!("{}", ResultFormatter::to_json(&values)),
                _ => println!("{}", ResultFormatter::domain_values_table(&values)),
            }
            Ok(())
        }

        Commands::Init { output } => init_config(output),

        Commands::Validate { data } => validate_data(data),
    }
}

fn required(data: Option<&Path>) -> Result<PathBuf> {
    data.map(Path::to_path_buf).ok_or_else(|| {
        OptimizerError::ConfigError("--data or --config is required".to_string())
    })
}

/// The `--data` flag wins over the configuration file.
fn data_path(flag: Option<&Path>, config: &RunFileConfig) -> Result<PathBuf> {
    match (flag, config.data.path.as_deref()) {
        (Some(path), _) => Ok(path.to_path_buf()),
        (None, Some(path)) => Ok(PathBuf::from(path)),
        (None, None) => Err(OptimizerError::ConfigError(
            "No data path specified in config".to_string(),
        )),
    }
}

fn run_optimize(
    data: &Path,
    params: &OptimizerParameters,
    filters: &Filters,
    export: Option<&Path>,
    output: OutputFormat,
) -> Result<()> {
    let engine = Engine::new(load_universe(data)?);
    let portfolio = engine.optimize(params, filters)?;

    match output {
        OutputFormat::Text => ResultFormatter::print_portfolio(&portfolio, engine.universe()),
        OutputFormat::Json => println!("{}", ResultFormatter::to_json(&portfolio)),
        OutputFormat::Csv => {
            println!("instrument,weight");
            for (id, weight) in &portfolio.weights {
                println!("{},{:.4}", id, weight);
            }
        }
    }

    if let Some(path) = export {
        export_portfolio_csv(&portfolio, path)?;
        info!("Portfolio written to {}", path.display());
    }
    Ok(())
}

fn run_backtest(
    data: &Path,
    params: &OptimizerParameters,
    filters: &Filters,
    backtest: &BacktestParameters,
    export_dir: Option<&Path>,
    output: OutputFormat,
) -> Result<()> {
    let engine = Engine::new(load_universe(data)?);
    let result = engine.backtest(params, filters, backtest)?;

    match output {
        OutputFormat::Text => ResultFormatter::print_backtest_report(&result),
        OutputFormat::Json => println!("{}", ResultFormatter::to_json(&result)),
        OutputFormat::Csv => {
            println!("date,portfolio_value");
            for snapshot in &result.trading_history {
                println!("{},{:.2}", snapshot.date, snapshot.portfolio_value);
            }
        }
    }

    if let Some(dir) = export_dir {
        fs::create_dir_all(dir)?;
        let exporter = Exporter::new(&result);
        exporter.export_history_csv(dir.join("history.csv"))?;
        exporter.export_weights_csv(dir.join("weights.csv"))?;
        exporter.export_allocations_csv(dir.join("allocations.csv"))?;
        exporter.export_summary_json(dir.join("summary.json"))?;
        println!("Exported backtest files to {}", dir.display());
    }
    Ok(())
}

fn init_config(output: &Path) -> Result<()> {
    let example = RunFileConfig::example();
    fs::write(output, example)?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file to customize your run, then use:");
    println!("  etf-optimizer optimize -c {}", output.display());
    println!("  etf-optimizer backtest -c {}", output.display());
    Ok(())
}

fn summarize(universe: &Universe) {
    println!("\nUniverse Summary:");
    println!("  Instruments: {}", universe.len());

    let observations: usize = universe.iter().map(|i| i.days_with_data()).sum();
    let unusable: usize = universe
        .iter()
        .flat_map(|i| i.history.iter())
        .filter(|p| !p.is_usable())
        .count();
    println!("  Observations: {}", observations);
    println!("  Missing or zero prices: {}", unusable);

    let first = universe.iter().filter_map(|i| i.first_date()).min();
    let last = universe.iter().filter_map(|i| i.last_date()).max();
    if let (Some(first), Some(last)) = (first, last) {
        println!("  Start: {}", first);
        println!("  End: {}", last);
    }

    let without_history = universe.iter().filter(|i| i.history.is_empty()).count();
    if without_history > 0 {
        println!("  Instruments without history: {}", without_history);
    }
}

fn validate_data(data: &Path) -> Result<()> {
    println!("Validating universe: {}", data.display());
    let universe = load_universe(data)?;
    summarize(&universe);
    println!("\nValidation: PASSED");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_optimize() {
        let cli = Cli::try_parse_from([
            "etf-optimizer",
            "optimize",
            "-d",
            "universe.json",
            "-O",
            "efficient-risk",
            "--target-volatility",
            "0.1",
            "--domicile-country",
            "Ireland",
        ])
        .unwrap();

        let Commands::Optimize {
            optimizer, filters, ..
        } = cli.command
        else {
            panic!("expected optimize");
        };
        let params = optimizer.to_parameters().unwrap();
        assert_eq!(params.optimizer, OptimizerKind::EfficientRisk);
        assert_eq!(params.target_volatility, Some(0.1));
        assert!(params.remove_ter);
        assert_eq!(
            filters.to_filters(None).domicile_country.as_deref(),
            Some("Ireland")
        );
    }

    #[test]
    fn test_missing_target_rejected() {
        let cli = Cli::try_parse_from([
            "etf-optimizer",
            "optimize",
            "-d",
            "universe.json",
            "-O",
            "efficient-return",
        ])
        .unwrap();
        let Commands::Optimize { optimizer, .. } = cli.command else {
            panic!("expected optimize");
        };
        assert!(optimizer.to_parameters().is_err());
    }

    #[test]
    fn test_backtest_and_init_commands() {
        assert!(Cli::try_parse_from(["etf-optimizer", "backtest", "-c", "run.toml"]).is_ok());
        assert!(Cli::try_parse_from(["etf-optimizer", "init"]).is_ok());
        assert!(Cli::try_parse_from(["etf-optimizer", "parameters", "-d", "x.json"]).is_ok());
    }

    #[test]
    fn test_isin_list_becomes_allow_list() {
        let args = FilterArgs {
            isins: vec!["IE00B4L5Y983".to_string()],
            ..Default::default()
        };
        let filters = args.to_filters(Some(100));
        assert_eq!(filters.isin_allow_list.unwrap().len(), 1);
        assert_eq!(filters.minimum_days_with_data, Some(100));
        assert!(FilterArgs::default().to_filters(None).isin_allow_list.is_none());
    }
}
