//! Core data types: instruments, their price history and the universe snapshot.

use crate::error::{OptimizerError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;

/// A single closing-price observation.
///
/// A missing close (`null` in JSON) is stored as NaN, a zero close is kept as-is and treated
/// as missing when the price matrix is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    #[serde(deserialize_with = "deserialize_close")]
    pub close: f64,
}

impl PricePoint {
    pub fn new(date: NaiveDate, close: f64) -> Self {
        Self { date, close }
    }

    /// Check whether the close can be used as a price.
    pub fn is_usable(&self) -> bool {
        self.close.is_finite() && self.close > 0.0
    }
}

fn deserialize_close<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<f64> = Option::deserialize(deserializer)?;
    Ok(value.unwrap_or(f64::NAN))
}

/// Static description of a fund.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub isin: String,
    #[serde(default)]
    pub ticker: String,
    #[serde(default)]
    pub domicile_country: String,
    #[serde(default)]
    pub replication_method: String,
    #[serde(default)]
    pub distribution_policy: String,
    #[serde(default)]
    pub fund_currency: String,
    /// Total expense ratio as a fraction (0.002 = 0.20%).
    #[serde(default, alias = "ter", deserialize_with = "deserialize_expense_ratio")]
    pub expense_ratio: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExpenseRatio {
    Number(f64),
    Text(String),
}

/// Accepts either a fraction or the vendor's percent string ("0.20%").
fn deserialize_expense_ratio<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawExpenseRatio>::deserialize(deserializer)? {
        None => Ok(0.0),
        Some(RawExpenseRatio::Number(value)) => Ok(value),
        Some(RawExpenseRatio::Text(text)) => parse_percent(&text).map_err(serde::de::Error::custom),
    }
}

/// Parse "0.20%" (or "0.20") into 0.002.
pub fn parse_percent(text: &str) -> std::result::Result<f64, String> {
    let trimmed = text.trim().trim_end_matches('%').trim();
    if trimmed.is_empty() {
        return Ok(0.0);
    }
    trimmed
        .replace(',', ".")
        .parse::<f64>()
        .map(|pct| pct * 0.01)
        .map_err(|e| format!("invalid expense ratio {:?}: {}", text, e))
}

/// A tradeable fund with metadata and a date-ordered price history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(rename = "data")]
    pub metadata: InstrumentMetadata,
    #[serde(rename = "historicalData", default)]
    pub history: Vec<PricePoint>,
}

impl Instrument {
    /// Create an instrument, checking that the history is strictly increasing by date.
    pub fn new(
        id: impl Into<String>,
        metadata: InstrumentMetadata,
        history: Vec<PricePoint>,
    ) -> Result<Self> {
        let instrument = Self {
            id: id.into(),
            metadata,
            history,
        };
        instrument.validate()?;
        Ok(instrument)
    }

    /// Validate the date ordering of the history.
    pub fn validate(&self) -> Result<()> {
        if let Some(w) = self
            .history
            .windows(2)
            .find(|w| w[1].date <= w[0].date)
        {
            return Err(OptimizerError::DataError(format!(
                "history of {} is not strictly increasing: {} followed by {}",
                self.id, w[0].date, w[1].date
            )));
        }
        Ok(())
    }

    /// Number of observations, including bad ones.
    pub fn days_with_data(&self) -> usize {
        self.history.len()
    }

    /// Number of observations dated on or before `date`.
    pub fn days_with_data_until(&self, date: NaiveDate) -> usize {
        self.history.partition_point(|p| p.date <= date)
    }

    /// Combined "name - isin" label.
    pub fn display_name(&self) -> String {
        format!("{} - {}", self.metadata.name, self.metadata.isin)
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.history.first().map(|p| p.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.history.last().map(|p| p.date)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.metadata.name)
    }
}

/// Immutable snapshot of the instrument universe.
///
/// Cloning is cheap and the snapshot can be shared across threads. Every filtering step
/// produces new collections of references and never touches the snapshot itself.
#[derive(Debug, Clone, Default)]
pub struct Universe {
    instruments: Arc<[Instrument]>,
}

impl Universe {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        Self {
            instruments: instruments.into(),
        }
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instrument> {
        self.instruments.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

impl From<Vec<Instrument>> for Universe {
    fn from(instruments: Vec<Instrument>) -> Self {
        Self::new(instruments)
    }
}
