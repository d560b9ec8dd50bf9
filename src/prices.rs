//! Price matrix construction from raw instrument histories.
//!
//! Vendor series contain zero prices, gaps and single-day glitches (a price that is off by
//! a factor of 20 for one observation). Each series is cleaned independently and the
//! results are aligned on the union of their dates.

use crate::types::{Instrument, PricePoint};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

/// Single-observation outlier filter.
///
/// An observation is compared, in order of preference, with the immediately previous
/// observation (after cleaning), the immediately next raw observation, or the mean of the
/// trailing window of accepted prices. The first usable reference decides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeFilter {
    /// Smallest accepted ratio price / reference.
    pub lower_ratio: f64,
    /// Largest accepted ratio price / reference.
    pub upper_ratio: f64,
    /// Number of accepted prices kept for the trailing mean.
    pub window: usize,
}

impl Default for SpikeFilter {
    fn default() -> Self {
        Self {
            lower_ratio: 0.2,
            upper_ratio: 5.0,
            window: 50,
        }
    }
}

impl SpikeFilter {
    fn within_band(&self, price: f64, reference: f64) -> bool {
        let ratio = price / reference;
        ratio >= self.lower_ratio && ratio <= self.upper_ratio
    }

    /// Clean a series of prices. Zero, negative and NaN inputs come out as NaN, as do
    /// rejected spikes. Applying the filter to its own output changes nothing.
    pub fn apply(&self, prices: &[f64]) -> Vec<f64> {
        let raw: Vec<Option<f64>> = prices
            .iter()
            .map(|&p| (p.is_finite() && p > 0.0).then_some(p))
            .collect();

        let mut cleaned = Vec::with_capacity(raw.len());
        let mut trailing: VecDeque<f64> = VecDeque::with_capacity(self.window);

        for (i, value) in raw.iter().enumerate() {
            let Some(price) = *value else {
                cleaned.push(f64::NAN);
                continue;
            };

            let previous = i
                .checked_sub(1)
                .map(|j| cleaned[j])
                .filter(|p: &f64| !p.is_nan());
            let next = raw.get(i + 1).copied().flatten();

            let accepted = if let Some(reference) = previous {
                self.within_band(price, reference)
            } else if let Some(reference) = next {
                self.within_band(price, reference)
            } else if !trailing.is_empty() {
                let mean = trailing.iter().sum::<f64>() / trailing.len() as f64;
                self.within_band(price, mean)
            } else {
                true
            };

            if accepted {
                if self.window > 0 {
                    if trailing.len() == self.window {
                        trailing.pop_front();
                    }
                    trailing.push_back(price);
                }
                cleaned.push(price);
            } else {
                debug!("Rejected spike at index {}: {}", i, price);
                cleaned.push(f64::NAN);
            }
        }

        cleaned
    }
}

/// Truncate a history at `final_date` (inclusive) and clean it.
pub fn clean_history(
    history: &[PricePoint],
    final_date: Option<NaiveDate>,
    filter: &SpikeFilter,
) -> Vec<(NaiveDate, f64)> {
    let visible: Vec<&PricePoint> = history
        .iter()
        .take_while(|p| final_date.map_or(true, |end| p.date <= end))
        .collect();
    let closes: Vec<f64> = visible.iter().map(|p| p.close).collect();
    let cleaned = filter.apply(&closes);

    visible
        .iter()
        .zip(cleaned)
        .map(|(p, close)| (p.date, close))
        .collect()
}

/// Date-indexed table of prices with one column per instrument. Missing cells are NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceMatrix {
    dates: Vec<NaiveDate>,
    ids: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl PriceMatrix {
    /// Build a matrix from column-major data. Every column must have one value per date.
    pub fn from_columns(dates: Vec<NaiveDate>, ids: Vec<String>, columns: Vec<Vec<f64>>) -> Self {
        debug_assert_eq!(ids.len(), columns.len());
        debug_assert!(columns.iter().all(|c| c.len() == dates.len()));
        Self {
            dates,
            ids,
            columns,
        }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    /// Instrument identifiers in column order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn columns(&self) -> &[Vec<f64>] {
        &self.columns
    }

    pub fn column(&self, id: &str) -> Option<&[f64]> {
        self.ids
            .iter()
            .position(|i| i == id)
            .map(|idx| self.columns[idx].as_slice())
    }

    /// Number of rows (dates).
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn width(&self) -> usize {
        self.ids.len()
    }

    pub fn non_missing_count(&self, id: &str) -> usize {
        self.column(id)
            .map_or(0, |c| c.iter().filter(|p| !p.is_nan()).count())
    }

    /// Last non-missing price of every column.
    pub fn latest_prices(&self) -> HashMap<String, f64> {
        self.ids
            .iter()
            .zip(&self.columns)
            .filter_map(|(id, column)| {
                column
                    .iter()
                    .rev()
                    .find(|p| !p.is_nan())
                    .map(|&p| (id.clone(), p))
            })
            .collect()
    }

    /// Latest non-missing price of `id` at or before `date`.
    pub fn latest_price_at(&self, id: &str, date: NaiveDate) -> Option<f64> {
        let column = self.column(id)?;
        let end = self.dates.partition_point(|d| *d <= date);
        column[..end].iter().rev().find(|p| !p.is_nan()).copied()
    }
}

/// Builds a [`PriceMatrix`] from instruments.
#[derive(Debug, Clone, Default)]
pub struct PriceMatrixBuilder {
    final_date: Option<NaiveDate>,
    rolling_window_in_days: usize,
    spike_filter: SpikeFilter,
}

impl PriceMatrixBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude observations after `date` before any cleaning happens.
    pub fn final_date(mut self, date: Option<NaiveDate>) -> Self {
        self.final_date = date;
        self
    }

    /// Keep only the trailing `rows` rows (0 keeps the full history).
    pub fn rolling_window(mut self, rows: usize) -> Self {
        self.rolling_window_in_days = rows;
        self
    }

    pub fn spike_filter(mut self, filter: SpikeFilter) -> Self {
        self.spike_filter = filter;
        self
    }

    /// Clean, align and window the price histories.
    ///
    /// Columns with fewer than two prices left in the window are dropped with a warning.
    pub fn build(&self, instruments: &[&Instrument]) -> PriceMatrix {
        let series: Vec<(&str, Vec<(NaiveDate, f64)>)> = instruments
            .iter()
            .map(|i| {
                (
                    i.id.as_str(),
                    clean_history(&i.history, self.final_date, &self.spike_filter),
                )
            })
            .collect();

        let all_dates: BTreeSet<NaiveDate> = series
            .iter()
            .flat_map(|(_, s)| s.iter().map(|(d, _)| *d))
            .collect();
        let mut dates: Vec<NaiveDate> = all_dates.into_iter().collect();

        let row_of: HashMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

        let mut ids = Vec::with_capacity(series.len());
        let mut columns = Vec::with_capacity(series.len());
        for (id, points) in &series {
            let mut column = vec![f64::NAN; dates.len()];
            for (date, price) in points {
                column[row_of[date]] = *price;
            }
            ids.push(id.to_string());
            columns.push(column);
        }

        if self.rolling_window_in_days > 0 && dates.len() > self.rolling_window_in_days {
            let start = dates.len() - self.rolling_window_in_days;
            dates.drain(..start);
            for column in &mut columns {
                column.drain(..start);
            }
        }

        let mut kept_ids = Vec::with_capacity(ids.len());
        let mut kept_columns = Vec::with_capacity(columns.len());
        for (id, column) in ids.into_iter().zip(columns) {
            let observed = column.iter().filter(|p| !p.is_nan()).count();
            if observed < 2 {
                warn!(
                    "Dropping {}: only {} usable price(s) in the evaluation window",
                    id, observed
                );
                continue;
            }
            kept_ids.push(id);
            kept_columns.push(column);
        }

        debug!(
            "Built price matrix with {} rows and {} columns",
            dates.len(),
            kept_ids.len()
        );

        PriceMatrix::from_columns(dates, kept_ids, kept_columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstrumentMetadata;
    use chrono::Duration;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 1, 1).unwrap() + Duration::days(offset)
    }

    fn instrument(id: &str, start: i64, closes: &[f64]) -> Instrument {
        let history = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PricePoint::new(day(start + i as i64), c))
            .collect();
        Instrument::new(id, InstrumentMetadata::default(), history).unwrap()
    }

    #[test]
    fn test_single_glitch_is_removed() {
        let cleaned = SpikeFilter::default().apply(&[100.0, 100.0, 5.0, 100.0, 100.0]);
        assert!(cleaned[2].is_nan());
        assert_eq!(cleaned[0], 100.0);
        assert_eq!(cleaned[1], 100.0);
        assert_eq!(cleaned[3], 100.0);
        assert_eq!(cleaned[4], 100.0);
    }

    #[test]
    fn test_zero_price_is_missing() {
        let cleaned = SpikeFilter::default().apply(&[0.0, 10.0, 11.0]);
        assert!(cleaned[0].is_nan());
        assert_eq!(cleaned[1], 10.0);
    }

    #[test]
    fn test_first_price_checked_against_next() {
        let cleaned = SpikeFilter::default().apply(&[1000.0, 10.0, 10.5]);
        assert!(cleaned[0].is_nan());
        assert_eq!(cleaned[1], 10.0);
    }

    #[test]
    fn test_isolated_price_uses_trailing_mean() {
        // Index 3 has neither neighbor: previous is a gap, next is a gap.
        let cleaned = SpikeFilter::default().apply(&[10.0, 10.0, f64::NAN, 90.0, f64::NAN, 10.0]);
        assert!(cleaned[3].is_nan());
        assert_eq!(cleaned[5], 10.0);

        let cleaned = SpikeFilter::default().apply(&[10.0, 10.0, f64::NAN, 12.0, f64::NAN]);
        assert_eq!(cleaned[3], 12.0);
    }

    #[test]
    fn test_level_shift_loses_one_point() {
        let cleaned = SpikeFilter::default().apply(&[100.0, 100.0, 5.0, 5.0, 5.0]);
        assert!(cleaned[2].is_nan());
        assert_eq!(cleaned[3], 5.0);
        assert_eq!(cleaned[4], 5.0);
    }

    #[test]
    fn test_filter_is_idempotent() {
        let filter = SpikeFilter::default();
        let raw = [50.0, 400.0, 52.0, 0.0, 51.0, 3.0, f64::NAN, 53.0, 54.0, 700.0];
        let once = filter.apply(&raw);
        let twice = filter.apply(&once);
        for (a, b) in once.iter().zip(&twice) {
            assert!(a == b || (a.is_nan() && b.is_nan()));
        }
    }

    #[test]
    fn test_final_date_excludes_future_before_cleaning() {
        // Without truncation the last visible price would be judged by its next neighbor.
        let history: Vec<PricePoint> = [0.0, 100.0, 5.0]
            .iter()
            .enumerate()
            .map(|(i, &c)| PricePoint::new(day(i as i64), c))
            .collect();

        let full = clean_history(&history, None, &SpikeFilter::default());
        assert!(full[1].1.is_nan());

        let cleaned = clean_history(&history, Some(day(1)), &SpikeFilter::default());
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[1], (day(1), 100.0));
    }

    #[test]
    fn test_matrix_union_of_dates() {
        let a = instrument("A", 0, &[10.0, 11.0, 12.0]);
        let b = instrument("B", 2, &[20.0, 21.0, 22.0]);
        let matrix = PriceMatrixBuilder::new().build(&[&a, &b]);

        assert_eq!(matrix.len(), 5);
        assert_eq!(matrix.ids(), &["A".to_string(), "B".to_string()]);
        let column_b = matrix.column("B").unwrap();
        assert!(column_b[0].is_nan());
        assert_eq!(column_b[2], 20.0);
        assert!(matrix.dates().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_rolling_window_drops_sparse_columns() {
        let a = instrument("A", 0, &[10.0, 11.0, 12.0, 13.0, 14.0]);
        let b = instrument("B", 0, &[20.0, 21.0, 22.0]);
        let matrix = PriceMatrixBuilder::new().rolling_window(2).build(&[&a, &b]);

        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix.ids(), &["A".to_string()]);
        assert!(matrix.columns().iter().all(|c| c.iter().filter(|p| !p.is_nan()).count() >= 2));
    }

    #[test]
    fn test_latest_prices() {
        let a = instrument("A", 0, &[10.0, 11.0, 0.0]);
        let b = instrument("B", 0, &[20.0, 21.0, 22.0]);
        let matrix = PriceMatrixBuilder::new().build(&[&a, &b]);

        let latest = matrix.latest_prices();
        assert_eq!(latest["A"], 11.0);
        assert_eq!(latest["B"], 22.0);
        assert_eq!(matrix.latest_price_at("B", day(1)), Some(21.0));
        assert_eq!(matrix.latest_price_at("B", day(-1)), None);
    }
}
