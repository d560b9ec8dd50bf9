//! Universe filtering ahead of price matrix construction.
//!
//! [`UniverseFilter`] applies its stages in a fixed order: data sufficiency, then
//! categorical matches, then the size cap. The size cap truncates in universe order and is
//! a crude bound on solver cost, not a ranking.

use crate::error::{OptimizerError, Result};
use crate::optimizer::OptimizerKind;
use crate::types::{Instrument, Universe};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Optional constraints on the instrument universe. `None` (or an empty string) means
/// "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Filters {
    /// Only instruments whose ISIN is in this list are kept.
    pub isin_allow_list: Option<Vec<String>>,
    /// Overrides the optimizer's minimum observation count when set.
    pub minimum_days_with_data: Option<usize>,
    pub domicile_country: Option<String>,
    pub replication_method: Option<String>,
    pub distribution_policy: Option<String>,
    pub fund_currency: Option<String>,
}

fn category_matches(wanted: &Option<String>, actual: &str) -> bool {
    match wanted.as_deref() {
        None | Some("") => true,
        Some(value) => value == actual,
    }
}

impl Filters {
    /// Check the categorical filters (ISIN allow-list and exact category matches).
    pub fn matches(&self, instrument: &Instrument) -> bool {
        let meta = &instrument.metadata;

        if let Some(allowed) = &self.isin_allow_list {
            if !allowed.iter().any(|isin| isin == &meta.isin) {
                return false;
            }
        }

        category_matches(&self.domicile_country, &meta.domicile_country)
            && category_matches(&self.replication_method, &meta.replication_method)
            && category_matches(&self.distribution_policy, &meta.distribution_policy)
            && category_matches(&self.fund_currency, &meta.fund_currency)
    }

    /// Whether no constraint is set.
    pub fn is_empty(&self) -> bool {
        *self == Filters::default()
    }
}

/// The filter chain used before every optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniverseFilter {
    /// Used unless the [`Filters`] carry their own value.
    pub minimum_days_with_data: usize,
    /// Size cap applied last.
    pub max_size: usize,
    /// Only observations up to this date count towards the data requirement.
    pub as_of: Option<NaiveDate>,
}

impl UniverseFilter {
    pub fn new(minimum_days_with_data: usize, max_size: usize) -> Self {
        Self {
            minimum_days_with_data,
            max_size,
            as_of: None,
        }
    }

    pub fn as_of(mut self, date: Option<NaiveDate>) -> Self {
        self.as_of = date;
        self
    }

    fn days_with_data(&self, instrument: &Instrument) -> usize {
        match self.as_of {
            Some(date) => instrument.days_with_data_until(date),
            None => instrument.days_with_data(),
        }
    }

    /// Fails with [`OptimizerError::FilterExhausted`] when nothing survives and
    /// [`OptimizerError::InsufficientUniverse`] when a single instrument survives.
    pub fn apply<'a>(&self, universe: &'a Universe, filters: &Filters) -> Result<Vec<&'a Instrument>> {
        let min_days = filters
            .minimum_days_with_data
            .unwrap_or(self.minimum_days_with_data);

        let with_data: Vec<&Instrument> = universe
            .iter()
            .filter(|i| self.days_with_data(i) >= min_days)
            .collect();
        info!(
            "Filtered instruments without {} days of data: {} of {} left",
            min_days,
            with_data.len(),
            universe.len()
        );

        let mut matching: Vec<&Instrument> = with_data
            .into_iter()
            .filter(|i| filters.matches(i))
            .collect();
        info!(
            "Filtered instruments by the parameters provided: {} left",
            matching.len()
        );

        if matching.len() > self.max_size {
            matching.truncate(self.max_size);
            info!("Truncated instrument list to the first {}", self.max_size);
        }

        match matching.len() {
            0 => Err(OptimizerError::FilterExhausted),
            1 => Err(OptimizerError::InsufficientUniverse { remaining: 1 }),
            _ => Ok(matching),
        }
    }
}

/// Result of the read-only filter diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCounts {
    pub matching_count: usize,
    pub total_count: usize,
}

/// Count instruments matching the filters without running an optimization.
pub fn count_matching(universe: &Universe, filters: &Filters) -> FilterCounts {
    let matching_count = universe
        .iter()
        .filter(|i| {
            filters
                .minimum_days_with_data
                .map_or(true, |min| i.days_with_data() >= min)
        })
        .filter(|i| filters.matches(i))
        .count();

    FilterCounts {
        matching_count,
        total_count: universe.len(),
    }
}

/// Distinct category values found in the universe, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterDomainValues {
    pub domicile_countries: Vec<String>,
    pub distribution_policies: Vec<String>,
    pub replication_methods: Vec<String>,
    pub fund_currencies: Vec<String>,
    pub available_optimizers: Vec<String>,
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|v| v == value) {
        values.push(value.to_string());
    }
}

/// Aggregate the values each categorical filter can take.
pub fn filter_domain_values(universe: &Universe) -> FilterDomainValues {
    let mut values = FilterDomainValues {
        available_optimizers: OptimizerKind::ALL.iter().map(|k| k.to_string()).collect(),
        ..Default::default()
    };

    for instrument in universe.iter() {
        let meta = &instrument.metadata;
        push_unique(&mut values.domicile_countries, &meta.domicile_country);
        push_unique(&mut values.distribution_policies, &meta.distribution_policy);
        push_unique(&mut values.replication_methods, &meta.replication_method);
        push_unique(&mut values.fund_currencies, &meta.fund_currency);
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstrumentMetadata, PricePoint};
    use chrono::{Duration, NaiveDate};

    fn instrument(id: &str, country: &str, days: usize) -> Instrument {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let history = (0..days)
            .map(|i| PricePoint::new(start + Duration::days(i as i64), 100.0 + i as f64))
            .collect();
        Instrument::new(
            id,
            InstrumentMetadata {
                name: format!("Fund {}", id),
                isin: format!("ISIN{}", id),
                domicile_country: country.to_string(),
                replication_method: "Physical".to_string(),
                distribution_policy: "Accumulating".to_string(),
                fund_currency: "EUR".to_string(),
                ..Default::default()
            },
            history,
        )
        .unwrap()
    }

    fn universe() -> Universe {
        Universe::new(vec![
            instrument("A", "Ireland", 600),
            instrument("B", "Ireland", 600),
            instrument("C", "Luxembourg", 600),
            instrument("D", "Ireland", 100),
        ])
    }

    #[test]
    fn test_data_sufficiency_then_category() {
        let universe = universe();
        let filters = Filters {
            domicile_country: Some("Ireland".to_string()),
            ..Default::default()
        };
        let kept = UniverseFilter::new(500, 600).apply(&universe, &filters).unwrap();
        let ids: Vec<&str> = kept.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn test_no_match_is_filter_exhausted() {
        let universe = universe();
        let filters = Filters {
            domicile_country: Some("Germany".to_string()),
            ..Default::default()
        };
        let result = UniverseFilter::new(500, 600).apply(&universe, &filters);
        assert!(matches!(result, Err(OptimizerError::FilterExhausted)));
    }

    #[test]
    fn test_single_match_is_insufficient() {
        let universe = universe();
        let filters = Filters {
            domicile_country: Some("Luxembourg".to_string()),
            ..Default::default()
        };
        let result = UniverseFilter::new(500, 600).apply(&universe, &filters);
        assert!(matches!(
            result,
            Err(OptimizerError::InsufficientUniverse { remaining: 1 })
        ));
    }

    #[test]
    fn test_size_cap_keeps_universe_order() {
        let universe = universe();
        let kept = UniverseFilter::new(0, 2).apply(&universe, &Filters::default()).unwrap();
        let ids: Vec<&str> = kept.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn test_filter_minimum_days_overrides_parameter() {
        let universe = universe();
        let filters = Filters {
            minimum_days_with_data: Some(50),
            ..Default::default()
        };
        let kept = UniverseFilter::new(500, 600).apply(&universe, &filters).unwrap();
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn test_as_of_ignores_later_observations() {
        let universe = universe();
        let cutoff = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + Duration::days(99);
        let result = UniverseFilter::new(500, 600)
            .as_of(Some(cutoff))
            .apply(&universe, &Filters::default());
        assert!(matches!(result, Err(OptimizerError::FilterExhausted)));

        let kept = UniverseFilter::new(100, 600)
            .as_of(Some(cutoff))
            .apply(&universe, &Filters::default())
            .unwrap();
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn test_isin_allow_list_and_empty_category() {
        let universe = universe();
        let filters = Filters {
            isin_allow_list: Some(vec!["ISINA".to_string(), "ISINC".to_string()]),
            domicile_country: Some(String::new()),
            ..Default::default()
        };
        let kept = UniverseFilter::new(0, 600).apply(&universe, &filters).unwrap();
        let ids: Vec<&str> = kept.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
    }

    #[test]
    fn test_count_matching() {
        let universe = universe();
        let counts = count_matching(
            &universe,
            &Filters {
                domicile_country: Some("Ireland".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            counts,
            FilterCounts {
                matching_count: 3,
                total_count: 4
            }
        );
    }

    #[test]
    fn test_filter_domain_values() {
        let values = filter_domain_values(&universe());
        assert_eq!(values.domicile_countries, vec!["Ireland", "Luxembourg"]);
        assert_eq!(values.fund_currencies, vec!["EUR"]);
        assert_eq!(values.available_optimizers.len(), 4);
        assert!(values.available_optimizers.contains(&"MaxSharpe".to_string()));
    }
}
