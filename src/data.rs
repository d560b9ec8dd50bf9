//! Loading instrument universes from disk.
//!
//! Two layouts are supported: a JSON array of instrument records, and a directory of
//! per-instrument `<id>.csv` price files next to a `metadata.json` map. Core modules never
//! read files themselves; they receive the [`Universe`] built here.

use crate::error::{OptimizerError, Result};
use crate::types::{Instrument, InstrumentMetadata, PricePoint, Universe};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, info, warn};

/// Name of the metadata file in a CSV directory.
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(alias = "Date", alias = "DATE", alias = "timestamp", alias = "Timestamp")]
    date: String,
    #[serde(alias = "Close", alias = "CLOSE", alias = "Adj Close", alias = "price")]
    close: Option<f64>,
}

/// Parse a calendar date, trying the common formats.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    let formats = ["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%d/%m/%Y", "%Y%m%d"];
    for fmt in &formats {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }
    // Timestamps such as 2021-03-04T00:00:00Z keep their date part.
    if let Some((date, _)) = s.split_once('T') {
        return Ok(NaiveDate::parse_from_str(date, "%Y-%m-%d")?);
    }
    Err(OptimizerError::DataError(format!(
        "Could not parse date: '{}'",
        s
    )))
}

/// Load a universe from the JSON array layout.
pub fn load_universe_json(path: impl AsRef<Path>) -> Result<Universe> {
    let path = path.as_ref();
    info!("Loading universe from: {}", path.display());

    let reader = BufReader::new(File::open(path)?);
    let instruments: Vec<Instrument> = serde_json::from_reader(reader)?;
    for instrument in &instruments {
        instrument.validate()?;
    }

    info!("Loaded {} instruments", instruments.len());
    Ok(Universe::new(instruments))
}

/// Write a universe in the JSON array layout.
pub fn save_universe_json(universe: &Universe, path: impl AsRef<Path>) -> Result<()> {
    let writer = BufWriter::new(File::create(path.as_ref())?);
    serde_json::to_writer_pretty(writer, universe.instruments())?;
    Ok(())
}

/// Load a `date,close` price file. Rows are sorted by date and duplicate dates dropped.
/// Empty closes become NaN.
pub fn load_price_csv(path: impl AsRef<Path>) -> Result<Vec<PricePoint>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut points = Vec::new();
    for (row_num, result) in reader.deserialize().enumerate() {
        let row: CsvRow = result?;
        let date = parse_date(&row.date).map_err(|e| {
            OptimizerError::DataError(format!("{} row {}: {}", path.display(), row_num + 1, e))
        })?;
        points.push(PricePoint::new(date, row.close.unwrap_or(f64::NAN)));
    }

    points.sort_by_key(|p| p.date);
    let original_len = points.len();
    points.dedup_by_key(|p| p.date);
    if points.len() < original_len {
        warn!(
            "Removed {} duplicate dates from {}",
            original_len - points.len(),
            path.display()
        );
    }

    debug!("Loaded {} prices from {}", points.len(), path.display());
    Ok(points)
}

/// Load a universe from a directory of `<id>.csv` files.
///
/// Metadata comes from `metadata.json` (a map from id to metadata) when present. Files
/// that fail to load are skipped with a warning.
pub fn load_csv_dir(dir: impl AsRef<Path>) -> Result<Universe> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(OptimizerError::DataError(format!(
            "Not a directory: {}",
            dir.display()
        )));
    }

    let metadata_path = dir.join(METADATA_FILE);
    let mut metadata: HashMap<String, InstrumentMetadata> = if metadata_path.exists() {
        serde_json::from_reader(BufReader::new(File::open(&metadata_path)?))?
    } else {
        warn!("No {} in {}, using empty metadata", METADATA_FILE, dir.display());
        HashMap::new()
    };

    let pattern = dir.join("*.csv");
    let paths = glob::glob(&pattern.to_string_lossy()).map_err(|e| {
        OptimizerError::DataError(format!("Invalid glob pattern '{}': {}", pattern.display(), e))
    })?;

    let mut instruments = Vec::new();
    let mut errors = 0;
    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!("Glob error: {}", e);
                errors += 1;
                continue;
            }
        };
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            warn!("Could not extract an id from {}", path.display());
            errors += 1;
            continue;
        };

        match load_price_csv(&path) {
            Ok(history) => {
                let meta = metadata.remove(&id).unwrap_or_default();
                instruments.push(Instrument::new(id, meta, history)?);
            }
            Err(e) => {
                warn!("Failed to load {}: {}", path.display(), e);
                errors += 1;
            }
        }
    }

    if instruments.is_empty() && errors > 0 {
        return Err(OptimizerError::DataError(format!(
            "No files loaded from {}. {} errors occurred.",
            dir.display(),
            errors
        )));
    }

    info!(
        "Loaded {} instruments from {} ({} errors)",
        instruments.len(),
        dir.display(),
        errors
    );
    Ok(Universe::new(instruments))
}

/// Load a universe from a JSON file or a CSV directory.
pub fn load_universe(path: impl AsRef<Path>) -> Result<Universe> {
    let path = path.as_ref();
    if path.is_dir() {
        load_csv_dir(path)
    } else {
        load_universe_json(path)
    }
}
