//! CSV → row reading.
//!
//! Uses the `csv` crate so quoted fields with embedded commas and newlines
//! survive. The header row supplies the keys; every value is kept as a string.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use csv::ReaderBuilder;
use serde_json::Value;

use crate::error::ImportError;
use crate::records::Row;

/// Parses CSV text into rows.
pub fn read_csv_str(input: &str) -> Result<Vec<Row>, ImportError> {
    read_rows(input.as_bytes())
}

/// Parses a CSV file into rows without blocking the async runtime.
pub async fn read_csv_file(path: &Path) -> Result<Vec<Row>, ImportError> {
    let path = path.to_owned();

    tokio::task::spawn_blocking(move || {
        let file = File::open(&path)
            .map_err(|e| ImportError::Csv(format!("Failed to open source file: {}", e)))?;
        read_rows(BufReader::new(file))
    })
    .await
    .map_err(|e| ImportError::Internal(format!("Task join error: {}", e)))?
}

fn read_rows<R: Read>(source: R) -> Result<Vec<Row>, ImportError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(source);

    let headers = reader
        .headers()
        .map_err(|e| ImportError::Csv(format!("Failed to read CSV headers: {}", e)))?
        .clone();

    if headers.is_empty() {
        return Err(ImportError::Csv("CSV file has no header row".to_string()));
    }

    let headers: Vec<String> = headers
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record =
            result.map_err(|e| ImportError::Csv(format!("Failed to read CSV record: {}", e)))?;

        let row: Row = headers
            .iter()
            .zip(record.iter())
            .map(|(key, value)| (key.clone(), Value::String(value.to_string())))
            .collect();
        rows.push(row);
    }

    #[cfg(debug_assertions)]
    tracing::debug!(rows = rows.len(), columns = headers.len(), "CSV parsed");

    Ok(rows)
}
