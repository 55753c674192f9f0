//! In-memory CSV table
//!
//! Row-oriented table of string cells with named columns. Cells keep their
//! original text; numeric interpretation happens in the feature pipeline.
//! Row count and row order are preserved through parse and serialize.

use csv::{ReaderBuilder, Writer};

/// A parsed CSV table: one header row plus string cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Parse CSV text with a header row.
    ///
    /// Rows must have the same field count as the header; ragged input is a
    /// parse error, not silently padded.
    pub fn parse(text: &str) -> csv::Result<Self> {
        let mut reader = ReaderBuilder::new().from_reader(text.as_bytes());

        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(|f| f.to_string()).collect());
        }

        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Number of data rows (header excluded).
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Index of a named column, if present.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Cell text at (row, column). Panics on out-of-range indices, which
    /// callers rule out by resolving indices through `column_index`.
    pub fn cell(&self, row: usize, col: usize) -> &str {
        &self.rows[row][col]
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: String) {
        self.rows[row][col] = value;
    }

    /// Append a new column with one value per existing row.
    pub fn push_column(&mut self, name: &str, values: Vec<String>) {
        debug_assert_eq!(values.len(), self.rows.len());
        self.headers.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
    }

    /// Serialize back to CSV bytes (no BOM; the HTTP layer prepends one).
    pub fn to_csv_bytes(&self) -> csv::Result<Vec<u8>> {
        let mut writer = Writer::from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }
}
