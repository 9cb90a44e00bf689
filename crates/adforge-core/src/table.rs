//! In-memory CSV row table.
//!
//! The pipeline reads the whole input table up front, lets workers write the
//! produced image path back per row, and checkpoints the augmented table to
//! disk atomically (sibling temp file + rename).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Owned snapshot of a single row, keyed by column name.
///
/// Workers clone one of these under the table lock and release the lock
/// before doing any stage work.
#[derive(Debug, Clone, Default)]
pub struct RowSnapshot {
    values: BTreeMap<String, String>,
}

impl RowSnapshot {
    /// Cell value for `column`, or `None` when the column is absent.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    /// Cell value trimmed, with empty cells mapped to `None`.
    pub fn get_non_empty(&self, column: &str) -> Option<&str> {
        match self.get(column).map(str::trim) {
            Some("") | None => None,
            Some(v) => Some(v),
        }
    }

    /// Replace a cell value (used for the simpler-text recompose path).
    pub fn set(&mut self, column: &str, value: &str) {
        self.values.insert(column.to_string(), value.to_string());
    }

    /// Build a snapshot directly from pairs. Test and preview helper.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// The full input table plus the single augmented output column.
#[derive(Debug)]
pub struct RowTable {
    headers: Vec<String>,
    column_index: HashMap<String, usize>,
    rows: Vec<Vec<String>>,
    image_column: usize,
}

impl RowTable {
    /// Load a UTF-8 CSV with a header row. The output column named
    /// `image_column` is appended (empty) when the input does not carry it.
    pub fn load(path: &Path, image_column: &str) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("open input table {}", path.display()))?;

        let mut headers: Vec<String> = reader
            .headers()
            .context("read CSV header row")?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.context("read CSV record")?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            // Ragged rows are padded so every row has a cell per header.
            row.resize(headers.len(), String::new());
            rows.push(row);
        }

        let image_column_idx = match headers.iter().position(|h| h == image_column) {
            Some(idx) => idx,
            None => {
                headers.push(image_column.to_string());
                for row in &mut rows {
                    row.push(String::new());
                }
                headers.len() - 1
            }
        };

        let column_index = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.clone(), i))
            .collect();

        Ok(Self {
            headers,
            column_index,
            rows,
            image_column: image_column_idx,
        })
    }

    /// Number of data rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no data rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column headers in file order.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Raw cell access.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let col = *self.column_index.get(column)?;
        self.rows.get(row)?.get(col).map(String::as_str)
    }

    /// Owned snapshot of one row for lock-free stage work.
    pub fn snapshot(&self, row: usize) -> Option<RowSnapshot> {
        let cells = self.rows.get(row)?;
        Some(RowSnapshot {
            values: self
                .headers
                .iter()
                .cloned()
                .zip(cells.iter().cloned())
                .collect(),
        })
    }

    /// Write the produced image path into the output column.
    pub fn set_image_path(&mut self, row: usize, value: &str) {
        if let Some(cells) = self.rows.get_mut(row) {
            if let Some(cell) = cells.get_mut(self.image_column) {
                *cell = value.to_string();
            }
        }
    }

    /// Image path previously written for a row, if any.
    pub fn image_path(&self, row: usize) -> Option<&str> {
        self.rows
            .get(row)?
            .get(self.image_column)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Save the table atomically: write a sibling `.tmp`, then rename over
    /// the destination.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create output dir {}", dir.display()))?;
        }

        let tmp: PathBuf = path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp)
                .with_context(|| format!("open temp table {}", tmp.display()))?;
            writer.write_record(&self.headers)?;
            for row in &self.rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)
            .with_context(|| format!("rename table into place at {}", path.display()))?;
        Ok(())
    }
}
