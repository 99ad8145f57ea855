//! Keyed tab-separated tables: the participants, scans and group-report
//! files. Merges are explicit keyed-map operations with add-only semantics
//! instead of dataframe joins: a merge may add rows and amend columns but
//! never overwrites or deletes an existing row.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to read table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to write table {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("table {path} has no `{column}` column")]
    MissingKeyColumn { path: PathBuf, column: String },

    #[error("table {path} has duplicate key `{key}`")]
    DuplicateKey { path: PathBuf, key: String },

    #[error("no row with key `{key}`")]
    MissingRow { key: String },
}

/// A TSV table with a designated key column, preserving row and column order.
#[derive(Debug, Clone)]
pub struct TsvTable {
    key_column: String,
    columns: Vec<String>,
    rows: Vec<Row>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
struct Row {
    key: String,
    values: HashMap<String, String>,
}

impl TsvTable {
    pub fn new(key_column: &str) -> Self {
        Self {
            key_column: key_column.to_string(),
            columns: vec![key_column.to_string()],
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Load a table from disk, indexing it by `key_column`. Duplicate keys
    /// are rejected.
    pub fn load(path: &Path, key_column: &str) -> Result<Self, TableError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(path)
            .map_err(|source| TableError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(|source| TableError::Read {
                path: path.to_path_buf(),
                source,
            })?
            .iter()
            .map(str::to_string)
            .collect();
        let key_pos = headers
            .iter()
            .position(|h| h == key_column)
            .ok_or_else(|| TableError::MissingKeyColumn {
                path: path.to_path_buf(),
                column: key_column.to_string(),
            })?;

        let mut table = Self {
            key_column: key_column.to_string(),
            columns: headers.clone(),
            rows: Vec::new(),
            index: HashMap::new(),
        };
        for record in reader.records() {
            let record = record.map_err(|source| TableError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let key = record.get(key_pos).unwrap_or_default().to_string();
            if table.index.contains_key(&key) {
                return Err(TableError::DuplicateKey {
                    path: path.to_path_buf(),
                    key,
                });
            }
            let values = headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.clone(), v.to_string()))
                .collect();
            table.index.insert(key.clone(), table.rows.len());
            table.rows.push(Row { key, values });
        }
        Ok(table)
    }

    /// Persist the table, writing every known column for every row.
    pub fn save(&self, path: &Path) -> Result<(), TableError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)
            .map_err(|source| TableError::Write {
                path: path.to_path_buf(),
                source: io::Error::other(source),
            })?;
        let io_err = |source: csv::Error| TableError::Write {
            path: path.to_path_buf(),
            source: io::Error::other(source),
        };

        writer.write_record(&self.columns).map_err(io_err)?;
        for row in &self.rows {
            let record: Vec<&str> = self
                .columns
                .iter()
                .map(|c| row.values.get(c).map(String::as_str).unwrap_or(""))
                .collect();
            writer.write_record(&record).map_err(io_err)?;
        }
        writer.flush().map_err(|source| TableError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Row keys in table order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|r| r.key.as_str())
    }

    pub fn get(&self, key: &str, column: &str) -> Option<&str> {
        let row = &self.rows[*self.index.get(key)?];
        row.values.get(column).map(String::as_str)
    }

    /// Set a cell, creating the column on first use. The row must exist.
    pub fn set(&mut self, key: &str, column: &str, value: &str) -> Result<(), TableError> {
        let pos = *self.index.get(key).ok_or_else(|| TableError::MissingRow {
            key: key.to_string(),
        })?;
        if !self.columns.iter().any(|c| c == column) {
            self.columns.push(column.to_string());
        }
        self.rows[pos]
            .values
            .insert(column.to_string(), value.to_string());
        Ok(())
    }

    /// Append a row with the given key and values; replaces nothing.
    pub fn insert_row(&mut self, key: &str, values: &[(&str, &str)]) -> Result<(), TableError> {
        if self.index.contains_key(key) {
            return Err(TableError::DuplicateKey {
                path: PathBuf::new(),
                key: key.to_string(),
            });
        }
        let mut row_values = HashMap::new();
        row_values.insert(self.key_column.clone(), key.to_string());
        for (column, value) in values {
            if !self.columns.iter().any(|c| c == column) {
                self.columns.push(column.to_string());
            }
            row_values.insert(column.to_string(), value.to_string());
        }
        self.index.insert(key.to_string(), self.rows.len());
        self.rows.push(Row {
            key: key.to_string(),
            values: row_values,
        });
        Ok(())
    }

    /// Merge rows from `other` whose key is absent here. Existing rows are
    /// never overwritten or removed, which makes the key set monotonically
    /// non-decreasing and the merge idempotent.
    pub fn merge_new_rows(&mut self, other: &TsvTable) -> usize {
        let mut added = 0;
        for row in &other.rows {
            if self.index.contains_key(&row.key) {
                continue;
            }
            for column in &other.columns {
                if !self.columns.iter().any(|c| c == column) {
                    self.columns.push(column.clone());
                }
            }
            self.index.insert(row.key.clone(), self.rows.len());
            self.rows.push(row.clone());
            added += 1;
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn table_with(keys: &[(&str, &str)]) -> TsvTable {
        let mut table = TsvTable::new("participant_id");
        for (key, sex) in keys {
            table.insert_row(key, &[("sex", sex), ("age", "30")]).unwrap();
        }
        table
    }

    #[test]
    fn merge_is_monotone_and_idempotent() {
        let mut existing = table_with(&[("sub-001", "F")]);
        let incoming = table_with(&[("sub-001", "M"), ("sub-002", "M")]);

        assert_eq!(existing.merge_new_rows(&incoming), 1);
        assert_eq!(existing.len(), 2);
        // Existing row wins; the incoming duplicate never overwrites.
        assert_eq!(existing.get("sub-001", "sex"), Some("F"));

        assert_eq!(existing.merge_new_rows(&incoming), 0);
        assert_eq!(existing.len(), 2);
        assert!(existing.contains_key("sub-001"));
        assert!(existing.contains_key("sub-002"));
    }

    #[test]
    fn round_trips_through_disk_with_added_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.tsv");
        fs::write(&path, "bids_name\tcjv\nsub-001_T1w\t0.5\n").unwrap();

        let mut table = TsvTable::load(&path, "bids_name").unwrap();
        table.set("sub-001_T1w", "meta.Sex", "F").unwrap();
        table.save(&path).unwrap();

        let reread = TsvTable::load(&path, "bids_name").unwrap();
        assert_eq!(reread.get("sub-001_T1w", "meta.Sex"), Some("F"));
        assert_eq!(reread.get("sub-001_T1w", "cjv"), Some("0.5"));
    }

    #[test]
    fn duplicate_keys_are_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.tsv");
        fs::write(&path, "participant_id\tsex\nsub-001\tF\nsub-001\tM\n").unwrap();
        assert!(matches!(
            TsvTable::load(&path, "participant_id"),
            Err(TableError::DuplicateKey { .. })
        ));
    }
}
