//! Tabular view of streamline payloads
//!
//! The upstream service ships newline-delimited JSON, one record per line.
//! Records are collected column-wise so the cache file and the geometry
//! builder both see `{"<column>": [row0, row1, ...]}`.

use crate::error::{Result, StreamlineError};
use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Column-oriented table of JSON values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamlineFrame {
    columns: BTreeMap<String, Vec<Value>>,
    rows: usize,
}

impl StreamlineFrame {
    /// Read a gzip-compressed NDJSON file. Plain NDJSON is accepted as well,
    /// since HTTP clients may already have stripped the compression.
    pub fn read_ndjson_gz(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 2];
        let n = file.read(&mut magic)?;
        let file = File::open(path)?;

        if n == 2 && magic == GZIP_MAGIC {
            Self::from_ndjson_reader(BufReader::new(GzDecoder::new(file)))
        } else {
            tracing::debug!("{:?} is not gzip-compressed, reading as plain NDJSON", path);
            Self::from_ndjson_reader(BufReader::new(file))
        }
    }

    /// Build a frame from NDJSON lines. Keys missing from a record become null.
    pub fn from_ndjson_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut frame = StreamlineFrame::default();

        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(trimmed)? {
                Value::Object(record) => frame.push_record(record),
                other => {
                    return Err(StreamlineError::MalformedData(format!(
                        "expected a JSON object per line, found {}",
                        json_kind(&other)
                    )))
                }
            }
        }

        Ok(frame)
    }

    /// Load a JSON table from disk
    pub fn read_json(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let value: Value = serde_json::from_reader(BufReader::new(file))?;
        Self::from_value(value)
    }

    /// Interpret a JSON object as a table.
    ///
    /// Column values may be arrays (one entry per row) or index-keyed objects
    /// (`{"0": ..., "1": ...}`) as written by pandas' `to_json`. Columns keep
    /// their own lengths; `num_rows` reports the longest one.
    pub fn from_value(value: Value) -> Result<Self> {
        let object = match value {
            Value::Object(object) => object,
            other => {
                return Err(StreamlineError::MalformedData(format!(
                    "expected a JSON object, found {}",
                    json_kind(&other)
                )))
            }
        };

        let mut columns = BTreeMap::new();
        let mut rows = 0;

        for (name, column) in object {
            let values = match column {
                Value::Array(values) => values,
                Value::Object(indexed) => indexed_values(indexed),
                scalar => vec![scalar],
            };
            rows = rows.max(values.len());
            columns.insert(name, values);
        }

        Ok(Self { columns, rows })
    }

    /// Serialize the table in column orientation
    pub fn to_value(&self) -> Value {
        let object: Map<String, Value> = self
            .columns
            .iter()
            .map(|(name, values)| (name.clone(), Value::Array(values.clone())))
            .collect();
        Value::Object(object)
    }

    /// Write the table as plain JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, &self.to_value())?;
        writer.flush()?;
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    fn push_record(&mut self, record: Map<String, Value>) {
        let row = self.rows;
        for (name, value) in record {
            let column = self
                .columns
                .entry(name)
                .or_insert_with(|| vec![Value::Null; row]);
            column.push(value);
        }
        self.rows += 1;
        for column in self.columns.values_mut() {
            column.resize(self.rows, Value::Null);
        }
    }
}

/// Order `{"0": a, "10": b, "2": c}` by numeric key
fn indexed_values(indexed: Map<String, Value>) -> Vec<Value> {
    let mut entries: Vec<(String, Value)> = indexed.into_iter().collect();
    entries.sort_by(|(a, _), (b, _)| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    });
    entries.into_iter().map(|(_, v)| v).collect()
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
