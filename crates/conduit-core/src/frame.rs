//! Tabular query results
//!
//! [`DataFrame`] is the rows-by-columns value returned by the connection
//! adapters' `query` methods. [`read_sql`] is the read routine that turns a
//! statement into a frame, honoring [`ReadOptions`].

use crate::{ColumnMeta, ConduitError, Connection, QueryResult, Result, Row, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// Extra read options understood by [`read_sql`]
const KNOWN_EXTRA_OPTIONS: &[&str] = &["columns", "coerce_float"];

/// Options controlling how a statement is read into a [`DataFrame`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadOptions {
    /// Columns to move into the frame's index
    pub index_col: Vec<String>,
    /// When set, the frame is consumed in chunks of this many rows
    pub chunksize: Option<usize>,
    /// Positional statement parameters
    pub params: Vec<Value>,
    /// Additional options forwarded verbatim to the read routine
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index_col(mut self, column: impl Into<String>) -> Self {
        self.index_col.push(column.into());
        self
    }

    pub fn chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = Some(chunksize);
        self
    }

    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Reject option combinations the read routine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if let Some(unknown) = self
            .extra
            .keys()
            .find(|key| !KNOWN_EXTRA_OPTIONS.contains(&key.as_str()))
        {
            return Err(ConduitError::Configuration(format!(
                "Unexpected read option '{}'. Supported options: {}",
                unknown,
                KNOWN_EXTRA_OPTIONS.join(", ")
            )));
        }
        if self.chunksize == Some(0) {
            return Err(ConduitError::Configuration(
                "chunksize must be greater than zero".into(),
            ));
        }
        if let Some(columns) = self.extra.get("columns")
            && !columns
                .as_array()
                .is_some_and(|items| items.iter().all(|c| c.is_string()))
        {
            return Err(ConduitError::Configuration(
                "'columns' must be a list of column names".into(),
            ));
        }
        if let Some(coerce) = self.extra.get("coerce_float")
            && !coerce.is_boolean()
        {
            return Err(ConduitError::Configuration(
                "'coerce_float' must be a boolean".into(),
            ));
        }
        Ok(())
    }

    fn projected_columns(&self) -> Option<Vec<String>> {
        self.extra.get("columns").and_then(|value| {
            value.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
        })
    }

    fn coerce_float(&self) -> bool {
        self.extra
            .get("coerce_float")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true)
    }
}

/// A rows-by-columns result with an optional index
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    columns: Vec<ColumnMeta>,
    index_names: Vec<String>,
    index: Vec<Vec<Value>>,
    rows: Vec<Vec<Value>>,
    chunksize: Option<usize>,
}

impl DataFrame {
    /// Build a frame from column names and value rows
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .enumerate()
                .map(|(idx, name)| ColumnMeta::new(name, "DYNAMIC", idx))
                .collect(),
            index_names: Vec::new(),
            index: Vec::new(),
            rows,
            chunksize: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Names of the index columns, empty for a default positional index
    pub fn index_names(&self) -> &[String] {
        &self.index_names
    }

    /// Index values for `row`, empty for a default positional index
    pub fn index_values(&self, row: usize) -> &[Value] {
        self.index.get(row).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value at `row` in the column named `column`
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// All values of the column named `column`
    pub fn column(&self, column: &str) -> Option<Vec<&Value>> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        Some(self.rows.iter().filter_map(|r| r.get(idx)).collect())
    }

    /// Rows as [`Row`] values, index columns excluded
    pub fn to_rows(&self) -> Vec<Row> {
        let names: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        self.rows
            .iter()
            .map(|values| Row::new(names.clone(), values.clone()))
            .collect()
    }

    /// Chunk size requested at read time
    pub fn chunksize(&self) -> Option<usize> {
        self.chunksize
    }

    /// Split the frame into chunks of the requested size.
    ///
    /// A frame read without a chunk size yields itself as the only chunk.
    pub fn chunks(&self) -> Vec<DataFrame> {
        let size = match self.chunksize {
            Some(size) if size > 0 => size,
            _ => return vec![self.clone()],
        };

        self.rows
            .chunks(size)
            .enumerate()
            .map(|(n, rows)| {
                let start = n * size;
                let index = if self.index.is_empty() {
                    Vec::new()
                } else {
                    self.index[start..start + rows.len()].to_vec()
                };
                DataFrame {
                    columns: self.columns.clone(),
                    index_names: self.index_names.clone(),
                    index,
                    rows: rows.to_vec(),
                    chunksize: None,
                }
            })
            .collect()
    }

    /// Move the named columns into the index.
    pub fn set_index(mut self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self);
        }

        let mut positions = Vec::with_capacity(names.len());
        for name in names {
            let pos = self
                .columns
                .iter()
                .position(|c| &c.name == name)
                .ok_or_else(|| ConduitError::Query(format!("Index column '{}' not found", name)))?;
            positions.push(pos);
        }

        self.index = self
            .rows
            .iter()
            .map(|row| positions.iter().map(|&p| row[p].clone()).collect())
            .collect();
        self.index_names = names.to_vec();
        self.retain_columns(|pos| !positions.contains(&pos));
        Ok(self)
    }

    /// Keep only the named columns, in the requested order.
    pub fn select(mut self, names: &[String]) -> Result<Self> {
        let mut positions = Vec::with_capacity(names.len());
        for name in names {
            let pos = self
                .columns
                .iter()
                .position(|c| &c.name == name)
                .ok_or_else(|| ConduitError::Query(format!("Column '{}' not found", name)))?;
            positions.push(pos);
        }

        self.columns = positions
            .iter()
            .enumerate()
            .map(|(ordinal, &p)| ColumnMeta {
                ordinal,
                ..self.columns[p].clone()
            })
            .collect();
        self.rows = self
            .rows
            .iter()
            .map(|row| positions.iter().map(|&p| row[p].clone()).collect())
            .collect();
        Ok(self)
    }

    fn retain_columns(&mut self, keep: impl Fn(usize) -> bool) {
        let kept: Vec<usize> = (0..self.columns.len()).filter(|&p| keep(p)).collect();
        self.columns = kept
            .iter()
            .enumerate()
            .map(|(ordinal, &p)| ColumnMeta {
                ordinal,
                ..self.columns[p].clone()
            })
            .collect();
        self.rows = self
            .rows
            .iter()
            .map(|row| kept.iter().map(|&p| row[p].clone()).collect())
            .collect();
    }

    fn coerce_decimals(mut self) -> Self {
        for row in &mut self.rows {
            for value in row.iter_mut() {
                if let Value::Decimal(raw) = value
                    && let Ok(parsed) = raw.parse::<f64>()
                {
                    *value = Value::Float64(parsed);
                }
            }
        }
        self
    }
}

impl From<QueryResult> for DataFrame {
    fn from(result: QueryResult) -> Self {
        Self {
            columns: result.columns,
            index_names: Vec::new(),
            index: Vec::new(),
            rows: result.rows.into_iter().map(|row| row.values).collect(),
            chunksize: None,
        }
    }
}

/// Read the result of `sql` on `conn` into a [`DataFrame`].
#[tracing::instrument(skip(conn, sql, options), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
pub async fn read_sql(conn: &dyn Connection, sql: &str, options: &ReadOptions) -> Result<DataFrame> {
    options.validate()?;

    let result = conn.query(sql, &options.params).await?;
    tracing::debug!(
        row_count = result.row_count(),
        execution_time_ms = result.execution_time_ms,
        "statement read"
    );

    let mut frame = DataFrame::from(result);
    if let Some(columns) = options.projected_columns() {
        // Index columns must survive projection so they can be moved afterwards.
        let mut wanted = options.index_col.clone();
        wanted.extend(columns.into_iter().filter(|c| !options.index_col.contains(c)));
        frame = frame.select(&wanted)?;
    }
    if options.coerce_float() {
        frame = frame.coerce_decimals();
    }
    frame = frame.set_index(&options.index_col)?;
    frame.chunksize = options.chunksize;
    Ok(frame)
}
