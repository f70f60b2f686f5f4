//! Dataset Store - the applicant table behind a read-only SQLite connection
//!
//! Architecture: CSV -> in-memory SQLite, loaded once per process, then
//! switched to `query_only`. An existing database file can instead be opened
//! with `SQLITE_OPEN_READ_ONLY`.

use crate::error::{DashboardError, Result};
use crate::schema::{ColumnSpec, SchemaDescriptor};
use csv::ReaderBuilder;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Rows returned by a query, with column names in select order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl ResultTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl fmt::Display for ResultTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(render_cell).collect())
            .collect();

        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &cells {
            for (idx, cell) in row.iter().enumerate() {
                if let Some(width) = widths.get_mut(idx) {
                    *width = (*width).max(cell.chars().count());
                }
            }
        }

        let header: Vec<String> = self
            .columns
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect();
        writeln!(f, "{}", header.join(" | "))?;
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        writeln!(f, "{}", rule.join("-+-"))?;

        for row in &cells {
            let line: Vec<String> = row
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:<width$}", c, width = *w))
                .collect();
            writeln!(f, "{}", line.join(" | "))?;
        }
        write!(f, "({} rows)", self.rows.len())
    }
}

fn render_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct DatasetStore {
    table: String,
    db: Mutex<Connection>,
    read_only_file: bool,
}

impl DatasetStore {
    /// Load a CSV file into an in-memory table named `table`.
    ///
    /// Column types are inferred per column: INTEGER when every non-empty
    /// cell is an integer, REAL when every cell is numeric, TEXT otherwise.
    pub fn from_csv(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading dataset {:?} into table {}", path, table);

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;

        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
        if headers.is_empty() || headers.iter().any(|h| h.is_empty()) {
            return Err(DashboardError::Dataset(format!(
                "CSV {:?} has a missing or empty header",
                path
            )));
        }

        let mut records: Vec<Vec<String>> = Vec::new();
        for result in rdr.records() {
            let record = result?;
            records.push(
                (0..headers.len())
                    .map(|idx| record.get(idx).unwrap_or("").trim().to_string())
                    .collect(),
            );
        }

        let affinities: Vec<Affinity> = (0..headers.len())
            .map(|idx| Affinity::infer(records.iter().map(|r| r[idx].as_str())))
            .collect();

        let mut db = Connection::open_in_memory().map_err(store_error)?;

        let column_defs: Vec<String> = headers
            .iter()
            .zip(&affinities)
            .map(|(h, a)| format!("{} {}", quote_ident(h), a.sql_type()))
            .collect();
        db.execute(
            &format!("CREATE TABLE {} ({})", quote_ident(table), column_defs.join(", ")),
            [],
        )
        .map_err(store_error)?;

        let placeholders: Vec<String> = (1..=headers.len()).map(|i| format!("?{}", i)).collect();
        let insert = format!(
            "INSERT INTO {} VALUES ({})",
            quote_ident(table),
            placeholders.join(", ")
        );

        let tx = db.transaction().map_err(store_error)?;
        {
            let mut stmt = tx.prepare(&insert).map_err(store_error)?;
            for record in &records {
                let values = record
                    .iter()
                    .zip(&affinities)
                    .map(|(cell, affinity)| affinity.coerce(cell));
                stmt.execute(params_from_iter(values)).map_err(store_error)?;
            }
        }
        tx.commit().map_err(store_error)?;

        db.execute_batch("PRAGMA query_only = ON;").map_err(store_error)?;
        info!("Loaded {} rows into {}", records.len(), table);

        Ok(Self {
            table: table.to_string(),
            db: Mutex::new(db),
            read_only_file: false,
        })
    }

    /// Open an existing SQLite database file without write access.
    pub fn open_read_only(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let db = Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(store_error)?;
        let store = Self {
            table: table.to_string(),
            db: Mutex::new(db),
            read_only_file: true,
        };

        if store.describe_schema()?.columns.is_empty() {
            return Err(DashboardError::Dataset(format!(
                "Table {} not found in {:?}",
                table,
                path.as_ref()
            )));
        }
        Ok(store)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn describe_schema(&self) -> Result<SchemaDescriptor> {
        let db = self.lock()?;
        let mut stmt = db
            .prepare(&format!("PRAGMA table_info({})", quote_ident(&self.table)))
            .map_err(store_error)?;
        let columns = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let data_type: String = row.get(2)?;
                Ok(ColumnSpec::new(name, data_type.to_lowercase()))
            })
            .map_err(store_error)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_error)?;

        Ok(SchemaDescriptor::new(self.table.clone(), columns))
    }

    pub fn row_count(&self) -> Result<usize> {
        let db = self.lock()?;
        let count: i64 = db
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(&self.table)),
                [],
                |row| row.get(0),
            )
            .map_err(store_error)?;
        Ok(count as usize)
    }

    /// Whether writes are currently impossible on the connection.
    pub fn is_read_only(&self) -> Result<bool> {
        if self.read_only_file {
            return Ok(true);
        }
        let db = self.lock()?;
        let query_only: i64 = db
            .query_row("PRAGMA query_only", [], |row| row.get(0))
            .map_err(store_error)?;
        Ok(query_only == 1)
    }

    /// Execute a single SELECT query and materialise every row.
    ///
    /// Anything else is refused before it reaches SQLite; `PRAGMA` and
    /// friends report themselves read-only yet can change connection state.
    /// No partial results: any failure while stepping discards the rows read so far.
    pub fn query(&self, sql: &str) -> Result<ResultTable> {
        debug!("Executing: {}", sql);
        ensure_single_query(sql)?;
        let db = self.lock()?;

        let mut stmt = db.prepare(sql).map_err(execution_error)?;
        if !stmt.readonly() {
            return Err(DashboardError::Execution(
                "statement would modify the dataset".to_string(),
            ));
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let column_count = columns.len();

        let mut rows = stmt.query([]).map_err(execution_error)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(execution_error)? {
            let mut cells = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                cells.push(cell_to_json(row.get_ref(idx).map_err(execution_error)?));
            }
            out.push(cells);
        }

        Ok(ResultTable { columns, rows: out })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| DashboardError::Dataset("dataset connection lock poisoned".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Affinity {
    Integer,
    Real,
    Text,
}

impl Affinity {
    fn infer<'a>(cells: impl Iterator<Item = &'a str>) -> Self {
        let mut affinity = Affinity::Integer;
        for cell in cells.filter(|c| !c.is_empty()) {
            if !looks_numeric(cell) {
                return Affinity::Text;
            }
            if affinity == Affinity::Integer && cell.parse::<i64>().is_err() {
                affinity = Affinity::Real;
            }
            if affinity == Affinity::Real && cell.parse::<f64>().is_err() {
                return Affinity::Text;
            }
        }
        affinity
    }

    fn sql_type(self) -> &'static str {
        match self {
            Affinity::Integer => "INTEGER",
            Affinity::Real => "REAL",
            Affinity::Text => "TEXT",
        }
    }

    fn coerce(self, cell: &str) -> SqlValue {
        if cell.is_empty() {
            return SqlValue::Null;
        }
        match self {
            Affinity::Integer => cell
                .parse::<i64>()
                .map(SqlValue::Integer)
                .unwrap_or_else(|_| SqlValue::Text(cell.to_string())),
            Affinity::Real => cell
                .parse::<f64>()
                .map(SqlValue::Real)
                .unwrap_or_else(|_| SqlValue::Text(cell.to_string())),
            Affinity::Text => SqlValue::Text(cell.to_string()),
        }
    }
}

/// Numbers with a leading zero (phone numbers, zip codes) stay text, as do
/// words `f64` would otherwise accept ("inf", "NaN").
fn looks_numeric(cell: &str) -> bool {
    let digits = cell.strip_prefix('-').unwrap_or(cell);
    if digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.") {
        return false;
    }
    digits.bytes().any(|b| b.is_ascii_digit())
}

fn ensure_single_query(sql: &str) -> Result<()> {
    let statements = Parser::parse_sql(&SQLiteDialect {}, sql)
        .map_err(|e| DashboardError::Execution(format!("statement could not be parsed: {}", e)))?;
    match statements.as_slice() {
        [Statement::Query(_)] => Ok(()),
        _ => Err(DashboardError::Execution(
            "only a single SELECT query may run against the dataset".to_string(),
        )),
    }
}

fn cell_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(
            bytes.iter().map(|b| format!("{:02x}", b)).collect(),
        ),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn store_error(err: rusqlite::Error) -> DashboardError {
    DashboardError::Dataset(err.to_string())
}

fn execution_error(err: rusqlite::Error) -> DashboardError {
    DashboardError::Execution(err.to_string())
}
