use calamine::{open_workbook_auto, Data, Reader};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Number(f64),
    Text(String),
    Bool(bool),
    Empty,
}

impl Cell {
    /// Numeric view used by comparisons. Empty cells read as NaN.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(v) => Some(*v),
            Cell::Empty => Some(f64::NAN),
            Cell::Text(s) => s.trim().parse::<f64>().ok(),
            Cell::Bool(_) => None,
        }
    }

    /// Join key view; integral numbers drop their fractional part.
    pub fn key(&self) -> String {
        match self {
            Cell::Number(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", *v as i64),
            Cell::Number(v) => v.to_string(),
            Cell::Text(s) => s.trim().to_string(),
            Cell::Bool(b) => b.to_string(),
            Cell::Empty => String::new(),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Number(v) => write!(f, "{}", v),
            Cell::Text(s) => write!(f, "{:?}", s),
            Cell::Bool(b) => write!(f, "{}", b),
            Cell::Empty => write!(f, "<empty>"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("unsupported table format: {0}")]
    UnsupportedFormat(String),
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("spreadsheet error: {0}")]
    Spreadsheet(String),
    #[error("workbook has no sheets: {0}")]
    NoSheet(PathBuf),
    #[error("table has no header row: {0}")]
    NoHeader(PathBuf),
}

/// Header row plus data rows. Rows shorter than the header read as empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        let rows = rows
            .into_iter()
            .filter(|row| !row.iter().all(Cell::is_empty))
            .collect();
        Self { headers, rows }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<Cell>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).cloned().unwrap_or(Cell::Empty))
                .collect(),
        )
    }
}

/// Loads the first sheet (or the whole file for delimited text) of `path`,
/// choosing the codec from the file extension.
pub fn load_table(path: &Path) -> Result<Table, TableError> {
    if !path.is_file() {
        return Err(TableError::NotFound(path.to_path_buf()));
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => load_delimited(path, b','),
        "tsv" => load_delimited(path, b'\t'),
        "ods" | "xlsx" | "xlsm" | "xlsb" | "xls" => load_workbook(path),
        other => Err(TableError::UnsupportedFormat(if other.is_empty() {
            path.display().to_string()
        } else {
            format!(".{}", other)
        })),
    }
}

fn text_cell(raw: &str) -> Cell {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Cell::Empty;
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return Cell::Number(v);
    }
    match trimmed {
        "true" | "True" | "TRUE" => Cell::Bool(true),
        "false" | "False" | "FALSE" => Cell::Bool(false),
        _ => Cell::Text(raw.to_string()),
    }
}

fn load_delimited(path: &Path, delimiter: u8) -> Result<Table, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();
    if headers.is_empty() {
        return Err(TableError::NoHeader(path.to_path_buf()));
    }
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(text_cell).collect());
    }
    Ok(Table::new(headers, rows))
}

fn data_cell(data: &Data) -> Cell {
    match data {
        Data::Int(v) => Cell::Number(*v as f64),
        Data::Float(v) => Cell::Number(*v),
        Data::Bool(b) => Cell::Bool(*b),
        Data::String(s) if s.trim().is_empty() => Cell::Empty,
        Data::String(s) => Cell::Text(s.clone()),
        Data::Empty => Cell::Empty,
        other => Cell::Text(other.to_string()),
    }
}

fn header_name(data: &Data) -> String {
    match data {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn load_workbook(path: &Path) -> Result<Table, TableError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| TableError::Spreadsheet(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| TableError::NoSheet(path.to_path_buf()))?
        .map_err(|e| TableError::Spreadsheet(e.to_string()))?;
    let mut rows = range.rows();
    let headers = rows
        .next()
        .map(|row| row.iter().map(header_name).collect::<Vec<_>>())
        .ok_or_else(|| TableError::NoHeader(path.to_path_buf()))?;
    let body = rows
        .map(|row| row.iter().map(data_cell).collect())
        .collect();
    Ok(Table::new(headers, body))
}
