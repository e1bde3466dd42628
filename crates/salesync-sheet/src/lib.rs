//! Workbook parsing: spreadsheet bytes into header-keyed rows of raw cell values.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Range, Reader};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use salesync_core::{CellValue, SourceRow};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "salesync-sheet";

/// Text cells that mean "no value", matched exactly.
pub const NA_MARKERS: &[&str] = &[
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("reading workbook: {0}")]
    Workbook(#[from] calamine::Error),
    #[error("sheet {name:?} not found (available: {available:?})")]
    SheetNotFound {
        name: String,
        available: Vec<String>,
    },
    #[error("workbook has no sheets")]
    NoSheets,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<SourceRow>,
}

/// Parse workbook bytes (xlsx, xls, xlsb or ods). With `sheet` only that sheet is
/// read; otherwise every sheet in workbook order.
pub fn parse_workbook(bytes: &[u8], sheet: Option<&str>) -> Result<Vec<Sheet>, SheetError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
    let available = workbook.sheet_names();

    let selected = match sheet {
        Some(name) if available.iter().any(|n| n == name) => vec![name.to_string()],
        Some(name) => {
            return Err(SheetError::SheetNotFound {
                name: name.to_string(),
                available,
            })
        }
        None => available,
    };
    if selected.is_empty() {
        return Err(SheetError::NoSheets);
    }

    let mut sheets = Vec::with_capacity(selected.len());
    for name in selected {
        let range = workbook.worksheet_range(&name)?;
        let rows = rows_from_range(&range);
        debug!(sheet = %name, rows = rows.len(), "parsed sheet");
        sheets.push(Sheet { name, rows });
    }
    Ok(sheets)
}

/// First row is the header; fully blank data rows are dropped.
pub fn rows_from_range(range: &Range<Data>) -> Vec<SourceRow> {
    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Vec::new();
    };
    let headers = header_names(header_row);

    rows.filter(|cells| !cells.iter().all(is_blank))
        .map(|cells| {
            headers
                .iter()
                .cloned()
                .zip(cells.iter().map(cell_value))
                .collect()
        })
        .collect()
}

/// Trimmed header names. Blank headers become `Unnamed: {index}` and repeats get
/// `.1`, `.2`, ... suffixes so every column keeps a distinct key.
pub fn header_names(cells: &[Data]) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::new();
    let mut repeats: HashMap<String, usize> = HashMap::new();

    cells
        .iter()
        .enumerate()
        .map(|(idx, cell)| {
            let base = match cell {
                Data::Empty => String::new(),
                other => other.to_string().trim().to_string(),
            };
            let base = if base.is_empty() {
                format!("Unnamed: {idx}")
            } else {
                base
            };

            let mut name = base.clone();
            while used.contains(&name) {
                let n = repeats.entry(base.clone()).or_insert(0);
                *n += 1;
                name = format!("{base}.{n}");
            }
            used.insert(name.clone());
            name
        })
        .collect()
}

fn is_blank(cell: &Data) -> bool {
    match cell {
        Data::Empty => true,
        Data::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

pub fn cell_value(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Empty,
        Data::String(s) if s.is_empty() => CellValue::Empty,
        Data::String(s) if NA_MARKERS.contains(&s.as_str()) => CellValue::NotAvailable(s.clone()),
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Int(i) => CellValue::Int(*i),
        Data::Float(f) => CellValue::Float(*f),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) if dt.is_duration() => CellValue::Float(dt.as_f64()),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) => temporal(ts),
            None => CellValue::Float(dt.as_f64()),
        },
        Data::DateTimeIso(s) => iso_temporal(s),
        Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(e) => CellValue::NotAvailable(e.to_string()),
    }
}

fn temporal(ts: NaiveDateTime) -> CellValue {
    if ts.time() == NaiveTime::MIN {
        CellValue::Date(ts.date())
    } else {
        CellValue::DateTime(ts)
    }
}

fn iso_temporal(text: &str) -> CellValue {
    if let Ok(ts) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return temporal(ts);
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map(CellValue::Date)
        .unwrap_or_else(|_| CellValue::Text(text.to_string()))
}
