//! Core domain model for the sales workbook sync: cell normalization, the
//! declarative column table, row mapping, fingerprinting and run records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "salesync-core";

/// Largest magnitude at which every integer is exactly representable as `f64`.
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Raw scalar surfaced by the workbook parser.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    /// Parser-level "not available" marker such as `#N/A` or a textual `NULL`.
    NotAvailable(String),
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

/// Storage-safe canonical value. Every [`CellValue`] normalizes to exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Text(_) => "string",
            Value::Integer(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            other => Some(other.render()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Decimal(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Natural textual form: integers without a fraction, timestamps as ISO-8601.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Decimal(f) => f.to_string(),
            Value::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Decimal(f) => serializer.serialize_f64(*f),
            Value::Timestamp(ts) => {
                serializer.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string())
            }
        }
    }
}

/// Normalize a raw cell into its canonical value. Total and pure.
pub fn normalize(raw: &CellValue) -> Value {
    match raw {
        CellValue::Empty | CellValue::NotAvailable(_) => Value::Null,
        CellValue::Text(s) if s.is_empty() => Value::Null,
        CellValue::Text(s) => Value::Text(s.clone()),
        CellValue::Int(i) => Value::Integer(*i),
        CellValue::Float(f) => normalize_float(*f),
        CellValue::Bool(b) => Value::Text(b.to_string()),
        CellValue::Date(d) => Value::Timestamp(d.and_time(NaiveTime::MIN)),
        CellValue::DateTime(dt) => Value::Timestamp(*dt),
    }
}

fn normalize_float(f: f64) -> Value {
    if !f.is_finite() {
        Value::Null
    } else if f.fract() == 0.0 && f.abs() <= MAX_EXACT_FLOAT_INT {
        Value::Integer(f as i64)
    } else {
        Value::Decimal(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Number,
    Timestamp,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Text => "TEXT",
            ColumnKind::Number => "DOUBLE PRECISION",
            ColumnKind::Timestamp => "TIMESTAMP",
        }
    }
}

/// One destination field, the workbook header it is read from, and its semantic type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub field: &'static str,
    pub source: &'static str,
    pub kind: ColumnKind,
}

const fn col(field: &'static str, source: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec {
        field,
        source,
        kind,
    }
}

/// The fixed business column set of the `sales` table.
pub const SALE_COLUMNS: &[ColumnSpec] = &[
    col("branch", "Branch", ColumnKind::Text),
    col("sale_date", "Date", ColumnKind::Timestamp),
    col("client", "Client", ColumnKind::Text),
    col("items", "Items", ColumnKind::Text),
    col("qty", "Qty", ColumnKind::Number),
    col("unit_of_measure", "Unit of Measure", ColumnKind::Text),
    col("unit_price_usd", "Unit Price $", ColumnKind::Number),
    col("price_subtotal", "Price Subtotal", ColumnKind::Number),
    col("price_subtotal_usd", "Price Subtotal $", ColumnKind::Number),
    col("price_subtotal_with_tax", "Price Subtotal With Tax", ColumnKind::Number),
    col("price_subtotal_with_tax_usd", "Price Subtotal With Tax $", ColumnKind::Number),
    col("rate", "Rate", ColumnKind::Number),
    col("invoice_number", "Invoice Number", ColumnKind::Text),
    col("guest_number", "Guest Number", ColumnKind::Text),
    col("table_number", "Table Number", ColumnKind::Text),
    col("month", "Month", ColumnKind::Text),
    col("tax", "Tax", ColumnKind::Number),
    col("category", "Category", ColumnKind::Text),
    col("group_name", "Group", ColumnKind::Text),
    col("barcode", "Barcode", ColumnKind::Text),
];

/// Destination field table shared by the row mapper and DDL generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    columns: &'static [ColumnSpec],
}

impl ColumnMap {
    pub const fn new(columns: &'static [ColumnSpec]) -> Self {
        Self { columns }
    }

    pub const fn sales() -> Self {
        Self::new(SALE_COLUMNS)
    }

    pub fn columns(&self) -> &'static [ColumnSpec] {
        self.columns
    }

    pub fn fields(&self) -> impl Iterator<Item = &'static str> {
        self.columns.iter().map(|spec| spec.field)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self::sales()
    }
}

/// A parsed workbook row keyed by header name.
pub type SourceRow = BTreeMap<String, CellValue>;

/// Total mapping from every destination field of a [`ColumnMap`] to a normalized value.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    values: BTreeMap<&'static str, Value>,
}

impl MappedRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Fields in lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when every field is null.
    pub fn is_empty(&self) -> bool {
        self.values.values().all(Value::is_null)
    }

    /// Replace the value of an existing field. Unknown fields are ignored so the
    /// field set stays exactly that of the column map.
    pub fn with_value(mut self, field: &str, value: Value) -> Self {
        if let Some(slot) = self.values.get_mut(field) {
            *slot = value;
        }
        self
    }

    /// Deterministic JSON object with keys sorted lexicographically.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.values).expect("mapped record values always serialize")
    }
}

/// Select and rename source columns into the fixed destination field set.
pub fn map_row(row: &SourceRow, map: &ColumnMap) -> MappedRecord {
    let values = map
        .columns()
        .iter()
        .map(|spec| {
            let value = row.get(spec.source).map(normalize).unwrap_or(Value::Null);
            (spec.field, coerce(value, spec.kind))
        })
        .collect();
    MappedRecord { values }
}

/// Fit a normalized value to a column's semantic type. Unconvertible values become null.
pub fn coerce(value: Value, kind: ColumnKind) -> Value {
    match (kind, value) {
        (_, Value::Null) => Value::Null,
        (ColumnKind::Text, Value::Text(s)) => Value::Text(s),
        (ColumnKind::Text, other) => Value::Text(other.render()),
        (ColumnKind::Number, v @ (Value::Integer(_) | Value::Decimal(_))) => v,
        (ColumnKind::Number, Value::Text(s)) => parse_number(&s),
        (ColumnKind::Number, Value::Timestamp(_)) => Value::Null,
        (ColumnKind::Timestamp, v @ Value::Timestamp(_)) => v,
        (ColumnKind::Timestamp, Value::Text(s)) => parse_timestamp(&s),
        (ColumnKind::Timestamp, _) => Value::Null,
    }
}

fn parse_number(text: &str) -> Value {
    let Some(cleaned) = strip_thousands_separators(text.trim()) else {
        return Value::Null;
    };
    if cleaned.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = cleaned.parse::<i64>() {
        return Value::Integer(i);
    }
    cleaned
        .parse::<f64>()
        .map(normalize_float)
        .unwrap_or(Value::Null)
}

/// Drop `,` group separators from the integer part. Any comma outside a
/// well-formed `1,234,567` grouping rejects the text.
fn strip_thousands_separators(text: &str) -> Option<String> {
    if !text.contains(',') {
        return Some(text.to_string());
    }
    let unsigned = text.trim_start_matches(['+', '-']);
    let integer = unsigned.split(['.', 'e', 'E']).next().unwrap_or_default();
    if integer.len() != unsigned.len() && unsigned[integer.len()..].contains(',') {
        return None;
    }
    let mut groups = integer.split(',');
    let lead = groups.next().unwrap_or_default();
    let lead_ok = (1..=3).contains(&lead.len()) && lead.bytes().all(|b| b.is_ascii_digit());
    let rest_ok = groups.all(|g| g.len() == 3 && g.bytes().all(|b| b.is_ascii_digit()));
    (lead_ok && rest_ok).then(|| text.replace(',', ""))
}

fn parse_timestamp(text: &str) -> Value {
    let text = text.trim();
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Value::Timestamp(ts);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Value::Timestamp(ts.naive_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map(|d| Value::Timestamp(d.and_time(NaiveTime::MIN)))
        .unwrap_or(Value::Null)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn fingerprint(record: &MappedRecord) -> Fingerprint {
    Fingerprint::of(record)
}

/// Content-derived row identity: lowercase hex SHA-256 of the canonical record JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const HEX_LEN: usize = 64;

    pub fn of(record: &MappedRecord) -> Self {
        Self(sha256_hex(record.canonical_json().as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mapped record paired with its fingerprint, ready for the upsert engine.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintedRecord {
    pub fingerprint: Fingerprint,
    pub record: MappedRecord,
}

impl FingerprintedRecord {
    pub fn new(record: MappedRecord) -> Self {
        Self {
            fingerprint: Fingerprint::of(&record),
            record,
        }
    }
}

/// Decide whether the remote file must be reprocessed. Only two present, non-empty,
/// equal etags allow a skip.
pub fn should_sync(remote_etag: Option<&str>, last_known_etag: Option<&str>) -> bool {
    match (remote_etag, last_known_etag) {
        (Some(remote), Some(last)) if !remote.is_empty() && !last.is_empty() => remote != last,
        _ => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertCounts {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        self.processed += 1;
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }

    pub fn merge(&mut self, other: UpsertCounts) {
        self.processed += other.processed;
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

/// Revision metadata the remote file store reports for the workbook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRevision {
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub name: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Skipped,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Skipped => "skipped",
            RunStatus::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit entry, one per pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRunRecord {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub file_etag: Option<String>,
    pub file_modified: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

impl SyncRunRecord {
    pub fn completed(counts: UpsertCounts, revision: &FileRevision) -> Self {
        Self {
            processed: counts.processed,
            inserted: counts.inserted,
            updated: counts.updated,
            file_etag: revision.etag.clone(),
            file_modified: revision.last_modified,
            status: RunStatus::Success,
            error_message: None,
        }
    }

    pub fn skipped(revision: &FileRevision) -> Self {
        Self {
            status: RunStatus::Skipped,
            error_message: None,
            ..Self::completed(UpsertCounts::default(), revision)
        }
    }

    pub fn failed(revision: Option<&FileRevision>, message: impl Into<String>) -> Self {
        Self {
            processed: 0,
            inserted: 0,
            updated: 0,
            file_etag: revision.and_then(|r| r.etag.clone()),
            file_modified: revision.and_then(|r| r.last_modified),
            status: RunStatus::Error,
            error_message: Some(message.into()),
        }
    }
}
