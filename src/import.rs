//! Schema step for spreadsheet imports.
//!
//! The client parses the sheet and posts each row as a loose JSON object.
//! Rows are mapped here into typed rows before they reach any upsert:
//! a row without a business key is dropped, numbers that do not parse
//! become 0. Indonesian sheet column names are accepted as aliases.

use crate::error::{AppError, AppResult};
use crate::reconcile::normalize_code;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type RawRow = Map<String, Value>;

pub const DEFAULT_LOCATION: &str = "ALL";

const CODE: &[&str] = &["code", "kode", "Barcode", "barcode"];
const NAME: &[&str] = &["name", "nama_barang"];
const LOCATION: &[&str] = &["location", "lokasi"];
const UNIT: &[&str] = &["unit", "satuan"];
const OPENING: &[&str] = &["opening_qty", "stok_awal"];
const INBOUND: &[&str] = &["inbound_qty", "masuk"];
const OUTBOUND: &[&str] = &["outbound_qty", "keluar"];
const INSPECTOR: &[&str] = &["inspector", "Inspector"];
const QUANTITY: &[&str] = &["quantity", "qty", "Quantity"];
const STORE_PRICE: &[&str] = &["store_price", "harga_toko"];
const DC_PRICE: &[&str] = &["dc_price", "harga_dc"];
const SPECIAL_PRICE: &[&str] = &["special_price", "harga_khusus"];
const DISCOUNT: &[&str] = &["discount", "diskon"];

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    #[serde(alias = "data", alias = "items")]
    pub rows: Vec<RawRow>,
}

impl ImportRequest {
    pub fn into_rows(self) -> AppResult<Vec<RawRow>> {
        if self.rows.is_empty() {
            return Err(AppError::Validation("Data kosong.".into()));
        }
        Ok(self.rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

pub trait FromRawRow: Sized {
    /// `None` means the row is dropped from the batch.
    fn from_raw(row: &RawRow) -> Option<Self>;
}

#[derive(Debug)]
pub struct Parsed<T> {
    pub rows: Vec<T>,
    pub skipped: usize,
}

impl<T> Parsed<T> {
    pub fn summary(&self) -> ImportSummary {
        ImportSummary {
            imported: self.rows.len(),
            skipped: self.skipped,
        }
    }
}

pub fn parse_rows<T: FromRawRow>(raw: &[RawRow]) -> Parsed<T> {
    let rows: Vec<T> = raw.iter().filter_map(T::from_raw).collect();
    Parsed {
        skipped: raw.len() - rows.len(),
        rows,
    }
}

fn field<'a>(row: &'a RawRow, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|name| row.get(*name))
        .filter(|value| !value.is_null())
}

fn text(row: &RawRow, names: &[&str]) -> Option<String> {
    let value = match field(row, names)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    Some(value).filter(|v| !v.is_empty())
}

/// Truncates toward zero like an integer cast; anything unreadable is 0.
fn int(row: &RawRow, names: &[&str]) -> i64 {
    match field(row, names) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => parse_int(s.trim()),
        Some(Value::Bool(b)) => i64::from(*b),
        _ => 0,
    }
}

fn parse_int(raw: &str) -> i64 {
    raw.parse::<i64>()
        .ok()
        .or_else(|| {
            raw.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| f.trunc() as i64)
        })
        .unwrap_or(0)
}

/// NaN and infinities read as 0 like any other unreadable value.
fn number(row: &RawRow, names: &[&str]) -> f64 {
    let value = match field(row, names) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|f| f.is_finite()).unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRow {
    pub code: String,
    pub name: String,
    pub location: String,
}

impl FromRawRow for ItemRow {
    fn from_raw(row: &RawRow) -> Option<Self> {
        Some(Self {
            code: text(row, CODE)?,
            name: text(row, NAME).unwrap_or_default(),
            location: text(row, LOCATION).unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub code: String,
    pub name: String,
    pub opening_qty: i64,
    pub inbound_qty: i64,
    pub outbound_qty: i64,
    pub unit: String,
}

impl FromRawRow for LedgerRow {
    fn from_raw(row: &RawRow) -> Option<Self> {
        Some(Self {
            code: text(row, CODE)?,
            name: text(row, NAME).unwrap_or_default(),
            opening_qty: int(row, OPENING),
            inbound_qty: int(row, INBOUND),
            outbound_qty: int(row, OUTBOUND),
            unit: text(row, UNIT).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRow {
    pub code: String,
    pub inspector: String,
    pub quantity: i64,
}

impl FromRawRow for ScanRow {
    fn from_raw(row: &RawRow) -> Option<Self> {
        let code = normalize_code(&text(row, CODE)?);
        let quantity = int(row, QUANTITY);
        if code.is_empty() || quantity < 1 {
            return None;
        }
        Some(Self {
            code,
            inspector: text(row, INSPECTOR).unwrap_or_default(),
            quantity,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductRow {
    pub code: String,
    pub name: String,
    pub location: String,
    pub store_price: i64,
    pub dc_price: i64,
    pub special_price: i64,
    pub discount: f64,
}

impl FromRawRow for ProductRow {
    fn from_raw(row: &RawRow) -> Option<Self> {
        Some(Self {
            code: text(row, CODE)?,
            name: text(row, NAME).unwrap_or_default(),
            location: text(row, LOCATION).unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            store_price: int(row, STORE_PRICE),
            dc_price: int(row, DC_PRICE),
            special_price: int(row, SPECIAL_PRICE),
            discount: number(row, DISCOUNT).clamp(0.0, 100.0),
        })
    }
}
