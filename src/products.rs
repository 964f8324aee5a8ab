use crate::error::{AppError, AppResult, FieldError};
use crate::import::{parse_rows, ImportRequest, ImportSummary, ProductRow, DEFAULT_LOCATION};
use crate::opname::like_pattern;
use crate::reconcile::normalize_code;
use crate::{
    delete_all, delete_ids, ensure_affected, map_unique_err, now, run_blocking, AppState, DbState,
    DeleteSummary, SelectedIds,
};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const DUPLICATE_CODE: &str = "Kode barang sudah terdaftar.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub location: String,
    pub store_price: i64,
    pub dc_price: i64,
    pub special_price: i64,
    /// Percent, 0 to 100.
    pub discount: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a price-tag label needs; drawing happens elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelTuple {
    pub code: String,
    pub name: String,
    pub price: i64,
    pub discount: f64,
    pub discounted_price: i64,
}

pub fn discounted_price(price: i64, discount: f64) -> i64 {
    if discount <= 0.0 {
        return price;
    }
    (price as f64 - price as f64 * discount / 100.0).round() as i64
}

#[derive(Debug, Deserialize)]
pub struct ProductForm {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub store_price: i64,
    #[serde(default)]
    pub dc_price: i64,
    #[serde(default)]
    pub special_price: i64,
    #[serde(default)]
    pub discount: f64,
}

impl ProductForm {
    fn validate(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        if self.code.trim().is_empty() {
            errors.push(FieldError::new("code", "Kode barang wajib diisi."));
        }
        if self.name.trim().is_empty() {
            errors.push(FieldError::new("name", "Nama barang wajib diisi."));
        }
        for (field, value) in [
            ("store_price", self.store_price),
            ("dc_price", self.dc_price),
            ("special_price", self.special_price),
        ] {
            if value < 0 {
                errors.push(FieldError::new(field, "Harga tidak boleh negatif."));
            }
        }
        if !(0.0..=100.0).contains(&self.discount) {
            errors.push(FieldError::new("discount", "Diskon harus di antara 0 dan 100."));
        }
        AppError::check_fields(errors)
    }

    fn into_row(self) -> ProductRow {
        ProductRow {
            code: self.code.trim().to_string(),
            name: self.name.trim().to_string(),
            location: self
                .location
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            store_price: self.store_price,
            dc_price: self.dc_price,
            special_price: self.special_price,
            discount: self.discount,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ProductQuery {
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LabelRequest {
    pub ids: Vec<i64>,
}

const SELECT_PRODUCT: &str = "SELECT id, code, name, location, store_price, dc_price, special_price, discount, created_at, updated_at
     FROM products";

fn map_product_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        location: row.get(3)?,
        store_price: row.get(4)?,
        dc_price: row.get(5)?,
        special_price: row.get(6)?,
        discount: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

pub fn fetch_products(conn: &Connection, search: Option<&str>) -> AppResult<Vec<Product>> {
    let pattern = like_pattern(search);
    let mut stmt = conn.prepare(&format!(
        "{SELECT_PRODUCT}
         WHERE (?1 IS NULL OR code LIKE ?1 OR name LIKE ?1 OR location LIKE ?1)
         ORDER BY id DESC"
    ))?;
    let rows = stmt.query_map(params![pattern], map_product_row)?;

    let mut products = Vec::new();
    for row in rows {
        products.push(row?);
    }
    Ok(products)
}

fn fetch_product(conn: &Connection, id: i64) -> AppResult<Product> {
    conn.query_row(
        &format!("{SELECT_PRODUCT} WHERE id = ?"),
        params![id],
        map_product_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("Barang dengan id {id} tidak ditemukan.")))
}

/// Special price per normalized code, used to put a value on report variance.
pub fn special_prices(conn: &Connection) -> AppResult<HashMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT code, special_price FROM products ORDER BY id ASC")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut prices = HashMap::new();
    for row in rows {
        let (code, price) = row?;
        prices.insert(normalize_code(&code), price);
    }
    Ok(prices)
}

fn upsert_row(conn: &Connection, row: &ProductRow, ts: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO products (code, name, location, store_price, dc_price, special_price, discount, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT(code) DO UPDATE SET
            name = excluded.name,
            location = excluded.location,
            store_price = excluded.store_price,
            dc_price = excluded.dc_price,
            special_price = excluded.special_price,
            discount = excluded.discount,
            updated_at = excluded.updated_at",
        params![
            row.code,
            row.name,
            row.location,
            row.store_price,
            row.dc_price,
            row.special_price,
            row.discount,
            ts
        ],
    )
}

pub fn create_product(db: &DbState, form: ProductForm) -> AppResult<Product> {
    form.validate()?;
    let row = form.into_row();
    let conn = db.open()?;
    let ts = now();
    conn.execute(
        "INSERT INTO products (code, name, location, store_price, dc_price, special_price, discount, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            row.code,
            row.name,
            row.location,
            row.store_price,
            row.dc_price,
            row.special_price,
            row.discount,
            ts
        ],
    )
    .map_err(|e| map_unique_err(e, DUPLICATE_CODE))?;
    tracing::info!("product {} created", row.code);
    fetch_product(&conn, conn.last_insert_rowid())
}

pub fn update_product(db: &DbState, id: i64, form: ProductForm) -> AppResult<Product> {
    form.validate()?;
    let row = form.into_row();
    let conn = db.open()?;
    let affected = conn
        .execute(
            "UPDATE products
             SET code = ?, name = ?, location = ?, store_price = ?, dc_price = ?, special_price = ?, discount = ?, updated_at = ?
             WHERE id = ?",
            params![
                row.code,
                row.name,
                row.location,
                row.store_price,
                row.dc_price,
                row.special_price,
                row.discount,
                now(),
                id
            ],
        )
        .map_err(|e| map_unique_err(e, DUPLICATE_CODE))?;
    ensure_affected(affected, "Barang", id)?;
    fetch_product(&conn, id)
}

pub fn delete_product(db: &DbState, id: i64) -> AppResult<DeleteSummary> {
    let conn = db.open()?;
    let deleted = conn.execute("DELETE FROM products WHERE id = ?", params![id])?;
    ensure_affected(deleted, "Barang", id)?;
    Ok(DeleteSummary { deleted })
}

pub fn import_products(db: &DbState, request: ImportRequest) -> AppResult<ImportSummary> {
    let raw = request.into_rows()?;
    let parsed = parse_rows::<ProductRow>(&raw);

    let mut conn = db.open()?;
    let tx = conn.transaction()?;
    let ts = now();
    for row in &parsed.rows {
        upsert_row(&tx, row, ts)?;
    }
    tx.commit()?;

    let summary = parsed.summary();
    tracing::info!(
        "product import: {} upserted, {} skipped",
        summary.imported,
        summary.skipped
    );
    Ok(summary)
}

/// Label tuples in the order the ids were given; unknown ids are ignored.
pub fn product_labels(db: &DbState, ids: &[i64]) -> AppResult<Vec<LabelTuple>> {
    if ids.is_empty() {
        return Err(AppError::Validation("Pilih minimal satu barang.".into()));
    }
    let conn = db.open()?;
    let placeholders = vec!["?"; ids.len()].join(", ");
    let mut stmt = conn.prepare(&format!("{SELECT_PRODUCT} WHERE id IN ({placeholders})"))?;
    let rows = stmt.query_map(params_from_iter(ids.iter()), map_product_row)?;
    let mut by_id = HashMap::new();
    for row in rows {
        let product = row?;
        by_id.insert(product.id, product);
    }

    Ok(ids
        .iter()
        .filter_map(|id| by_id.get(id))
        .map(|p| LabelTuple {
            code: p.code.clone(),
            name: p.name.clone(),
            price: p.special_price,
            discount: p.discount,
            discounted_price: discounted_price(p.special_price, p.discount),
        })
        .collect())
}

pub async fn list_products_axum(
    State(state): State<AppState>,
    query: Result<Query<ProductQuery>, QueryRejection>,
) -> AppResult<Json<Vec<Product>>> {
    let Query(query) = query?;
    run_blocking(&state, move |db| {
        let conn = db.open()?;
        fetch_products(&conn, query.search.as_deref())
    })
    .await
    .map(Json)
}

pub async fn create_product_axum(
    State(state): State<AppState>,
    payload: Result<Json<ProductForm>, JsonRejection>,
) -> AppResult<Json<Product>> {
    let Json(form) = payload?;
    run_blocking(&state, move |db| create_product(db, form))
        .await
        .map(Json)
}

pub async fn update_product_axum(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<ProductForm>, JsonRejection>,
) -> AppResult<Json<Product>> {
    let Json(form) = payload?;
    run_blocking(&state, move |db| update_product(db, id, form))
        .await
        .map(Json)
}

pub async fn delete_product_axum(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<DeleteSummary>> {
    run_blocking(&state, move |db| delete_product(db, id))
        .await
        .map(Json)
}

pub async fn import_products_axum(
    State(state): State<AppState>,
    payload: Result<Json<ImportRequest>, JsonRejection>,
) -> AppResult<Json<ImportSummary>> {
    let Json(request) = payload?;
    run_blocking(&state, move |db| import_products(db, request))
        .await
        .map(Json)
}

pub async fn product_labels_axum(
    State(state): State<AppState>,
    payload: Result<Json<LabelRequest>, JsonRejection>,
) -> AppResult<Json<Vec<LabelTuple>>> {
    let Json(request) = payload?;
    run_blocking(&state, move |db| product_labels(db, &request.ids))
        .await
        .map(Json)
}

pub async fn delete_selected_products_axum(
    State(state): State<AppState>,
    payload: Result<Json<SelectedIds>, JsonRejection>,
) -> AppResult<Json<DeleteSummary>> {
    let Json(selected) = payload?;
    run_blocking(&state, move |db| {
        let mut conn = db.open()?;
        delete_ids(&mut conn, "products", &selected.ids)
    })
    .await
    .map(Json)
}

pub async fn delete_all_products_axum(
    State(state): State<AppState>,
) -> AppResult<Json<DeleteSummary>> {
    run_blocking(&state, |db| {
        let conn = db.open()?;
        delete_all(&conn, "products")
    })
    .await
    .map(Json)
}
