use crate::error::{AppError, AppResult, FieldError};
use crate::import::{parse_rows, ImportRequest, ImportSummary, ItemRow, DEFAULT_LOCATION};
use crate::opname::like_pattern;
use crate::{
    delete_all, delete_ids, ensure_affected, map_unique_err, now, run_blocking, AppState, DbState,
    DeleteSummary, Paginated, SelectedIds, MAX_PER_PAGE,
};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

pub const ITEMS_PER_PAGE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ItemForm {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// Only name and location change; the code is the item's identity.
#[derive(Debug, Deserialize)]
pub struct ItemUpdateForm {
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ItemQuery {
    pub search: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

fn location_or_default(location: Option<String>) -> String {
    location
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| DEFAULT_LOCATION.to_string())
}

fn map_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        location: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const SELECT_ITEM: &str = "SELECT id, code, name, location, created_at, updated_at FROM items";

pub fn fetch_items_page(conn: &Connection, query: &ItemQuery) -> AppResult<Paginated<Item>> {
    let pattern = like_pattern(query.search.as_deref());
    let per_page = query.per_page.unwrap_or(ITEMS_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let page = query.page.unwrap_or(1).max(1);

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM items WHERE (?1 IS NULL OR code LIKE ?1 OR name LIKE ?1)",
        params![pattern],
        |row| row.get(0),
    )?;
    let total = usize::try_from(total).unwrap_or_default();

    let mut stmt = conn.prepare(&format!(
        "{SELECT_ITEM}
         WHERE (?1 IS NULL OR code LIKE ?1 OR name LIKE ?1)
         ORDER BY code
         LIMIT ?2 OFFSET ?3"
    ))?;
    let offset = i64::try_from((page - 1).saturating_mul(per_page)).unwrap_or(i64::MAX);
    let rows = stmt.query_map(
        params![pattern, per_page as i64, offset],
        map_item_row,
    )?;
    let mut data = Vec::new();
    for row in rows {
        data.push(row?);
    }

    Ok(Paginated {
        data,
        total,
        page,
        per_page,
        last_page: total.div_ceil(per_page).max(1),
    })
}

fn fetch_item(conn: &Connection, id: i64) -> AppResult<Item> {
    conn.query_row(
        &format!("{SELECT_ITEM} WHERE id = ?"),
        params![id],
        map_item_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("Master barang dengan id {id} tidak ditemukan.")))
}

fn upsert_row(conn: &Connection, row: &ItemRow, ts: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO items (code, name, location, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(code) DO UPDATE SET
            name = excluded.name,
            location = excluded.location,
            updated_at = excluded.updated_at",
        params![row.code, row.name, row.location, ts],
    )
}

pub fn create_item(db: &DbState, form: ItemForm) -> AppResult<Item> {
    let mut errors = Vec::new();
    if form.code.trim().is_empty() {
        errors.push(FieldError::new("code", "Kode barang wajib diisi."));
    }
    if form.name.trim().is_empty() {
        errors.push(FieldError::new("name", "Nama barang wajib diisi."));
    }
    AppError::check_fields(errors)?;

    let conn = db.open()?;
    let ts = now();
    conn.execute(
        "INSERT INTO items (code, name, location, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
        params![
            form.code.trim(),
            form.name.trim(),
            location_or_default(form.location),
            ts
        ],
    )
    .map_err(|e| map_unique_err(e, "Kode barang sudah terdaftar."))?;
    fetch_item(&conn, conn.last_insert_rowid())
}

pub fn update_item(db: &DbState, id: i64, form: ItemUpdateForm) -> AppResult<Item> {
    if form.name.trim().is_empty() {
        return Err(AppError::InvalidFields(vec![FieldError::new(
            "name",
            "Nama barang wajib diisi.",
        )]));
    }
    let conn = db.open()?;
    let affected = conn.execute(
        "UPDATE items SET name = ?, location = ?, updated_at = ? WHERE id = ?",
        params![form.name.trim(), location_or_default(form.location), now(), id],
    )?;
    ensure_affected(affected, "Master barang", id)?;
    fetch_item(&conn, id)
}

pub fn delete_item(db: &DbState, id: i64) -> AppResult<DeleteSummary> {
    let conn = db.open()?;
    let deleted = conn.execute("DELETE FROM items WHERE id = ?", params![id])?;
    ensure_affected(deleted, "Master barang", id)?;
    Ok(DeleteSummary { deleted })
}

pub fn import_items(db: &DbState, request: ImportRequest) -> AppResult<ImportSummary> {
    let raw = request.into_rows()?;
    let parsed = parse_rows::<ItemRow>(&raw);

    let mut conn = db.open()?;
    let tx = conn.transaction()?;
    let ts = now();
    for row in &parsed.rows {
        upsert_row(&tx, row, ts)?;
    }
    tx.commit()?;

    let summary = parsed.summary();
    tracing::info!(
        "master barang import: {} upserted, {} skipped",
        summary.imported,
        summary.skipped
    );
    Ok(summary)
}

pub async fn list_items_axum(
    State(state): State<AppState>,
    query: Result<Query<ItemQuery>, QueryRejection>,
) -> AppResult<Json<Paginated<Item>>> {
    let Query(query) = query?;
    run_blocking(&state, move |db| {
        let conn = db.open()?;
        fetch_items_page(&conn, &query)
    })
    .await
    .map(Json)
}

pub async fn create_item_axum(
    State(state): State<AppState>,
    payload: Result<Json<ItemForm>, JsonRejection>,
) -> AppResult<Json<Item>> {
    let Json(form) = payload?;
    run_blocking(&state, move |db| create_item(db, form))
        .await
        .map(Json)
}

pub async fn update_item_axum(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<ItemUpdateForm>, JsonRejection>,
) -> AppResult<Json<Item>> {
    let Json(form) = payload?;
    run_blocking(&state, move |db| update_item(db, id, form))
        .await
        .map(Json)
}

pub async fn delete_item_axum(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<DeleteSummary>> {
    run_blocking(&state, move |db| delete_item(db, id))
        .await
        .map(Json)
}

pub async fn import_items_axum(
    State(state): State<AppState>,
    payload: Result<Json<ImportRequest>, JsonRejection>,
) -> AppResult<Json<ImportSummary>> {
    let Json(request) = payload?;
    run_blocking(&state, move |db| import_items(db, request))
        .await
        .map(Json)
}

pub async fn delete_selected_items_axum(
    State(state): State<AppState>,
    payload: Result<Json<SelectedIds>, JsonRejection>,
) -> AppResult<Json<DeleteSummary>> {
    let Json(selected) = payload?;
    run_blocking(&state, move |db| {
        let mut conn = db.open()?;
        delete_ids(&mut conn, "items", &selected.ids)
    })
    .await
    .map(Json)
}

pub async fn delete_all_items_axum(State(state): State<AppState>) -> AppResult<Json<DeleteSummary>> {
    let summary = run_blocking(&state, |db| {
        let conn = db.open()?;
        delete_all(&conn, "items")
    })
    .await?;
    tracing::info!("master barang cleared, {} rows removed", summary.deleted);
    Ok(Json(summary))
}
