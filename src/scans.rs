use crate::error::{AppError, AppResult, FieldError};
use crate::import::{parse_rows, ImportRequest, ImportSummary, ScanRow};
use crate::opname::like_pattern;
use crate::reconcile::normalize_code;
use crate::{
    delete_all, delete_ids, ensure_affected, now, run_blocking, AppState, DbState, DeleteSummary,
    SelectedIds,
};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

/// Quantity added by one live barcode scan.
pub const LIVE_SCAN_INCREMENT: i64 = 1;

/// Accumulated physical count for one (code, inspector) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanRecord {
    pub id: i64,
    pub code: String,
    pub inspector: Option<String>,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ScanForm {
    pub code: String,
    #[serde(default)]
    pub inspector: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScanQuantityForm {
    pub quantity: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanQuery {
    pub inspector: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ScanLog {
    pub records: Vec<ScanRecord>,
    /// Every inspector in the log, for the filter dropdown.
    pub inspectors: Vec<String>,
}

const SCAN_COLUMNS: &str = "id, code, inspector, quantity, created_at, updated_at";

fn map_scan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScanRecord> {
    let inspector: String = row.get(2)?;
    Ok(ScanRecord {
        id: row.get(0)?,
        code: row.get(1)?,
        inspector: Some(inspector).filter(|i| !i.is_empty()),
        quantity: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn clean_inspector(inspector: Option<&str>) -> String {
    inspector.map(str::trim).unwrap_or_default().to_string()
}

/// Adds `quantity` to the (code, inspector) record in one statement,
/// inserting it when missing. The stored total saturates at `i64::MAX`.
fn accumulate(
    conn: &Connection,
    code: &str,
    inspector: &str,
    quantity: i64,
    ts: DateTime<Utc>,
) -> AppResult<ScanRecord> {
    let record = conn.query_row(
        &format!(
            "INSERT INTO scan_records (code, inspector, quantity, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(code, inspector) DO UPDATE SET
                quantity = CASE
                    WHEN quantity > 9223372036854775807 - excluded.quantity THEN 9223372036854775807
                    ELSE quantity + excluded.quantity
                END,
                updated_at = excluded.updated_at
             RETURNING {SCAN_COLUMNS}"
        ),
        params![code, inspector, quantity, ts],
        map_scan_row,
    )?;
    Ok(record)
}

pub fn record_scan(db: &DbState, form: ScanForm) -> AppResult<ScanRecord> {
    let code = normalize_code(&form.code);
    if code.is_empty() {
        return Err(AppError::InvalidFields(vec![FieldError::new(
            "code",
            "Barcode wajib diisi.",
        )]));
    }
    let inspector = clean_inspector(form.inspector.as_deref());
    let conn = db.open()?;
    let record = accumulate(&conn, &code, &inspector, LIVE_SCAN_INCREMENT, now())?;
    tracing::debug!("scan {} by {:?} now at {}", record.code, record.inspector, record.quantity);
    Ok(record)
}

pub fn import_scans(db: &DbState, request: ImportRequest) -> AppResult<ImportSummary> {
    let raw = request.into_rows()?;
    let parsed = parse_rows::<ScanRow>(&raw);

    let mut conn = db.open()?;
    let tx = conn.transaction()?;
    let ts = now();
    for row in &parsed.rows {
        accumulate(&tx, &row.code, &row.inspector, row.quantity, ts)?;
    }
    tx.commit()?;

    let summary = parsed.summary();
    tracing::info!(
        "scan import: {} accumulated, {} skipped",
        summary.imported,
        summary.skipped
    );
    Ok(summary)
}

fn fetch_scan(conn: &Connection, id: i64) -> AppResult<ScanRecord> {
    conn.query_row(
        &format!("SELECT {SCAN_COLUMNS} FROM scan_records WHERE id = ?"),
        params![id],
        map_scan_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("Scan dengan id {id} tidak ditemukan.")))
}

/// Replaces the quantity outright; it does not add.
pub fn update_scan_quantity(db: &DbState, id: i64, form: ScanQuantityForm) -> AppResult<ScanRecord> {
    if form.quantity < 1 {
        return Err(AppError::InvalidFields(vec![FieldError::new(
            "quantity",
            "Jumlah minimal 1.",
        )]));
    }
    let conn = db.open()?;
    let affected = conn.execute(
        "UPDATE scan_records SET quantity = ?, updated_at = ? WHERE id = ?",
        params![form.quantity, now(), id],
    )?;
    ensure_affected(affected, "Scan", id)?;
    fetch_scan(&conn, id)
}

/// Takes one unit off a record. Returns `None` when the record hit zero and was removed.
pub fn decrement_scan(db: &DbState, id: i64) -> AppResult<Option<ScanRecord>> {
    let mut conn = db.open()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let decremented = tx
        .query_row(
            &format!(
                "UPDATE scan_records SET quantity = quantity - 1, updated_at = ?
                 WHERE id = ? AND quantity > 1
                 RETURNING {SCAN_COLUMNS}"
            ),
            params![now(), id],
            map_scan_row,
        )
        .optional()?;

    if decremented.is_none() {
        let deleted = tx.execute("DELETE FROM scan_records WHERE id = ?", params![id])?;
        ensure_affected(deleted, "Scan", id)?;
    }
    tx.commit()?;
    Ok(decremented)
}

pub fn delete_scan(db: &DbState, id: i64) -> AppResult<DeleteSummary> {
    let conn = db.open()?;
    let deleted = conn.execute("DELETE FROM scan_records WHERE id = ?", params![id])?;
    ensure_affected(deleted, "Scan", id)?;
    Ok(DeleteSummary { deleted })
}

pub fn reset_scans(db: &DbState) -> AppResult<DeleteSummary> {
    let conn = db.open()?;
    let summary = delete_all(&conn, "scan_records")?;
    tracing::info!("scan log reset, {} records removed", summary.deleted);
    Ok(summary)
}

/// A missing or blank `inspector` lists every inspector's records.
pub fn fetch_scan_log(conn: &Connection, query: &ScanQuery) -> AppResult<ScanLog> {
    let inspector = query
        .inspector
        .as_deref()
        .map(str::trim)
        .filter(|i| !i.is_empty());
    let pattern = like_pattern(query.search.as_deref());

    let mut stmt = conn.prepare(&format!(
        "SELECT {SCAN_COLUMNS} FROM scan_records
         WHERE (?1 IS NULL OR inspector = ?1)
           AND (?2 IS NULL OR code LIKE ?2 OR inspector LIKE ?2)
         ORDER BY code, id"
    ))?;
    let rows = stmt.query_map(params![inspector, pattern], map_scan_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }

    let mut stmt = conn.prepare(
        "SELECT DISTINCT inspector FROM scan_records WHERE inspector <> '' ORDER BY inspector",
    )?;
    let inspectors = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ScanLog {
        records,
        inspectors,
    })
}

/// Whole log in insertion order, so inspector lists come out first-seen.
pub fn fetch_scans_for_report(conn: &Connection) -> AppResult<Vec<ScanRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SCAN_COLUMNS} FROM scan_records ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map([], map_scan_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

pub async fn list_scans_axum(
    State(state): State<AppState>,
    query: Result<Query<ScanQuery>, QueryRejection>,
) -> AppResult<Json<ScanLog>> {
    let Query(query) = query?;
    run_blocking(&state, move |db| {
        let conn = db.open()?;
        fetch_scan_log(&conn, &query)
    })
    .await
    .map(Json)
}

pub async fn record_scan_axum(
    State(state): State<AppState>,
    payload: Result<Json<ScanForm>, JsonRejection>,
) -> AppResult<Json<ScanRecord>> {
    let Json(form) = payload?;
    run_blocking(&state, move |db| record_scan(db, form))
        .await
        .map(Json)
}

pub async fn import_scans_axum(
    State(state): State<AppState>,
    payload: Result<Json<ImportRequest>, JsonRejection>,
) -> AppResult<Json<ImportSummary>> {
    let Json(request) = payload?;
    run_blocking(&state, move |db| import_scans(db, request))
        .await
        .map(Json)
}

pub async fn update_scan_axum(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<ScanQuantityForm>, JsonRejection>,
) -> AppResult<Json<ScanRecord>> {
    let Json(form) = payload?;
    run_blocking(&state, move |db| update_scan_quantity(db, id, form))
        .await
        .map(Json)
}

pub async fn decrement_scan_axum(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<Option<ScanRecord>>> {
    run_blocking(&state, move |db| decrement_scan(db, id))
        .await
        .map(Json)
}

pub async fn delete_scan_axum(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<DeleteSummary>> {
    run_blocking(&state, move |db| delete_scan(db, id))
        .await
        .map(Json)
}

pub async fn delete_selected_scans_axum(
    State(state): State<AppState>,
    payload: Result<Json<SelectedIds>, JsonRejection>,
) -> AppResult<Json<DeleteSummary>> {
    let Json(selected) = payload?;
    run_blocking(&state, move |db| {
        let mut conn = db.open()?;
        delete_ids(&mut conn, "scan_records", &selected.ids)
    })
    .await
    .map(Json)
}

pub async fn reset_scans_axum(State(state): State<AppState>) -> AppResult<Json<DeleteSummary>> {
    run_blocking(&state, reset_scans).await.map(Json)
}
