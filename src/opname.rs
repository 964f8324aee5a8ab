use crate::error::{AppError, AppResult, FieldError};
use crate::import::{parse_rows, ImportRequest, ImportSummary, LedgerRow};
use crate::{
    delete_all, delete_ids, ensure_affected, map_unique_err, now, run_blocking, AppState, DbState,
    DeleteSummary, SelectedIds,
};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

const DUPLICATE_CODE: &str = "Kode opname sudah digunakan oleh data lain.";

/// Book-stock record for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub opening_qty: i64,
    pub inbound_qty: i64,
    pub outbound_qty: i64,
    pub unit: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Opening plus inbound minus outbound; not clamped at zero, saturating at the i64 bounds.
    pub fn book_qty(&self) -> i64 {
        self.opening_qty
            .saturating_add(self.inbound_qty)
            .saturating_sub(self.outbound_qty)
    }
}

#[derive(Debug, Deserialize)]
pub struct LedgerForm {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub opening_qty: i64,
    #[serde(default)]
    pub inbound_qty: i64,
    #[serde(default)]
    pub outbound_qty: i64,
    #[serde(default)]
    pub unit: String,
}

impl LedgerForm {
    fn validate(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        if self.code.trim().is_empty() {
            errors.push(FieldError::new("code", "Kode barang wajib diisi."));
        }
        if self.name.trim().is_empty() {
            errors.push(FieldError::new("name", "Nama barang wajib diisi."));
        }
        for (field, value) in [
            ("opening_qty", self.opening_qty),
            ("inbound_qty", self.inbound_qty),
            ("outbound_qty", self.outbound_qty),
        ] {
            if value < 0 {
                errors.push(FieldError::new(field, "Jumlah tidak boleh negatif."));
            }
        }
        AppError::check_fields(errors)
    }

    fn into_row(self) -> LedgerRow {
        LedgerRow {
            code: self.code.trim().to_string(),
            name: self.name.trim().to_string(),
            opening_qty: self.opening_qty,
            inbound_qty: self.inbound_qty,
            outbound_qty: self.outbound_qty,
            unit: self.unit.trim().to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LedgerQuery {
    pub search: Option<String>,
}

fn map_ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        opening_qty: row.get(3)?,
        inbound_qty: row.get(4)?,
        outbound_qty: row.get(5)?,
        unit: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const SELECT_LEDGER: &str = "SELECT id, code, name, opening_qty, inbound_qty, outbound_qty, unit, created_at, updated_at
     FROM ledger_entries";

/// Newest first, optionally narrowed by code or name.
pub fn fetch_ledger(conn: &Connection, search: Option<&str>) -> AppResult<Vec<LedgerEntry>> {
    let pattern = like_pattern(search);
    let mut stmt = conn.prepare(&format!(
        "{SELECT_LEDGER}
         WHERE (?1 IS NULL OR code LIKE ?1 OR name LIKE ?1)
         ORDER BY id DESC"
    ))?;
    let rows = stmt.query_map(params![pattern], map_ledger_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

/// Whole ledger in insertion order, the order reconciliation expects.
pub fn fetch_ledger_for_report(conn: &Connection) -> AppResult<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!("{SELECT_LEDGER} ORDER BY id ASC"))?;
    let rows = stmt.query_map([], map_ledger_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

fn fetch_entry(conn: &Connection, id: i64) -> AppResult<LedgerEntry> {
    conn.query_row(
        &format!("{SELECT_LEDGER} WHERE id = ?"),
        params![id],
        map_ledger_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("Opname dengan id {id} tidak ditemukan.")))
}

pub(crate) fn like_pattern(search: Option<&str>) -> Option<String> {
    search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{s}%"))
}

fn upsert_row(conn: &Connection, row: &LedgerRow, ts: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO ledger_entries (code, name, opening_qty, inbound_qty, outbound_qty, unit, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(code) DO UPDATE SET
            name = excluded.name,
            opening_qty = excluded.opening_qty,
            inbound_qty = excluded.inbound_qty,
            outbound_qty = excluded.outbound_qty,
            unit = excluded.unit,
            updated_at = excluded.updated_at",
        params![
            row.code,
            row.name,
            row.opening_qty,
            row.inbound_qty,
            row.outbound_qty,
            row.unit,
            ts
        ],
    )
}

pub fn create_ledger_entry(db: &DbState, form: LedgerForm) -> AppResult<LedgerEntry> {
    form.validate()?;
    let row = form.into_row();
    let conn = db.open()?;
    upsert_row(&conn, &row, now())?;
    let id: i64 = conn.query_row(
        "SELECT id FROM ledger_entries WHERE code = ?",
        params![row.code],
        |r| r.get(0),
    )?;
    tracing::info!("opname entry {} saved", row.code);
    fetch_entry(&conn, id)
}

pub fn update_ledger_entry(db: &DbState, id: i64, form: LedgerForm) -> AppResult<LedgerEntry> {
    form.validate()?;
    let row = form.into_row();
    let conn = db.open()?;
    let affected = conn
        .execute(
            "UPDATE ledger_entries
             SET code = ?, name = ?, opening_qty = ?, inbound_qty = ?, outbound_qty = ?, unit = ?, updated_at = ?
             WHERE id = ?",
            params![
                row.code,
                row.name,
                row.opening_qty,
                row.inbound_qty,
                row.outbound_qty,
                row.unit,
                now(),
                id
            ],
        )
        .map_err(|e| map_unique_err(e, DUPLICATE_CODE))?;
    ensure_affected(affected, "Opname", id)?;
    fetch_entry(&conn, id)
}

pub fn delete_ledger_entry(db: &DbState, id: i64) -> AppResult<DeleteSummary> {
    let conn = db.open()?;
    let deleted = conn.execute("DELETE FROM ledger_entries WHERE id = ?", params![id])?;
    ensure_affected(deleted, "Opname", id)?;
    Ok(DeleteSummary { deleted })
}

/// Upserts every row with a code in one transaction; existing codes are overwritten.
pub fn import_ledger(db: &DbState, request: ImportRequest) -> AppResult<ImportSummary> {
    let raw = request.into_rows()?;
    let parsed = parse_rows::<LedgerRow>(&raw);

    let mut conn = db.open()?;
    let tx = conn.transaction()?;
    let ts = now();
    for row in &parsed.rows {
        upsert_row(&tx, row, ts)?;
    }
    tx.commit()?;

    let summary = parsed.summary();
    tracing::info!(
        "opname import: {} upserted, {} skipped",
        summary.imported,
        summary.skipped
    );
    Ok(summary)
}

pub async fn list_opname_axum(
    State(state): State<AppState>,
    query: Result<Query<LedgerQuery>, QueryRejection>,
) -> AppResult<Json<Vec<LedgerEntry>>> {
    let Query(query) = query?;
    let entries = run_blocking(&state, move |db| {
        let conn = db.open()?;
        fetch_ledger(&conn, query.search.as_deref())
    })
    .await?;
    Ok(Json(entries))
}

pub async fn create_opname_axum(
    State(state): State<AppState>,
    payload: Result<Json<LedgerForm>, JsonRejection>,
) -> AppResult<Json<LedgerEntry>> {
    let Json(form) = payload?;
    run_blocking(&state, move |db| create_ledger_entry(db, form))
        .await
        .map(Json)
}

pub async fn update_opname_axum(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<LedgerForm>, JsonRejection>,
) -> AppResult<Json<LedgerEntry>> {
    let Json(form) = payload?;
    run_blocking(&state, move |db| update_ledger_entry(db, id, form))
        .await
        .map(Json)
}

pub async fn delete_opname_axum(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<DeleteSummary>> {
    run_blocking(&state, move |db| delete_ledger_entry(db, id))
        .await
        .map(Json)
}

pub async fn import_opname_axum(
    State(state): State<AppState>,
    payload: Result<Json<ImportRequest>, JsonRejection>,
) -> AppResult<Json<ImportSummary>> {
    let Json(request) = payload?;
    run_blocking(&state, move |db| import_ledger(db, request))
        .await
        .map(Json)
}

pub async fn delete_selected_opname_axum(
    State(state): State<AppState>,
    payload: Result<Json<SelectedIds>, JsonRejection>,
) -> AppResult<Json<DeleteSummary>> {
    let Json(selected) = payload?;
    run_blocking(&state, move |db| {
        let mut conn = db.open()?;
        delete_ids(&mut conn, "ledger_entries", &selected.ids)
    })
    .await
    .map(Json)
}

pub async fn delete_all_opname_axum(State(state): State<AppState>) -> AppResult<Json<DeleteSummary>> {
    let summary = run_blocking(&state, |db| {
        let conn = db.open()?;
        delete_all(&conn, "ledger_entries")
    })
    .await?;
    tracing::info!("opname ledger cleared, {} rows removed", summary.deleted);
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;
    use serde_json::json;

    fn form(code: &str, opening: i64, inbound: i64, outbound: i64) -> LedgerForm {
        LedgerForm {
            code: code.into(),
            name: format!("Barang {code}"),
            opening_qty: opening,
            inbound_qty: inbound,
            outbound_qty: outbound,
            unit: "PCS".into(),
        }
    }

    #[test]
    fn book_qty_is_signed() {
        let db = test_db();
        let entry = create_ledger_entry(db.db(), form("A1", 10, 5, 3)).unwrap();
        assert_eq!(entry.book_qty(), 12);
        let entry = create_ledger_entry(db.db(), form("N1", 1, 0, 4)).unwrap();
        assert_eq!(entry.book_qty(), -3);
    }

    #[test]
    fn create_with_existing_code_overwrites() {
        let db = test_db();
        let first = create_ledger_entry(db.db(), form("A1", 1, 0, 0)).unwrap();
        let second = create_ledger_entry(db.db(), form("A1", 7, 0, 0)).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.opening_qty, 7);
        let conn = db.db().open().unwrap();
        assert_eq!(fetch_ledger(&conn, None).unwrap().len(), 1);
    }

    #[test]
    fn create_rejects_missing_fields() {
        let db = test_db();
        let mut bad = form(" ", -1, 0, 0);
        bad.name = String::new();
        match create_ledger_entry(db.db(), bad).unwrap_err() {
            AppError::InvalidFields(errors) => {
                let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
                assert_eq!(fields, vec!["code", "name", "opening_qty"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn update_unknown_id_is_not_found() {
        let db = test_db();
        let err = update_ledger_entry(db.db(), 42, form("A1", 0, 0, 0)).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = delete_ledger_entry(db.db(), 42).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn update_to_taken_code_is_rejected() {
        let db = test_db();
        create_ledger_entry(db.db(), form("A1", 0, 0, 0)).unwrap();
        let b = create_ledger_entry(db.db(), form("B2", 0, 0, 0)).unwrap();
        let err = update_ledger_entry(db.db(), b.id, form("A1", 0, 0, 0)).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn import_upserts_and_skips_blank_codes() {
        let db = test_db();
        create_ledger_entry(db.db(), form("A1", 1, 1, 1)).unwrap();
        let request: ImportRequest = serde_json::from_value(json!({
            "data": [
                {"kode": "A1", "nama_barang": "Semen", "stok_awal": "20", "masuk": 0, "keluar": 2, "satuan": "SAK"},
                {"kode": "B2", "nama_barang": "Paku", "stok_awal": "x"},
                {"kode": "", "nama_barang": "Kosong"}
            ]
        }))
        .unwrap();
        let summary = import_ledger(db.db(), request).unwrap();
        assert_eq!(summary, ImportSummary { imported: 2, skipped: 1 });

        let conn = db.db().open().unwrap();
        let entries = fetch_ledger_for_report(&conn).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].code, "A1");
        assert_eq!(entries[0].name, "Semen");
        assert_eq!(entries[0].book_qty(), 18);
        assert_eq!(entries[1].opening_qty, 0);
    }

    #[test]
    fn search_matches_code_or_name() {
        let db = test_db();
        create_ledger_entry(db.db(), form("A1", 0, 0, 0)).unwrap();
        create_ledger_entry(db.db(), form("B2", 0, 0, 0)).unwrap();
        let conn = db.db().open().unwrap();
        let found = fetch_ledger(&conn, Some("barang b")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "B2");
        assert_eq!(fetch_ledger(&conn, Some("  ")).unwrap().len(), 2);
    }
}
