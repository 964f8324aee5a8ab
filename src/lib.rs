use axum::{
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod import;
pub mod items;
pub mod opname;
pub mod products;
pub mod reconcile;
pub mod report;
pub mod scans;

pub use config::Config;
pub use error::{AppError, AppResult, FieldError};

pub struct DbState {
    path: PathBuf,
}

impl DbState {
    pub fn initialize(db_path: impl AsRef<Path>) -> Result<Self, AppError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::run_migrations(&mut conn)?;
        tracing::info!("database ready at {}", db_path.display());

        Ok(Self { path: db_path })
    }

    pub fn open(&self) -> Result<Connection, AppError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn run_migrations(conn: &mut Connection) -> Result<(), AppError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                location TEXT NOT NULL DEFAULT 'ALL',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                location TEXT NOT NULL DEFAULT 'ALL',
                store_price INTEGER NOT NULL DEFAULT 0,
                dc_price INTEGER NOT NULL DEFAULT 0,
                special_price INTEGER NOT NULL DEFAULT 0,
                discount REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL DEFAULT '',
                opening_qty INTEGER NOT NULL DEFAULT 0,
                inbound_qty INTEGER NOT NULL DEFAULT 0,
                outbound_qty INTEGER NOT NULL DEFAULT 0,
                unit TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scan_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL,
                inspector TEXT NOT NULL DEFAULT '',
                quantity INTEGER NOT NULL CHECK (quantity >= 1),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (code, inspector)
            );

            CREATE INDEX IF NOT EXISTS idx_items_name ON items(name);
            CREATE INDEX IF NOT EXISTS idx_products_name ON products(name);
            CREATE INDEX IF NOT EXISTS idx_scan_records_created ON scan_records(created_at);
            ",
        )?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
}

impl AppState {
    pub fn new(db: DbState) -> Self {
        Self { db: Arc::new(db) }
    }
}

/// Runs synchronous storage work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(state: &AppState, work: F) -> AppResult<T>
where
    F: FnOnce(&DbState) -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(&state.db);
    tokio::task::spawn_blocking(move || work(&db))
        .await
        .map_err(|e| AppError::Internal(format!("blocking task failed: {e}")))?
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Turns a UNIQUE violation into a user-facing validation error.
pub(crate) fn map_unique_err(err: rusqlite::Error, message: &str) -> AppError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _) if e.code == ErrorCode::ConstraintViolation => {
            AppError::Validation(message.to_string())
        }
        other => AppError::Database(other),
    }
}

pub(crate) fn ensure_affected(affected: usize, what: &str, id: i64) -> AppResult<()> {
    if affected == 0 {
        return Err(AppError::NotFound(format!("{what} dengan id {id} tidak ditemukan.")));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct SelectedIds {
    pub ids: Vec<i64>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DeleteSummary {
    pub deleted: usize,
}

/// `table` is always one of the fixed table names of this crate.
pub(crate) fn delete_ids(
    conn: &mut Connection,
    table: &'static str,
    ids: &[i64],
) -> AppResult<DeleteSummary> {
    if ids.is_empty() {
        return Err(AppError::Validation("Pilih minimal satu data.".into()));
    }
    let tx = conn.transaction()?;
    let placeholders = vec!["?"; ids.len()].join(", ");
    let deleted = tx.execute(
        &format!("DELETE FROM {table} WHERE id IN ({placeholders})"),
        params_from_iter(ids.iter()),
    )?;
    tx.commit()?;
    Ok(DeleteSummary { deleted })
}

pub(crate) fn delete_all(conn: &Connection, table: &'static str) -> AppResult<DeleteSummary> {
    let deleted = conn.execute(&format!("DELETE FROM {table}"), [])?;
    Ok(DeleteSummary { deleted })
}

/// Upper bound for any client-supplied page size.
pub const MAX_PER_PAGE: usize = 500;

#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub last_page: usize,
}

impl<T> Paginated<T> {
    /// Slices an already-filtered list. Pages are 1-based; page 0 is read as 1,
    /// a page past the end comes back empty.
    pub fn from_vec(all: Vec<T>, page: Option<usize>, per_page: usize) -> Self {
        let per_page = per_page.clamp(1, MAX_PER_PAGE);
        let total = all.len();
        let last_page = total.div_ceil(per_page).max(1);
        let page = page.unwrap_or(1).max(1);
        let data = all
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();
        Self {
            data,
            total,
            page,
            per_page,
            last_page,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/items", get(items::list_items_axum).post(items::create_item_axum))
        .route("/api/items/import", post(items::import_items_axum))
        .route("/api/items/delete-selected", post(items::delete_selected_items_axum))
        .route("/api/items/delete-all", post(items::delete_all_items_axum))
        .route(
            "/api/items/:id",
            put(items::update_item_axum).delete(items::delete_item_axum),
        )
        .route(
            "/api/products",
            get(products::list_products_axum).post(products::create_product_axum),
        )
        .route("/api/products/import", post(products::import_products_axum))
        .route("/api/products/labels", post(products::product_labels_axum))
        .route(
            "/api/products/delete-selected",
            post(products::delete_selected_products_axum),
        )
        .route("/api/products/delete-all", post(products::delete_all_products_axum))
        .route(
            "/api/products/:id",
            put(products::update_product_axum).delete(products::delete_product_axum),
        )
        .route(
            "/api/opname",
            get(opname::list_opname_axum).post(opname::create_opname_axum),
        )
        .route("/api/opname/import", post(opname::import_opname_axum))
        .route("/api/opname/delete-selected", post(opname::delete_selected_opname_axum))
        .route("/api/opname/delete-all", post(opname::delete_all_opname_axum))
        .route(
            "/api/opname/:id",
            put(opname::update_opname_axum).delete(opname::delete_opname_axum),
        )
        .route("/api/scans", get(scans::list_scans_axum).post(scans::record_scan_axum))
        .route("/api/scans/import", post(scans::import_scans_axum))
        .route("/api/scans/reset", post(scans::reset_scans_axum))
        .route("/api/scans/delete-selected", post(scans::delete_selected_scans_axum))
        .route(
            "/api/scans/:id",
            put(scans::update_scan_axum).delete(scans::delete_scan_axum),
        )
        .route("/api/scans/:id/decrement", post(scans::decrement_scan_axum))
        .route("/api/report", get(report::get_report_axum))
        .route("/api/report/export", get(report::export_report_axum))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn root() -> &'static str {
    "Stock opname service is running"
}

pub async fn run(config: Config) -> Result<(), AppError> {
    let db = DbState::initialize(&config.database_path)?;
    let app = router(AppState::new(db));

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
