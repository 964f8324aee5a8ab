use crate::error::{AppError, AppResult, FieldError};
use crate::opname::fetch_ledger_for_report;
use crate::products::special_prices;
use crate::reconcile::{
    normalize_code, reconcile, summarize, ReconciliationRow, ReportFilter, ReportSort,
    ReportSummary, VarianceStatus,
};
use crate::scans::fetch_scans_for_report;
use crate::{run_blocking, AppState, Paginated};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const REPORT_ROWS_PER_PAGE: usize = 15;

const CSV_HEADER: [&str; 15] = [
    "kode",
    "nama_barang",
    "stok_awal",
    "masuk",
    "keluar",
    "sisa_opname",
    "qty_scan",
    "selisih",
    "status",
    "satuan",
    "harga_khusus",
    "nilai_selisih",
    "inspectors",
    "latest_scan",
    "has_scan",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportQuery {
    pub search: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(default)]
    pub only_scanned: bool,
    #[serde(default)]
    pub sort: ReportSort,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
    #[serde(default)]
    pub format: ExportFormat,
}

fn parse_date(field: &'static str, raw: Option<&str>) -> Result<Option<NaiveDate>, FieldError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| FieldError::new(field, "Format tanggal harus YYYY-MM-DD.")),
    }
}

impl ReportQuery {
    /// Validates the date range and turns the query into an engine filter.
    pub fn to_filter(&self) -> AppResult<ReportFilter> {
        let mut errors = Vec::new();
        let date_from = parse_date("start_date", self.start_date.as_deref()).unwrap_or_else(|e| {
            errors.push(e);
            None
        });
        let date_to = parse_date("end_date", self.end_date.as_deref()).unwrap_or_else(|e| {
            errors.push(e);
            None
        });
        if let (Some(from), Some(to)) = (date_from, date_to) {
            if to < from {
                errors.push(FieldError::new(
                    "end_date",
                    "Tanggal akhir tidak boleh sebelum tanggal awal.",
                ));
            }
        }
        AppError::check_fields(errors)?;

        Ok(ReportFilter {
            text: self.search.clone(),
            date_from,
            date_to,
            only_scanned: self.only_scanned,
            sort: self.sort,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    #[serde(flatten)]
    pub row: ReconciliationRow,
    pub special_price: i64,
    pub variance_value: i64,
}

#[derive(Debug, Serialize)]
pub struct ReportPage {
    pub rows: Paginated<ReportRow>,
    pub summary: ReportSummary,
}

/// Loads current ledger, scan log and prices and reconciles them.
pub fn build_report(conn: &Connection, filter: &ReportFilter) -> AppResult<Vec<ReportRow>> {
    let ledger = fetch_ledger_for_report(conn)?;
    let scans = fetch_scans_for_report(conn)?;
    let prices = special_prices(conn)?;

    Ok(reconcile(&ledger, &scans, filter)
        .into_iter()
        .map(|row| {
            let special_price = prices
                .get(&normalize_code(&row.code))
                .copied()
                .unwrap_or(0);
            ReportRow {
                variance_value: row.variance.saturating_mul(special_price),
                special_price,
                row,
            }
        })
        .collect())
}

pub fn report_page(conn: &Connection, query: &ReportQuery) -> AppResult<ReportPage> {
    let filter = query.to_filter()?;
    let rows = build_report(conn, &filter)?;
    let summary = summarize(rows.iter().map(|r| &r.row));
    Ok(ReportPage {
        rows: Paginated::from_vec(
            rows,
            query.page,
            query.per_page.unwrap_or(REPORT_ROWS_PER_PAGE),
        ),
        summary,
    })
}

pub fn write_csv(rows: &[ReportRow]) -> AppResult<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(CSV_HEADER)?;
    for r in rows {
        let row = &r.row;
        let status = match row.status {
            VarianceStatus::Matches => "matches",
            VarianceStatus::Surplus => "surplus",
            VarianceStatus::Shortage => "shortage",
        };
        let inspectors = if row.inspectors.is_empty() {
            "-".to_string()
        } else {
            row.inspectors.join(", ")
        };
        let latest_scan = row
            .latest_scan_time
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        wtr.write_record([
            row.code.clone(),
            row.name.clone(),
            row.opening_qty.to_string(),
            row.inbound_qty.to_string(),
            row.outbound_qty.to_string(),
            row.book_qty.to_string(),
            row.scanned_qty.to_string(),
            row.variance.to_string(),
            status.to_string(),
            row.unit.clone(),
            r.special_price.to_string(),
            r.variance_value.to_string(),
            inspectors,
            latest_scan,
            row.has_scan.to_string(),
        ])?;
    }
    wtr.into_inner().map_err(|e| AppError::Io(e.into_error()))
}

pub async fn get_report_axum(
    State(state): State<AppState>,
    query: Result<Query<ReportQuery>, QueryRejection>,
) -> AppResult<Json<ReportPage>> {
    let Query(query) = query?;
    run_blocking(&state, move |db| {
        let conn = db.open()?;
        report_page(&conn, &query)
    })
    .await
    .map(Json)
}

pub async fn export_report_axum(
    State(state): State<AppState>,
    query: Result<Query<ReportQuery>, QueryRejection>,
) -> AppResult<Response> {
    let Query(query) = query?;
    let format = query.format;
    let rows = run_blocking(&state, move |db| {
        let filter = query.to_filter()?;
        let conn = db.open()?;
        build_report(&conn, &filter)
    })
    .await?;
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    tracing::info!("report export: {} rows as {:?}", rows.len(), format);

    match format {
        ExportFormat::Json => Ok(Json(json!({
            "success": true,
            "total": rows.len(),
            "data": rows,
            "date": today,
        }))
        .into_response()),
        ExportFormat::Csv => {
            let body = write_csv(&rows)?;
            let disposition = format!("attachment; filename=\"laporan-opname-{today}.csv\"");
            Ok((
                [
                    (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                body,
            )
                .into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_dates_are_ignored() {
        let query = ReportQuery {
            start_date: Some("".into()),
            end_date: Some("  ".into()),
            ..Default::default()
        };
        let filter = query.to_filter().unwrap();
        assert_eq!(filter.date_from, None);
        assert_eq!(filter.date_to, None);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let query = ReportQuery {
            start_date: Some("2024-03-05".into()),
            end_date: Some("2024-03-01".into()),
            ..Default::default()
        };
        match query.to_filter().unwrap_err() {
            AppError::InvalidFields(errors) => assert_eq!(errors[0].field, "end_date"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_date_is_rejected() {
        let query = ReportQuery {
            start_date: Some("05/03/2024".into()),
            ..Default::default()
        };
        assert!(matches!(query.to_filter(), Err(AppError::InvalidFields(_))));
    }

    #[test]
    fn same_day_range_is_allowed() {
        let query = ReportQuery {
            start_date: Some("2024-03-05".into()),
            end_date: Some("2024-03-05".into()),
            ..Default::default()
        };
        let filter = query.to_filter().unwrap();
        assert_eq!(filter.date_from, filter.date_to);
    }

    #[test]
    fn csv_has_header_and_dash_placeholders() {
        let rows = vec![ReportRow {
            row: ReconciliationRow {
                code: "B2".into(),
                name: "Paku, 5cm".into(),
                opening_qty: 1,
                inbound_qty: 0,
                outbound_qty: 0,
                book_qty: 1,
                scanned_qty: 0,
                variance: -1,
                status: VarianceStatus::Shortage,
                unit: "KG".into(),
                inspectors: Vec::new(),
                latest_scan_time: None,
                has_scan: false,
            },
            special_price: 2000,
            variance_value: -2000,
        }];
        let csv = String::from_utf8(write_csv(&rows).unwrap()).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("kode,nama_barang,stok_awal"));
        assert_eq!(
            lines.next().unwrap(),
            "B2,\"Paku, 5cm\",1,0,0,1,0,-1,shortage,KG,2000,-2000,-,-,false"
        );
    }
}
