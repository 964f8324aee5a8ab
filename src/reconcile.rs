//! Stock reconciliation: folds the scan log into per-code totals and lines
//! them up against the opname ledger.
//!
//! Everything here is pure. The report handlers load the ledger and scan log
//! from storage and hand them to [`reconcile`] on every request.

use crate::opname::LedgerEntry;
use crate::scans::ScanRecord;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name given to scanned codes that have no ledger entry.
pub const UNREGISTERED_NAME: &str = "BARANG TIDAK TERDAFTAR";
pub const UNREGISTERED_UNIT: &str = "-";

/// Grouping key for codes: trimmed and uppercased.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VarianceStatus {
    Matches,
    Surplus,
    Shortage,
}

impl VarianceStatus {
    pub fn from_variance(variance: i64) -> Self {
        match variance.cmp(&0) {
            std::cmp::Ordering::Equal => VarianceStatus::Matches,
            std::cmp::Ordering::Greater => VarianceStatus::Surplus,
            std::cmp::Ordering::Less => VarianceStatus::Shortage,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportSort {
    #[default]
    Code,
    Name,
    VarianceAsc,
    VarianceDesc,
}

#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub text: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub only_scanned: bool,
    pub sort: ReportSort,
}

impl ReportFilter {
    fn accepts_scan(&self, scan: &ScanRecord) -> bool {
        let day = scan.created_at.date_naive();
        self.date_from.map_or(true, |from| day >= from) && self.date_to.map_or(true, |to| day <= to)
    }

    fn needle(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationRow {
    pub code: String,
    pub name: String,
    pub opening_qty: i64,
    pub inbound_qty: i64,
    pub outbound_qty: i64,
    pub book_qty: i64,
    pub scanned_qty: i64,
    pub variance: i64,
    pub status: VarianceStatus,
    pub unit: String,
    pub inspectors: Vec<String>,
    pub latest_scan_time: Option<DateTime<Utc>>,
    pub has_scan: bool,
}

impl ReconciliationRow {
    fn matches_text(&self, needle: &str) -> bool {
        self.code.to_lowercase().contains(needle)
            || self.name.to_lowercase().contains(needle)
            || self.unit.to_lowercase().contains(needle)
            || self
                .inspectors
                .iter()
                .any(|inspector| inspector.to_lowercase().contains(needle))
    }
}

#[derive(Debug)]
struct ScanGroup {
    scanned_qty: i64,
    inspectors: Vec<String>,
    latest_scan_time: DateTime<Utc>,
}

fn group_scans<'a, I>(scans: I) -> BTreeMap<String, ScanGroup>
where
    I: IntoIterator<Item = &'a ScanRecord>,
{
    scans.into_iter().fold(BTreeMap::new(), |mut groups, scan| {
        let group = groups
            .entry(normalize_code(&scan.code))
            .or_insert_with(|| ScanGroup {
                scanned_qty: 0,
                inspectors: Vec::new(),
                latest_scan_time: scan.created_at,
            });
        group.scanned_qty = group.scanned_qty.saturating_add(scan.quantity);
        if let Some(inspector) = scan.inspector.as_deref().filter(|i| !i.is_empty()) {
            if !group.inspectors.iter().any(|seen| seen == inspector) {
                group.inspectors.push(inspector.to_string());
            }
        }
        group.latest_scan_time = group.latest_scan_time.max(scan.created_at);
        groups
    })
}

/// Produces one row per code found in the ledger or the scan log.
///
/// Ledger codes that repeat after normalization collapse to the last entry
/// in input order. The date range narrows the scans before they are
/// grouped; the text filter and `only_scanned` narrow the finished rows.
pub fn reconcile(
    ledger: &[LedgerEntry],
    scans: &[ScanRecord],
    filter: &ReportFilter,
) -> Vec<ReconciliationRow> {
    let mut groups = group_scans(scans.iter().filter(|scan| filter.accepts_scan(scan)));

    let ledger_by_code: BTreeMap<String, &LedgerEntry> = ledger
        .iter()
        .map(|entry| (normalize_code(&entry.code), entry))
        .collect();

    let mut rows = Vec::with_capacity(ledger_by_code.len() + groups.len());
    for (key, entry) in &ledger_by_code {
        let group = groups.remove(key);
        let book_qty = entry.book_qty();
        let scanned_qty = group.as_ref().map_or(0, |g| g.scanned_qty);
        let variance = scanned_qty.saturating_sub(book_qty);
        rows.push(ReconciliationRow {
            code: entry.code.clone(),
            name: entry.name.clone(),
            opening_qty: entry.opening_qty,
            inbound_qty: entry.inbound_qty,
            outbound_qty: entry.outbound_qty,
            book_qty,
            scanned_qty,
            variance,
            status: VarianceStatus::from_variance(variance),
            unit: entry.unit.clone(),
            has_scan: group.is_some(),
            latest_scan_time: group.as_ref().map(|g| g.latest_scan_time),
            inspectors: group.map(|g| g.inspectors).unwrap_or_default(),
        });
    }

    // whatever is left in `groups` was scanned but never registered
    for (code, group) in groups {
        rows.push(ReconciliationRow {
            code,
            name: UNREGISTERED_NAME.to_string(),
            opening_qty: 0,
            inbound_qty: 0,
            outbound_qty: 0,
            book_qty: 0,
            scanned_qty: group.scanned_qty,
            variance: group.scanned_qty,
            status: VarianceStatus::from_variance(group.scanned_qty),
            unit: UNREGISTERED_UNIT.to_string(),
            inspectors: group.inspectors,
            latest_scan_time: Some(group.latest_scan_time),
            has_scan: true,
        });
    }

    if let Some(needle) = filter.needle() {
        rows.retain(|row| row.matches_text(&needle));
    }
    if filter.only_scanned {
        rows.retain(|row| row.has_scan);
    }

    sort_rows(&mut rows, filter.sort);
    rows
}

fn sort_rows(rows: &mut [ReconciliationRow], sort: ReportSort) {
    match sort {
        ReportSort::Code => rows.sort_by_cached_key(|row| normalize_code(&row.code)),
        ReportSort::Name => rows.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| normalize_code(&a.code).cmp(&normalize_code(&b.code)))
        }),
        ReportSort::VarianceAsc => rows.sort_by(|a, b| {
            a.variance
                .cmp(&b.variance)
                .then_with(|| normalize_code(&a.code).cmp(&normalize_code(&b.code)))
        }),
        ReportSort::VarianceDesc => rows.sort_by(|a, b| {
            b.variance
                .cmp(&a.variance)
                .then_with(|| normalize_code(&a.code).cmp(&normalize_code(&b.code)))
        }),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total_rows: usize,
    pub total_book: i64,
    pub total_scanned: i64,
    pub total_variance: i64,
    pub count_matches: usize,
    pub count_surplus: usize,
    pub count_shortage: usize,
    /// Whole percent of rows whose variance is zero; 0 for an empty report.
    pub match_rate: u32,
}

pub fn summarize<'a, I>(rows: I) -> ReportSummary
where
    I: IntoIterator<Item = &'a ReconciliationRow>,
{
    let mut summary = rows.into_iter().fold(ReportSummary::default(), |mut acc, row| {
        acc.total_rows += 1;
        acc.total_book = acc.total_book.saturating_add(row.book_qty);
        acc.total_scanned = acc.total_scanned.saturating_add(row.scanned_qty);
        acc.total_variance = acc.total_variance.saturating_add(row.variance);
        match row.status {
            VarianceStatus::Matches => acc.count_matches += 1,
            VarianceStatus::Surplus => acc.count_surplus += 1,
            VarianceStatus::Shortage => acc.count_shortage += 1,
        }
        acc
    });
    if summary.total_rows > 0 {
        summary.match_rate =
            ((summary.count_matches as f64 * 100.0) / summary.total_rows as f64).round() as u32;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ledger(id: i64, code: &str, opening: i64, inbound: i64, outbound: i64) -> LedgerEntry {
        LedgerEntry {
            id,
            code: code.to_string(),
            name: format!("Barang {code}"),
            opening_qty: opening,
            inbound_qty: inbound,
            outbound_qty: outbound,
            unit: "PCS".to_string(),
            created_at: at(1, 8),
            updated_at: at(1, 8),
        }
    }

    fn scan(id: i64, code: &str, inspector: Option<&str>, qty: i64, when: DateTime<Utc>) -> ScanRecord {
        ScanRecord {
            id,
            code: code.to_string(),
            inspector: inspector.map(str::to_string),
            quantity: qty,
            created_at: when,
            updated_at: when,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn find<'a>(rows: &'a [ReconciliationRow], code: &str) -> &'a ReconciliationRow {
        rows.iter().find(|r| r.code == code).expect("row present")
    }

    #[test]
    fn scans_from_several_inspectors_sum_to_book_stock() {
        let ledger = vec![ledger(1, "A1", 10, 5, 3)];
        let scans = vec![
            scan(1, "A1", Some("X"), 7, at(2, 9)),
            scan(2, "A1", Some("Y"), 5, at(2, 10)),
        ];
        let rows = reconcile(&ledger, &scans, &ReportFilter::default());
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.book_qty, 12);
        assert_eq!(row.scanned_qty, 12);
        assert_eq!(row.variance, 0);
        assert_eq!(row.status, VarianceStatus::Matches);
        assert_eq!(row.inspectors, vec!["X".to_string(), "Y".to_string()]);
        assert_eq!(row.latest_scan_time, Some(at(2, 10)));
        assert!(row.has_scan);
    }

    #[test]
    fn unscanned_item_with_no_movement_matches() {
        let rows = reconcile(&[ledger(1, "B2", 0, 0, 0)], &[], &ReportFilter::default());
        let row = find(&rows, "B2");
        assert_eq!(row.scanned_qty, 0);
        assert_eq!(row.variance, 0);
        assert_eq!(row.status, VarianceStatus::Matches);
        assert!(!row.has_scan);
        assert!(row.inspectors.is_empty());
        assert_eq!(row.latest_scan_time, None);
    }

    #[test]
    fn scanned_code_without_ledger_becomes_orphan() {
        let rows = reconcile(&[], &[scan(1, "C9", Some("Z"), 4, at(3, 9))], &ReportFilter::default());
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.code, "C9");
        assert_eq!(row.name, UNREGISTERED_NAME);
        assert_eq!(row.book_qty, 0);
        assert_eq!(row.variance, 4);
        assert_eq!(row.status, VarianceStatus::Surplus);
        assert!(row.has_scan);
    }

    #[test]
    fn text_filter_matches_inspector_names() {
        let ledger = vec![ledger(1, "A1", 10, 5, 3), ledger(2, "B2", 0, 0, 0)];
        let scans = vec![
            scan(1, "A1", Some("X"), 7, at(2, 9)),
            scan(2, "A1", Some("Y"), 5, at(2, 10)),
        ];
        let filter = ReportFilter {
            text: Some("x".into()),
            ..Default::default()
        };
        let rows = reconcile(&ledger, &scans, &filter);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].code, "A1");
    }

    #[test]
    fn text_filter_checks_code_name_and_unit() {
        let mut box_item = ledger(3, "K7", 1, 0, 0);
        box_item.unit = "BOX".into();
        let ledger = vec![ledger(1, "A1", 1, 0, 0), ledger(2, "B2", 1, 0, 0), box_item];
        let by = |text: &str| {
            let filter = ReportFilter {
                text: Some(text.into()),
                ..Default::default()
            };
            reconcile(&ledger, &[], &filter)
                .into_iter()
                .map(|r| r.code)
                .collect::<Vec<_>>()
        };
        assert_eq!(by("b2"), vec!["B2"]);
        assert_eq!(by("barang a1"), vec!["A1"]);
        assert_eq!(by("box"), vec!["K7"]);
        assert_eq!(by("   "), vec!["A1", "B2", "K7"]);
    }

    #[test]
    fn book_stock_may_go_negative() {
        let rows = reconcile(&[ledger(1, "N1", 2, 0, 5)], &[], &ReportFilter::default());
        assert_eq!(rows[0].book_qty, -3);
        assert_eq!(rows[0].variance, 3);
        assert_eq!(rows[0].status, VarianceStatus::Surplus);
    }

    #[test]
    fn extreme_quantities_saturate_instead_of_overflowing() {
        let ledger = vec![
            ledger(1, "A1", i64::MAX, 1, 0),
            ledger(2, "B2", 0, 0, i64::MAX),
        ];
        let scans = vec![
            scan(1, "A1", Some("X"), i64::MAX, at(2, 9)),
            scan(2, "A1", Some("Y"), i64::MAX, at(2, 10)),
            scan(3, "C9", None, i64::MAX, at(2, 11)),
        ];
        let rows = reconcile(&ledger, &scans, &ReportFilter::default());
        let a1 = find(&rows, "A1");
        assert_eq!(a1.book_qty, i64::MAX);
        assert_eq!(a1.scanned_qty, i64::MAX);
        assert_eq!(a1.variance, 0);
        let b2 = find(&rows, "B2");
        assert_eq!(b2.book_qty, -i64::MAX);
        assert_eq!(b2.variance, i64::MAX);

        let summary = summarize(&rows);
        assert_eq!(summary.total_book, 0);
        assert_eq!(summary.total_scanned, i64::MAX);
        assert_eq!(summary.total_variance, i64::MAX);
    }

    #[test]
    fn shortage_when_fewer_scanned_than_booked() {
        let rows = reconcile(
            &[ledger(1, "S1", 10, 0, 0)],
            &[scan(1, "S1", None, 4, at(2, 9))],
            &ReportFilter::default(),
        );
        assert_eq!(rows[0].variance, -6);
        assert_eq!(rows[0].status, VarianceStatus::Shortage);
        assert!(rows[0].inspectors.is_empty());
    }

    #[test]
    fn codes_are_normalized_on_both_sides() {
        let ledger = vec![ledger(1, " a1 ", 3, 0, 0)];
        let scans = vec![
            scan(1, "A1", Some("X"), 1, at(2, 9)),
            scan(2, "a1  ", Some("X"), 2, at(2, 9)),
        ];
        let rows = reconcile(&ledger, &scans, &ReportFilter::default());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].scanned_qty, 3);
        assert_eq!(rows[0].inspectors, vec!["X".to_string()]);
        assert_eq!(rows[0].variance, 0);
    }

    #[test]
    fn duplicate_ledger_codes_keep_the_last_entry() {
        let ledger = vec![ledger(1, "D1", 5, 0, 0), ledger(2, "d1", 9, 0, 0)];
        let rows = reconcile(&ledger, &[], &ReportFilter::default());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].book_qty, 9);
        assert_eq!(rows[0].code, "d1");
    }

    #[test]
    fn row_count_covers_union_of_codes() {
        let ledger = vec![
            ledger(1, "A1", 1, 0, 0),
            ledger(2, "B2", 1, 0, 0),
            ledger(3, "C3", 1, 0, 0),
        ];
        let scans = vec![
            scan(1, "B2", Some("X"), 1, at(2, 9)),
            scan(2, "Z9", Some("X"), 1, at(2, 9)),
            scan(3, "Z9", Some("Y"), 1, at(2, 9)),
            scan(4, "Y8", None, 2, at(2, 9)),
        ];
        let rows = reconcile(&ledger, &scans, &ReportFilter::default());
        assert_eq!(rows.len(), 5);
        let codes: Vec<_> = rows.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["A1", "B2", "C3", "Y8", "Z9"]);
        assert_eq!(rows.iter().filter(|r| r.name == UNREGISTERED_NAME).count(), 2);
    }

    #[test]
    fn recomputation_is_identical() {
        let ledger = vec![ledger(1, "B2", 3, 1, 0), ledger(2, "A1", 10, 5, 3)];
        let scans = vec![
            scan(1, "A1", Some("Y"), 5, at(2, 10)),
            scan(2, "A1", Some("X"), 7, at(2, 9)),
            scan(3, "Q1", Some("X"), 1, at(2, 11)),
        ];
        let filter = ReportFilter::default();
        let first = reconcile(&ledger, &scans, &filter);
        let second = reconcile(&ledger, &scans, &filter);
        assert_eq!(first, second);
        assert_eq!(first[0].inspectors, vec!["Y".to_string(), "X".to_string()]);
    }

    #[test]
    fn date_range_narrows_scans_before_grouping() {
        let ledger = vec![ledger(1, "A1", 0, 0, 0)];
        let scans = vec![
            scan(1, "A1", Some("X"), 2, at(1, 23)),
            scan(2, "A1", Some("Y"), 3, at(2, 9)),
            scan(3, "A1", Some("Z"), 4, at(3, 9)),
            scan(4, "O1", Some("Z"), 1, at(5, 9)),
        ];
        let filter = ReportFilter {
            date_from: NaiveDate::from_ymd_opt(2024, 3, 2),
            date_to: NaiveDate::from_ymd_opt(2024, 3, 3),
            ..Default::default()
        };
        let rows = reconcile(&ledger, &scans, &filter);
        assert_eq!(rows.len(), 1, "scan outside the range must not create an orphan");
        assert_eq!(rows[0].scanned_qty, 7);
        assert_eq!(rows[0].inspectors, vec!["Y".to_string(), "Z".to_string()]);
    }

    #[test]
    fn only_scanned_hides_untouched_items() {
        let ledger = vec![ledger(1, "A1", 1, 0, 0), ledger(2, "B2", 1, 0, 0)];
        let scans = vec![scan(1, "B2", Some("X"), 1, at(2, 9))];
        let filter = ReportFilter {
            only_scanned: true,
            ..Default::default()
        };
        let rows = reconcile(&ledger, &scans, &filter);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].code, "B2");
    }

    #[test]
    fn variance_sort_orders_rows() {
        let ledger = vec![
            ledger(1, "A1", 5, 0, 0),
            ledger(2, "B2", 0, 0, 0),
            ledger(3, "C3", 1, 0, 0),
        ];
        let scans = vec![scan(1, "B2", None, 2, at(2, 9))];
        let filter = ReportFilter {
            sort: ReportSort::VarianceAsc,
            ..Default::default()
        };
        let codes: Vec<_> = reconcile(&ledger, &scans, &filter)
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(codes, vec!["A1", "C3", "B2"]);

        let filter = ReportFilter {
            sort: ReportSort::VarianceDesc,
            ..Default::default()
        };
        let codes: Vec<_> = reconcile(&ledger, &scans, &filter)
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(codes, vec!["B2", "C3", "A1"]);
    }

    #[test]
    fn empty_inputs_give_empty_report() {
        let rows = reconcile(&[], &[], &ReportFilter::default());
        assert!(rows.is_empty());
        let summary = summarize(&rows);
        assert_eq!(summary.match_rate, 0);
        assert_eq!(summary.total_rows, 0);
    }

    #[test]
    fn summary_counts_statuses() {
        let ledger = vec![
            ledger(1, "A1", 2, 0, 0),
            ledger(2, "B2", 2, 0, 0),
            ledger(3, "C3", 2, 0, 0),
        ];
        let scans = vec![
            scan(1, "A1", None, 2, at(2, 9)),
            scan(2, "B2", None, 5, at(2, 9)),
        ];
        let rows = reconcile(&ledger, &scans, &ReportFilter::default());
        let summary = summarize(&rows);
        assert_eq!(summary.total_rows, 3);
        assert_eq!(summary.total_book, 6);
        assert_eq!(summary.total_scanned, 7);
        assert_eq!(summary.total_variance, 1);
        assert_eq!(summary.count_matches, 1);
        assert_eq!(summary.count_surplus, 1);
        assert_eq!(summary.count_shortage, 1);
        assert_eq!(summary.match_rate, 33);
    }
}
