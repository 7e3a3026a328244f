//! Attendance report output: JSON for humans and scripts, CSV for spreadsheets.

use std::io::Write;

use rollcall_core::AttendanceStatus;
use serde::Serialize;

use crate::store::ReportRow;

/// Per-status counts over a set of report rows.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReportTotals {
    pub present: usize,
    pub late: usize,
    pub absent: usize,
}

#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub totals: ReportTotals,
    pub rows: &'a [ReportRow],
}

pub fn totals(rows: &[ReportRow]) -> ReportTotals {
    rows.iter().fold(ReportTotals::default(), |mut t, row| {
        match row.status {
            AttendanceStatus::Present => t.present += 1,
            AttendanceStatus::Late => t.late += 1,
            AttendanceStatus::Absent => t.absent += 1,
        }
        t
    })
}

pub fn to_json(rows: &[ReportRow]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&Report {
        totals: totals(rows),
        rows,
    })
}

/// Write rows as CSV with a header line. Returns the number of data rows.
pub fn write_csv<W: Write>(rows: &[ReportRow], writer: W) -> Result<usize, csv::Error> {
    let mut out = csv::Writer::from_writer(writer);
    for row in rows {
        out.serialize(row)?;
    }
    out.flush()?;
    Ok(rows.len())
}
