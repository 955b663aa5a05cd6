//! Format encoders.
//!
//! Every renderer takes the same `ReportDocument` and `RenderOptions`; the row
//! ceiling for the format is enforced here, after aggregation, before any bytes
//! are produced.

mod csv;
mod excel;
mod json;
mod pdf;

pub use self::csv::CsvRenderer;
pub use self::excel::ExcelRenderer;
pub use self::json::JsonRenderer;
pub use self::pdf::PdfRenderer;

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::error::{ReportError, ReportResult};
use crate::models::ExportFormat;
use crate::report::ReportDocument;
use crate::table::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub include_headers: bool,
    /// Appends a column-sum row. It does not count toward the row ceiling.
    pub include_totals: bool,
    /// Stamped on PDF pages; other formats ignore it.
    pub watermark: Option<String>,
    /// JSON exports wrap rows in a `metadata` envelope.
    pub include_metadata: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            include_headers: true,
            include_totals: false,
            watermark: None,
            include_metadata: true,
        }
    }
}

pub trait Renderer: Send + Sync {
    fn format(&self) -> ExportFormat;

    fn encode(&self, document: &ReportDocument, options: &RenderOptions) -> ReportResult<Vec<u8>>;
}

pub fn renderer_for(format: ExportFormat) -> Box<dyn Renderer> {
    match format {
        ExportFormat::Csv => Box::new(CsvRenderer),
        ExportFormat::Excel => Box::new(ExcelRenderer),
        ExportFormat::Pdf => Box::new(PdfRenderer),
        ExportFormat::Json => Box::new(JsonRenderer),
    }
}

/// Encode `document` as `format`, refusing documents over the format's ceiling.
pub fn render(
    document: &ReportDocument,
    format: ExportFormat,
    options: &RenderOptions,
) -> ReportResult<Artifact> {
    let rows = document.table.len();
    let max = format.max_rows();
    if rows > max {
        return Err(ReportError::RenderLimitExceeded { format, rows, max });
    }
    let bytes = renderer_for(format).encode(document, options)?;
    Ok(Artifact::new(format, bytes))
}

/// Data rows plus the optional totals row, as display strings.
fn body_rows(document: &ReportDocument, options: &RenderOptions) -> Vec<Vec<Value>> {
    let mut rows = document.table.rows.clone();
    if options.include_totals && !document.table.columns.is_empty() {
        rows.push(document.table.totals_row());
    }
    rows
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::NaiveDate;

    use crate::report::{ReportDocument, SummaryItem};
    use crate::table::{Table, Value};

    pub fn sample_table() -> Table {
        let mut table = Table::new(["id", "school_name", "student_count", "total_cost"]);
        table.push(vec![1.into(), "Oak Elementary".into(), 20.into(), 400.0.into()]);
        table.push(vec![2.into(), "Elm, Middle".into(), 30.into(), 650.5.into()]);
        table
    }

    pub fn export_document() -> ReportDocument {
        ReportDocument::export(
            "Bookings Export",
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            "Jan 1, 2024 - Jan 31, 2024".to_string(),
            sample_table(),
        )
    }

    pub fn report_document() -> ReportDocument {
        let mut document = export_document();
        document.title = "Booking Summary Report".to_string();
        document.summary = vec![
            SummaryItem {
                label: "Total Bookings".to_string(),
                value: Value::Int(2),
            },
            SummaryItem {
                label: "Completion Rate".to_string(),
                value: Value::text("50.0%"),
            },
        ];
        document
    }
}
