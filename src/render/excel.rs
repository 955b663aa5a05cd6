use std::fmt::Write;

use super::{body_rows, RenderOptions, Renderer};
use crate::error::ReportResult;
use crate::models::ExportFormat;
use crate::report::ReportDocument;
use crate::table::Value;

/// SpreadsheetML 2003 workbook, readable by Excel and LibreOffice.
pub struct ExcelRenderer;

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\n' => escaped.push_str("&#10;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn cell(output: &mut String, value: &Value, style: Option<&str>) {
    let style = style
        .map(|id| format!(" ss:StyleID=\"{id}\""))
        .unwrap_or_default();
    let (kind, text) = match value {
        Value::Int(number) => ("Number", number.to_string()),
        Value::Float(number) => ("Number", number.to_string()),
        Value::Bool(flag) => ("Boolean", if *flag { "1" } else { "0" }.to_string()),
        other => ("String", escape(&other.display())),
    };
    let _ = write!(output, "<Cell{style}><Data ss:Type=\"{kind}\">{text}</Data></Cell>");
}

fn text_row(output: &mut String, cells: &[String], style: Option<&str>) {
    output.push_str("<Row>");
    for text in cells {
        cell(output, &Value::text(text.as_str()), style);
    }
    output.push_str("</Row>\n");
}

impl Renderer for ExcelRenderer {
    fn format(&self) -> ExportFormat {
        ExportFormat::Excel
    }

    fn encode(&self, document: &ReportDocument, options: &RenderOptions) -> ReportResult<Vec<u8>> {
        let mut output = String::new();
        let _ = writeln!(output, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        let _ = writeln!(output, "<?mso-application progid=\"Excel.Sheet\"?>");
        let _ = writeln!(
            output,
            "<Workbook xmlns=\"urn:schemas-microsoft-com:office:spreadsheet\" \
             xmlns:ss=\"urn:schemas-microsoft-com:office:spreadsheet\">"
        );
        let _ = writeln!(
            output,
            "<Styles><Style ss:ID=\"header\"><Font ss:Bold=\"1\"/></Style></Styles>"
        );

        if document.is_report() {
            let _ = writeln!(output, "<Worksheet ss:Name=\"Summary\"><Table>");
            text_row(
                &mut output,
                &["Report".to_string(), document.title.clone()],
                None,
            );
            text_row(
                &mut output,
                &[
                    "Data As Of".to_string(),
                    document.as_of.format("%Y-%m-%d").to_string(),
                ],
                None,
            );
            text_row(
                &mut output,
                &["Period".to_string(), document.period.clone()],
                None,
            );
            for item in &document.summary {
                output.push_str("<Row>");
                cell(&mut output, &Value::text(item.label.as_str()), Some("header"));
                cell(&mut output, &item.value, None);
                output.push_str("</Row>\n");
            }
            let _ = writeln!(output, "</Table></Worksheet>");
        }

        let _ = writeln!(output, "<Worksheet ss:Name=\"Data\"><Table>");
        if options.include_headers && !document.table.columns.is_empty() {
            text_row(&mut output, &document.table.columns, Some("header"));
        }
        for row in body_rows(document, options) {
            output.push_str("<Row>");
            for value in &row {
                cell(&mut output, value, None);
            }
            output.push_str("</Row>\n");
        }
        let _ = writeln!(output, "</Table></Worksheet>");
        let _ = writeln!(output, "</Workbook>");

        Ok(output.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::test_support::*;

    fn encode(document: &ReportDocument) -> String {
        String::from_utf8(
            ExcelRenderer
                .encode(document, &RenderOptions::default())
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn cells_are_typed() {
        let output = encode(&export_document());
        assert!(output.contains("<Data ss:Type=\"Number\">650.5</Data>"));
        assert!(output.contains("<Data ss:Type=\"String\">Oak Elementary</Data>"));
        assert_eq!(output.matches("<Row>").count(), 3);
    }

    #[test]
    fn markup_in_values_is_escaped() {
        let mut document = export_document();
        document.table.rows[0][1] = Value::text("A&B <Academy>");
        let output = encode(&document);
        assert!(output.contains("A&amp;B &lt;Academy&gt;"));
    }

    #[test]
    fn reports_get_a_summary_sheet() {
        let output = encode(&report_document());
        assert!(output.contains("<Worksheet ss:Name=\"Summary\">"));
        assert!(output.contains("Completion Rate"));
    }
}
