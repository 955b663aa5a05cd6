use std::fmt::Write;

use super::{body_rows, RenderOptions, Renderer};
use crate::error::ReportResult;
use crate::models::ExportFormat;
use crate::report::ReportDocument;
use crate::table::Value;

const PAGE_WIDTH: u32 = 612;
const PAGE_HEIGHT: u32 = 792;
const MARGIN: u32 = 50;
const LINE_HEIGHT: u32 = 14;
const LINES_PER_PAGE: usize = 50;
const MAX_LINE_CHARS: usize = 110;

/// Plain-text PDF 1.4 document set in Courier, one line per row.
pub struct PdfRenderer;

fn pdf_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars().take(MAX_LINE_CHARS) {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '(' => escaped.push_str("\\("),
            ')' => escaped.push_str("\\)"),
            ch if ch.is_ascii() && !ch.is_ascii_control() => escaped.push(ch),
            _ => escaped.push('?'),
        }
    }
    escaped
}

fn document_lines(document: &ReportDocument, options: &RenderOptions) -> Vec<String> {
    let mut lines = vec![
        document.title.to_uppercase(),
        "=".repeat(document.title.len()),
        String::new(),
        format!(
            "Data as of: {}",
            document.as_of.format("%Y-%m-%d")
        ),
        format!("Period: {}", document.period),
        String::new(),
    ];
    if let Some(description) = &document.description {
        lines.push(description.clone());
        lines.push(String::new());
    }
    if document.is_report() {
        lines.push("SUMMARY".to_string());
        lines.push("-".repeat(7));
        for item in &document.summary {
            lines.push(format!("{}: {}", item.label, item.value.display()));
        }
        lines.push(String::new());
    }
    if options.include_headers && !document.table.columns.is_empty() {
        lines.push(document.table.columns.join(" | "));
        lines.push("-".repeat(MAX_LINE_CHARS.min(document.table.columns.join(" | ").len())));
    }
    for row in body_rows(document, options) {
        let cells: Vec<String> = row.iter().map(Value::display).collect();
        lines.push(cells.join(" | "));
    }
    lines
}

fn page_stream(lines: &[String], watermark: Option<&str>) -> String {
    let mut stream = String::new();
    if let Some(watermark) = watermark {
        let _ = writeln!(stream, "q 0.85 g BT /F2 48 Tf 0.7071 0.7071 -0.7071 0.7071 150 250 Tm ({}) Tj ET Q", pdf_text(watermark));
    }
    let _ = writeln!(stream, "BT /F1 9 Tf {} TL {} {} Td", LINE_HEIGHT, MARGIN, PAGE_HEIGHT - MARGIN);
    for line in lines {
        let _ = writeln!(stream, "({}) '", pdf_text(line));
    }
    let _ = writeln!(stream, "ET");
    stream
}

impl Renderer for PdfRenderer {
    fn format(&self) -> ExportFormat {
        ExportFormat::Pdf
    }

    fn encode(&self, document: &ReportDocument, options: &RenderOptions) -> ReportResult<Vec<u8>> {
        let lines = document_lines(document, options);
        // Never empty: the title block is always present.
        let pages: Vec<&[String]> = lines.chunks(LINES_PER_PAGE).collect();

        // 1 catalog, 2 page tree, 3-4 fonts, then a page and content object per page.
        let first_page_id = 5;
        let mut objects: Vec<String> = Vec::new();
        objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());
        let kids: Vec<String> = (0..pages.len())
            .map(|index| format!("{} 0 R", first_page_id + index * 2))
            .collect();
        objects.push(format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids.join(" "),
            pages.len()
        ));
        objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Courier >>".to_string());
        objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold >>".to_string());
        for (index, page_lines) in pages.iter().enumerate() {
            let content_id = first_page_id + index * 2 + 1;
            objects.push(format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {PAGE_WIDTH} {PAGE_HEIGHT}] \
                 /Resources << /Font << /F1 3 0 R /F2 4 0 R >> >> /Contents {content_id} 0 R >>"
            ));
            let stream = page_stream(page_lines, options.watermark.as_deref());
            objects.push(format!(
                "<< /Length {} >>\nstream\n{}endstream",
                stream.len(),
                stream
            ));
        }

        let mut output = String::from("%PDF-1.4\n");
        let mut offsets = Vec::with_capacity(objects.len());
        for (index, body) in objects.iter().enumerate() {
            offsets.push(output.len());
            let _ = write!(output, "{} 0 obj\n{}\nendobj\n", index + 1, body);
        }
        let xref_offset = output.len();
        let _ = writeln!(output, "xref\n0 {}", objects.len() + 1);
        let _ = writeln!(output, "0000000000 65535 f ");
        for offset in offsets {
            let _ = writeln!(output, "{offset:010} 00000 n ");
        }
        let _ = write!(
            output,
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_offset
        );

        Ok(output.into_bytes())
    }
}
