use ::csv::{Writer, WriterBuilder};

use super::{body_rows, RenderOptions, Renderer};
use crate::error::{ReportError, ReportResult};
use crate::models::ExportFormat;
use crate::report::ReportDocument;
use crate::table::Value;

pub struct CsvRenderer;

fn csv_error(err: impl std::fmt::Display) -> ReportError {
    ReportError::Render(format!("csv: {err}"))
}

fn section(out: &mut Vec<u8>) -> Writer<&mut Vec<u8>> {
    WriterBuilder::new().flexible(true).from_writer(out)
}

impl Renderer for CsvRenderer {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    fn encode(&self, document: &ReportDocument, options: &RenderOptions) -> ReportResult<Vec<u8>> {
        let mut out = Vec::new();

        if document.is_report() {
            let as_of = document.as_of.format("%Y-%m-%d").to_string();
            let mut writer = section(&mut out);
            writer
                .write_record(["Report", document.title.as_str()])
                .map_err(csv_error)?;
            writer
                .write_record(["Data As Of", as_of.as_str()])
                .map_err(csv_error)?;
            writer
                .write_record(["Period", document.period.as_str()])
                .map_err(csv_error)?;
            writer.flush().map_err(csv_error)?;
            drop(writer);
            out.push(b'\n');

            let mut writer = section(&mut out);
            writer.write_record(["SUMMARY"]).map_err(csv_error)?;
            for item in &document.summary {
                writer
                    .write_record([item.label.clone(), item.value.display()])
                    .map_err(csv_error)?;
            }
            writer.flush().map_err(csv_error)?;
            drop(writer);
            out.push(b'\n');
        }

        let mut writer = section(&mut out);
        if options.include_headers && !document.table.columns.is_empty() {
            writer
                .write_record(&document.table.columns)
                .map_err(csv_error)?;
        }
        for row in body_rows(document, options) {
            writer
                .write_record(row.iter().map(Value::display))
                .map_err(csv_error)?;
        }
        writer.flush().map_err(csv_error)?;
        drop(writer);
        Ok(out)
    }
}
