use serde_json::{json, Map, Value as JsonValue};

use super::{RenderOptions, Renderer};
use crate::error::{ReportError, ReportResult};
use crate::models::ExportFormat;
use crate::report::ReportDocument;
use crate::table::Value;

pub struct JsonRenderer;

fn row_object(columns: &[String], row: &[Value]) -> JsonValue {
    let object: Map<String, JsonValue> = columns
        .iter()
        .zip(row)
        .map(|(column, value)| (column.clone(), value.to_json()))
        .collect();
    JsonValue::Object(object)
}

impl Renderer for JsonRenderer {
    fn format(&self) -> ExportFormat {
        ExportFormat::Json
    }

    fn encode(&self, document: &ReportDocument, options: &RenderOptions) -> ReportResult<Vec<u8>> {
        let table = &document.table;
        let mut data: Vec<JsonValue> = table
            .rows
            .iter()
            .map(|row| row_object(&table.columns, row))
            .collect();
        let totals = options
            .include_totals
            .then(|| row_object(&table.columns, &table.totals_row()));

        let body = if document.is_report() || options.include_metadata {
            let mut envelope = Map::new();
            envelope.insert(
                "metadata".to_string(),
                json!({
                    "title": document.title,
                    "description": document.description,
                    "as_of": document.as_of.format("%Y-%m-%d").to_string(),
                    "period": document.period,
                    "total_rows": table.len(),
                    "columns": table.columns,
                }),
            );
            if document.is_report() {
                let summary: Map<String, JsonValue> = document
                    .summary
                    .iter()
                    .map(|item| (item.label.clone(), item.value.to_json()))
                    .collect();
                envelope.insert("summary".to_string(), JsonValue::Object(summary));
            }
            envelope.insert("data".to_string(), JsonValue::Array(data));
            if let Some(totals) = totals {
                envelope.insert("totals".to_string(), totals);
            }
            JsonValue::Object(envelope)
        } else {
            data.extend(totals);
            JsonValue::Array(data)
        };

        serde_json::to_vec_pretty(&body).map_err(|err| ReportError::Render(format!("json: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::test_support::*;

    fn encode(document: &ReportDocument, options: &RenderOptions) -> JsonValue {
        serde_json::from_slice(&JsonRenderer.encode(document, options).unwrap()).unwrap()
    }

    #[test]
    fn metadata_envelope_wraps_rows() {
        let body = encode(&export_document(), &RenderOptions::default());
        assert_eq!(body["metadata"]["total_rows"], 2);
        assert_eq!(body["metadata"]["title"], "Bookings Export");
        assert_eq!(body["metadata"]["as_of"], "2024-01-31");
        assert_eq!(body["data"][0]["school_name"], "Oak Elementary");
        assert_eq!(body["data"][1]["total_cost"], 650.5);
        assert!(body.get("summary").is_none());
    }

    #[test]
    fn bare_array_without_metadata() {
        let options = RenderOptions {
            include_metadata: false,
            include_totals: true,
            ..RenderOptions::default()
        };
        let body = encode(&export_document(), &options);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["id"], "Total");
        assert_eq!(rows[2]["student_count"], 50);
    }

    #[test]
    fn reports_carry_their_summary() {
        let options = RenderOptions {
            include_metadata: false,
            ..RenderOptions::default()
        };
        let body = encode(&report_document(), &options);
        assert_eq!(body["summary"]["Total Bookings"], 2);
        assert_eq!(body["summary"]["Completion Rate"], "50.0%");
    }
}
