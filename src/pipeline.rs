//! CSV prediction pipeline
//!
//! Decodes uploaded bytes, validates the feature schema, coerces features
//! to numbers, runs the model, and merges predictions back into the
//! original table. Row count and row order are preserved end to end.

use std::borrow::Cow;

use encoding_rs::SHIFT_JIS;
use thiserror::Error;

use crate::model::ModelHandle;
use crate::schema::{self, BOX_ID_COLUMN, BOX_ID_PRED_COLUMN, FEATURE_COLUMNS};
use crate::table::Table;

/// Errors surfaced by the prediction pipeline.
///
/// `CsvDecoding` and `MissingColumns` are user-visible validation failures;
/// everything else is reported to callers as an opaque server error.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Input bytes decodable under neither utf-8 nor cp932.
    #[error("CSV decoding failed for encodings utf-8 and cp932")]
    CsvDecoding,

    /// Required feature columns absent from the upload.
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    /// Decoded fine but is not well-formed CSV.
    #[error("CSV parse error: {0}")]
    Csv(#[from] csv::Error),

    /// Model load or inference failure.
    #[error(transparent)]
    Model(#[from] anyhow::Error),
}

/// Decode raw upload bytes: utf-8 first, then the Windows Japanese code
/// page (cp932, the WHATWG Shift_JIS decoder).
///
/// Only decoding failures trigger the fallback. A successful decode that is
/// not valid CSV is not retried under the second encoding.
pub fn decode_with_fallbacks(bytes: &[u8]) -> Result<Cow<'_, str>, PipelineError> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(Cow::Borrowed(text));
    }
    SHIFT_JIS
        .decode_without_bom_handling_and_without_replacement(bytes)
        .ok_or(PipelineError::CsvDecoding)
}

/// Coerce one cell to a feature value. Unparseable, missing, or NaN cells
/// become zero; malformed data never aborts a request.
fn coerce_numeric(cell: &str) -> f32 {
    match cell.trim().parse::<f32>() {
        Ok(v) if !v.is_nan() => v,
        _ => 0.0,
    }
}

/// Row-major feature matrix in canonical column order.
///
/// Callers must have validated the schema; absent columns would panic here.
fn prepare_features(table: &Table) -> Vec<Vec<f32>> {
    let indices: Vec<usize> = FEATURE_COLUMNS
        .iter()
        .map(|col| table.column_index(col).expect("schema validated"))
        .collect();

    table
        .rows()
        .iter()
        .map(|row| indices.iter().map(|&i| coerce_numeric(&row[i])).collect())
        .collect()
}

/// Render a predicted label for CSV output. Box ids are integral class
/// labels, so integral values print without a decimal point.
fn format_label(value: f32) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e9 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Run the full pipeline over uploaded CSV bytes.
///
/// On success the returned table is the uploaded one (all original columns,
/// recognized or not) with `box_id_pred` appended, and with empty or
/// whitespace-only `box_id` cells backfilled from the prediction. If the
/// upload has no `box_id` column at all, no backfill occurs.
pub async fn predict_from_bytes(
    model: &ModelHandle,
    bytes: &[u8],
) -> Result<Table, PipelineError> {
    let text = decode_with_fallbacks(bytes)?;
    let mut table = Table::parse(&text)?;

    let missing = schema::missing_columns(table.headers());
    if !missing.is_empty() {
        return Err(PipelineError::MissingColumns(missing));
    }

    let features = prepare_features(&table);
    let predictor = model.get().await?;
    let predictions = predictor.predict(&features)?;

    let labels: Vec<String> = predictions.iter().map(|&p| format_label(p)).collect();

    if let Some(box_id_col) = table.column_index(BOX_ID_COLUMN) {
        for (row, label) in (0..table.row_count()).zip(labels.iter()) {
            if table.cell(row, box_id_col).trim().is_empty() {
                table.set_cell(row, box_id_col, label.clone());
            }
        }
    }

    table.push_column(BOX_ID_PRED_COLUMN, labels);
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Predictor, SharedPredictor};
    use anyhow::Result;
    use std::sync::Arc;

    struct ConstPredictor(f32);

    impl Predictor for ConstPredictor {
        fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<f32>> {
            Ok(vec![self.0; features.len()])
        }
    }

    /// Predictor that echoes the first feature (total_items) back as the
    /// label, so tests can observe the coerced matrix.
    struct EchoFirstFeature;

    impl Predictor for EchoFirstFeature {
        fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<f32>> {
            Ok(features.iter().map(|row| row[0]).collect())
        }
    }

    fn stub_handle(predictor: impl Predictor + 'static) -> ModelHandle {
        let shared: SharedPredictor = Arc::new(predictor);
        ModelHandle::from_loader(move || Ok(shared.clone()))
    }

    /// CSV with all 24 feature columns; each row lists its `total_items`
    /// value followed by zeros, with optional extra columns appended.
    fn full_csv(extra_headers: &[&str], rows: &[(&str, &[&str])]) -> String {
        fn csv_field(s: &str) -> String {
            if s.contains([',', '"', '\n', '\r']) {
                format!("\"{}\"", s.replace('"', "\"\""))
            } else {
                s.to_string()
            }
        }
        let mut header: Vec<String> = crate::schema::FEATURE_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .collect();
        header.extend(extra_headers.iter().map(|h| h.to_string()));
        let mut out = header
            .iter()
            .map(|h| csv_field(h))
            .collect::<Vec<_>>()
            .join(",");
        out.push('\n');
        for (total_items, extras) in rows {
            let mut cells = vec![total_items.to_string()];
            cells.extend(std::iter::repeat("0".to_string()).take(23));
            cells.extend(extras.iter().map(|e| e.to_string()));
            out.push_str(
                &cells
                    .iter()
                    .map(|c| csv_field(c))
                    .collect::<Vec<_>>()
                    .join(","),
            );
            out.push('\n');
        }
        out
    }

    #[test]
    fn test_decode_utf8() {
        let text = decode_with_fallbacks("a,b\n1,2\n".as_bytes()).unwrap();
        assert_eq!(text, "a,b\n1,2\n");
    }

    #[test]
    fn test_decode_falls_back_to_cp932() {
        // "箱" in cp932 is 0x94 0xa0, which is not valid utf-8
        let bytes = [b'i', b'd', b'\n', 0x94, 0xa0, b'\n'];
        let text = decode_with_fallbacks(&bytes).unwrap();
        assert_eq!(text, "id\n箱\n");
    }

    #[test]
    fn test_decode_fails_under_both_encodings() {
        // 0xff is not a valid byte in utf-8 or in the cp932 decoder
        let bytes = [0xff, 0xfe, 0x80];
        assert!(matches!(
            decode_with_fallbacks(&bytes),
            Err(PipelineError::CsvDecoding)
        ));
    }

    #[test]
    fn test_coerce_numeric_permissive() {
        assert_eq!(coerce_numeric("3"), 3.0);
        assert_eq!(coerce_numeric(" 2.5 "), 2.5);
        assert_eq!(coerce_numeric(""), 0.0);
        assert_eq!(coerce_numeric("abc"), 0.0);
        assert_eq!(coerce_numeric("NaN"), 0.0);
    }

    #[test]
    fn test_format_label() {
        assert_eq!(format_label(999.0), "999");
        assert_eq!(format_label(0.0), "0");
        assert_eq!(format_label(12.5), "12.5");
    }

    #[tokio::test]
    async fn test_missing_columns_listed_in_canonical_order() {
        let model = stub_handle(ConstPredictor(1.0));
        let err = predict_from_bytes(&model, b"total_items\n1\n")
            .await
            .unwrap_err();
        match err {
            PipelineError::MissingColumns(cols) => {
                assert_eq!(cols.len(), 23);
                assert_eq!(cols[0], "bonsai");
                assert_eq!(cols.last().unwrap(), "sum_item_volume_cm3");
            }
            other => panic!("expected MissingColumns, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_prediction_appends_exactly_one_column() {
        let model = stub_handle(ConstPredictor(999.0));
        let csv = full_csv(&[], &[("1", &[]), ("2", &[])]);
        let table = predict_from_bytes(&model, csv.as_bytes()).await.unwrap();

        assert_eq!(table.row_count(), 2);
        assert_eq!(table.headers().len(), 25);
        assert_eq!(table.headers().last().unwrap(), BOX_ID_PRED_COLUMN);
        let pred_col = table.column_index(BOX_ID_PRED_COLUMN).unwrap();
        assert_eq!(table.cell(0, pred_col), "999");
        assert_eq!(table.cell(1, pred_col), "999");
    }

    #[tokio::test]
    async fn test_non_numeric_cells_feed_zero_to_model() {
        let model = stub_handle(EchoFirstFeature);
        let csv = full_csv(&[], &[("garbage", &[]), ("4", &[])]);
        let table = predict_from_bytes(&model, csv.as_bytes()).await.unwrap();

        let pred_col = table.column_index(BOX_ID_PRED_COLUMN).unwrap();
        assert_eq!(table.cell(0, pred_col), "0");
        assert_eq!(table.cell(1, pred_col), "4");
    }

    #[tokio::test]
    async fn test_backfill_only_empty_box_ids() {
        let model = stub_handle(ConstPredictor(7.0));
        let csv = full_csv(
            &["box_id"],
            &[("1", &[""]), ("2", &["  "]), ("3", &["120"])],
        );
        let table = predict_from_bytes(&model, csv.as_bytes()).await.unwrap();

        let box_id = table.column_index(BOX_ID_COLUMN).unwrap();
        assert_eq!(table.cell(0, box_id), "7");
        assert_eq!(table.cell(1, box_id), "7");
        // Pre-filled identifiers are left untouched
        assert_eq!(table.cell(2, box_id), "120");
    }

    #[tokio::test]
    async fn test_no_box_id_column_means_no_backfill() {
        // Intentional policy: absent identifier column gets only the
        // prediction column, nothing else is synthesized.
        let model = stub_handle(ConstPredictor(7.0));
        let csv = full_csv(&[], &[("1", &[])]);
        let table = predict_from_bytes(&model, csv.as_bytes()).await.unwrap();

        assert_eq!(table.column_index(BOX_ID_COLUMN), None);
        assert_eq!(table.headers().len(), 25);
    }

    #[tokio::test]
    async fn test_extra_columns_survive_to_output() {
        let model = stub_handle(ConstPredictor(1.0));
        let csv = full_csv(&["memo"], &[("1", &["keep me"])]);
        let table = predict_from_bytes(&model, csv.as_bytes()).await.unwrap();

        let memo = table.column_index("memo").unwrap();
        assert_eq!(table.cell(0, memo), "keep me");
    }

    #[tokio::test]
    async fn test_cp932_upload_matches_utf8_result() {
        let model = stub_handle(ConstPredictor(5.0));
        let utf8 = full_csv(&["memo"], &[("1", &["盆栽"])]);
        let (cp932, _, _) = encoding_rs::SHIFT_JIS.encode(&utf8);

        let from_utf8 = predict_from_bytes(&model, utf8.as_bytes()).await.unwrap();
        let from_cp932 = predict_from_bytes(&model, &cp932).await.unwrap();
        assert_eq!(from_utf8, from_cp932);
    }

    #[tokio::test]
    async fn test_output_round_trips_through_csv() {
        let model = stub_handle(ConstPredictor(3.0));
        let csv = full_csv(&["memo"], &[("1", &["a,b"]), ("2", &[""])]);
        let table = predict_from_bytes(&model, csv.as_bytes()).await.unwrap();

        let bytes = table.to_csv_bytes().unwrap();
        let reparsed = Table::parse(std::str::from_utf8(&bytes).unwrap()).unwrap();
        assert_eq!(table, reparsed);
    }
}
