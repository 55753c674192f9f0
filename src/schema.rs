//! Canonical feature schema for the box-id model
//!
//! The model was trained on a fixed, ordered set of numeric columns.
//! Uploads must contain all of them (in any order, extras allowed); the
//! feature matrix handed to the model always follows this canonical order.

/// Ordered feature columns matching the trained model's input contract.
pub const FEATURE_COLUMNS: [&str; 24] = [
    "total_items",
    "bonsai",
    "other",
    "plastic_pots_trays",
    "single_flower_vase",
    "decorative_sand",
    "saucers_mats",
    "books",
    "suiban",
    "bonsai_seeds",
    "for_bonsai_classes",
    "bonsai_soil",
    "bonsai_tools",
    "bonsai_pots",
    "bonsai_decorations",
    "lucky_bag",
    "moss",
    "moss_bonsai",
    "chemicals_fertilizer",
    "wire",
    "decorative_stones",
    "accessories",
    "max_item_long_cm",
    "sum_item_volume_cm3",
];

/// Identifier column the uploader may pre-fill; backfilled from predictions
/// where empty.
pub const BOX_ID_COLUMN: &str = "box_id";

/// Prediction column appended to every result table.
pub const BOX_ID_PRED_COLUMN: &str = "box_id_pred";

/// Required feature columns absent from `headers`, in canonical order.
///
/// Extra, unrecognized columns are never an error; only absences count.
pub fn missing_columns(headers: &[String]) -> Vec<String> {
    FEATURE_COLUMNS
        .iter()
        .filter(|col| !headers.iter().any(|h| h == *col))
        .map(|col| col.to_string())
        .collect()
}
