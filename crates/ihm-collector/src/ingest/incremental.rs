//! Watermark-bounded extraction of new rows
//!
//! Reports are append-only and time-ordered, so the rows not yet persisted
//! form a suffix of the file. The suffix is found by walking backwards from
//! the last row until one is at or before the watermark.

use super::models::{NormalizedRow, Watermark};

/// Rows strictly after `watermark`, in ascending file order
///
/// Rows or watermarks whose timestamp cannot be resolved count as new.
pub fn extract_new_rows(
    rows: &[NormalizedRow],
    watermark: Option<&Watermark>,
) -> Vec<NormalizedRow> {
    let Some(bound) = watermark.and_then(Watermark::timestamp) else {
        return rows.to_vec();
    };

    let mut suffix: Vec<NormalizedRow> = rows
        .iter()
        .rev()
        .take_while(|row| row.timestamp().map_or(true, |ts| ts > bound))
        .cloned()
        .collect();
    suffix.reverse();
    suffix
}
