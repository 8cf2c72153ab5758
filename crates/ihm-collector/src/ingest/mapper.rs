//! Maps normalized rows onto the `relatorio` column layout

use super::models::{parse_iso, NormalizedRow, PersistedRow, MAX_LABEL_CHARS, MAX_SLOTS};

/// Map one row, or `None` when it carries nothing worth storing
pub fn map_row(row: &NormalizedRow) -> Option<PersistedRow> {
    let (dia, hora) = match row.datetime.as_deref().and_then(parse_iso) {
        Some(dt) => (
            Some(dt.format("%d/%m/%y").to_string()),
            Some(dt.format("%H:%M:%S").to_string()),
        ),
        None => (row.date.clone(), row.time.clone()),
    };

    let explicit_forms = row.form1.is_some() || row.form2.is_some();
    let (form1, form2, slots) = if explicit_forms {
        (row.form1, row.form2, &row.values[..])
    } else {
        let slot = |i: usize| row.values.get(i).copied().flatten();
        (slot(0), slot(1), row.values.get(2..).unwrap_or_default())
    };

    let mut prod = [None; MAX_SLOTS];
    for (target, value) in prod.iter_mut().zip(slots.iter().copied()) {
        *target = value.and_then(to_column_int);
    }

    let mapped = PersistedRow {
        dia,
        hora,
        nome: row.label.as_deref().map(truncate_label),
        form1: form1.and_then(to_column_int),
        form2: form2.and_then(to_column_int),
        prod,
    };

    let empty = mapped.nome.is_none()
        && mapped.form1.is_none()
        && mapped.form2.is_none()
        && mapped.prod.iter().all(Option::is_none);

    (!empty).then_some(mapped)
}

/// Map a batch, dropping empty rows
pub fn map_rows(rows: &[NormalizedRow]) -> Vec<PersistedRow> {
    rows.iter().filter_map(map_row).collect()
}

fn to_column_int(value: f64) -> Option<i32> {
    if !value.is_finite() {
        return None;
    }
    let rounded = value.round();
    if rounded < f64::from(i32::MIN) || rounded > f64::from(i32::MAX) {
        return None;
    }
    Some(rounded as i32)
}

fn truncate_label(label: &str) -> String {
    label.chars().take(MAX_LABEL_CHARS).collect()
}
