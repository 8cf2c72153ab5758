//! CSV normalization
//!
//! Controller reports come in two layouts:
//!
//! - headed files, `;` or `,` separated, with named columns
//!   (`date;time;label;group;flag;...`)
//! - legacy headerless files whose first line is a title and whose columns
//!   are positional: date, time, label, form1, form2, then value slots
//!
//! Both are reduced to [`NormalizedRow`]s. A malformed row is skipped and
//! counted; it never fails the file.

use csv::{ByteRecord, ReaderBuilder, Trim};
use tracing::{debug, warn};

use super::models::{
    format_iso, parse_iso, parse_report_datetime, NormalizedFile, NormalizedRow, MAX_SLOTS,
};
use crate::error::PartialParseError;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A first line mentioning any of these is a header
const HEADER_KEYWORDS: &[&str] = &["date", "time", "label", "group", "flag"];

/// Layout facts read from the first line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub delimiter: u8,
    pub has_header: bool,
}

impl Layout {
    pub fn detect(content: &[u8]) -> Self {
        let first_line = content.split(|b| *b == b'\n').next().unwrap_or_default();
        let first_line = String::from_utf8_lossy(first_line);

        let delimiter = if first_line.contains(';') && !first_line.contains(',') {
            b';'
        } else {
            b','
        };

        let lower = first_line.to_lowercase();
        Self {
            delimiter,
            has_header: HEADER_KEYWORDS.iter().any(|k| lower.contains(k)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Datetime,
    Date,
    Time,
    Label,
    Group,
    Flag,
    Form1,
    Form2,
    Slot,
}

impl Column {
    fn from_header(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "datetime" => Column::Datetime,
            "date" | "data" | "dia" => Column::Date,
            "time" | "hora" => Column::Time,
            "label" | "nome" | "name" => Column::Label,
            "group" => Column::Group,
            "flag" => Column::Flag,
            "form1" => Column::Form1,
            "form2" => Column::Form2,
            _ => Column::Slot,
        }
    }
}

/// Normalize one downloaded report
pub fn normalize(source: &str, content: &[u8]) -> NormalizedFile {
    let content = content.strip_prefix(UTF8_BOM).unwrap_or(content);
    let layout = Layout::detect(content);
    debug!(
        file = %source,
        delimiter = %char::from(layout.delimiter),
        has_header = layout.has_header,
        "Detected CSV layout"
    );

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .delimiter(layout.delimiter)
        .from_reader(content);

    let mut records = reader.byte_records();
    let mut columns: Option<Vec<Column>> = None;
    let mut rows = Vec::new();
    let mut skipped = 0;

    // The first line is either the header or a title row; both are consumed
    match records.next() {
        None => {
            return NormalizedFile {
                source: source.to_string(),
                rows,
                skipped,
            }
        },
        Some(Ok(first)) if layout.has_header => {
            columns = Some(first.iter().map(|f| Column::from_header(&lossy(f))).collect());
        },
        Some(Ok(_)) => {},
        Some(Err(e)) => {
            warn!(file = %source, error = %e, "Unreadable first line");
        },
    }

    for (index, record) in records.enumerate() {
        let line = index as u64 + 2;
        let parsed = match record {
            Ok(record) => match &columns {
                Some(columns) => headed_row(line, columns, &record),
                None => positional_row(line, &record),
            },
            Err(err) => Err(PartialParseError::Csv { line, source: err }),
        };

        match parsed {
            Ok(row) => rows.push(row),
            Err(e) => {
                debug!(file = %source, error = %e, "Skipping malformed row");
                skipped += 1;
            },
        }
    }

    if skipped > 0 {
        warn!(file = %source, skipped, rows = rows.len(), "Skipped malformed rows");
    }

    NormalizedFile {
        source: source.to_string(),
        rows,
        skipped,
    }
}

fn positional_row(line: u64, record: &ByteRecord) -> Result<NormalizedRow, PartialParseError> {
    ensure_content(line, record)?;
    if record.len() < 2 {
        return Err(PartialParseError::TooFewFields {
            line,
            expected: 2,
            found: record.len(),
        });
    }

    let field = |i: usize| record.get(i).map(lossy);
    let date = field(0).and_then(non_empty);
    let time = field(1).and_then(non_empty);

    Ok(NormalizedRow {
        datetime: combine(date.as_deref(), time.as_deref()),
        label: field(2).and_then(non_empty),
        form1: field(3).as_deref().and_then(parse_number),
        form2: field(4).as_deref().and_then(parse_number),
        values: record
            .iter()
            .skip(5)
            .take(MAX_SLOTS)
            .map(|f| parse_number(&lossy(f)))
            .collect(),
        date,
        time,
    })
}

fn headed_row(
    line: u64,
    columns: &[Column],
    record: &ByteRecord,
) -> Result<NormalizedRow, PartialParseError> {
    ensure_content(line, record)?;

    let mut row = NormalizedRow::default();
    let mut raw_datetime = None;
    let mut group = None;
    let mut flag = None;

    for (column, value) in columns.iter().zip(record.iter()) {
        let value = lossy(value);
        match column {
            Column::Datetime => raw_datetime = non_empty(value),
            Column::Date => row.date = non_empty(value),
            Column::Time => row.time = non_empty(value),
            Column::Label => row.label = non_empty(value),
            Column::Group => group = parse_number(&value),
            Column::Flag => flag = parse_number(&value),
            Column::Form1 => row.form1 = parse_number(&value),
            Column::Form2 => row.form2 = parse_number(&value),
            Column::Slot => {
                if row.values.len() < MAX_SLOTS {
                    row.values.push(parse_number(&value));
                }
            },
        }
    }

    if raw_datetime.is_none() && row.date.is_none() && row.time.is_none() {
        let needed = columns
            .iter()
            .position(|c| matches!(c, Column::Datetime | Column::Date | Column::Time))
            .map_or(1, |i| i + 1);
        return Err(PartialParseError::TooFewFields {
            line,
            expected: needed,
            found: record.len(),
        });
    }

    row.form1 = row.form1.or(group);
    row.form2 = row.form2.or(flag);
    row.datetime = match raw_datetime {
        Some(raw) => parse_iso(&raw).map(format_iso).or_else(|| {
            let mut parts = raw.split_whitespace();
            combine(parts.next(), parts.next())
        }),
        None => combine(row.date.as_deref(), row.time.as_deref()),
    };

    Ok(row)
}

fn ensure_content(line: u64, record: &ByteRecord) -> Result<(), PartialParseError> {
    if record.iter().all(|f| f.iter().all(u8::is_ascii_whitespace)) {
        return Err(PartialParseError::Empty { line });
    }
    Ok(())
}

fn combine(date: Option<&str>, time: Option<&str>) -> Option<String> {
    parse_report_datetime(date?, time?).map(format_iso)
}

fn lossy(field: &[u8]) -> String {
    String::from_utf8_lossy(field).trim().to_string()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parse a numeric cell, accepting a decimal comma
pub fn parse_number(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = raw.parse::<f64>().ok().or_else(|| {
        if raw.contains(',') && !raw.contains('.') {
            raw.replace(',', ".").parse::<f64>().ok()
        } else {
            None
        }
    })?;
    parsed.is_finite().then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_semicolon_header() {
        let layout = Layout::detect(b"date;time;label;group;flag;v1\n26/08/25;17:40:00;A;1;0;5\n");
        assert_eq!(layout.delimiter, b';');
        assert!(layout.has_header);
    }

    #[test]
    fn test_detect_headerless_comma() {
        let layout = Layout::detect(b"Relatorio de producao\n26/08/25,17:40:00,A,1,2,3\n");
        assert_eq!(layout.delimiter, b',');
        assert!(!layout.has_header);

        // a comma anywhere on the first line keeps the comma delimiter
        let mixed = Layout::detect(b"date;time,label\n");
        assert_eq!(mixed.delimiter, b',');
    }

    #[test]
    fn test_semicolon_header_rows() {
        let content = b"Date;Time;Label;Group;Flag;P1;P2\n\
            26/08/25;17:40:00;Linha A;3;1;10;20\n\
            26/08/25;17:41:00;Linha B;;;11,5;x\n";
        let file = normalize("Relatorio_2025_08.csv", content);

        assert_eq!(file.rows.len(), 2);
        assert_eq!(file.skipped, 0);

        let first = &file.rows[0];
        assert_eq!(first.datetime.as_deref(), Some("2025-08-26T17:40:00"));
        assert_eq!(first.label.as_deref(), Some("Linha A"));
        assert_eq!(first.form1, Some(3.0));
        assert_eq!(first.form2, Some(1.0));
        assert_eq!(first.values, vec![Some(10.0), Some(20.0)]);

        let second = &file.rows[1];
        assert_eq!(second.form1, None);
        assert_eq!(second.values, vec![Some(11.5), None]);
    }

    #[test]
    fn test_explicit_form_columns_win_over_group_flag() {
        let content = b"date,time,group,flag,form1,form2\n01/09/2025,08:00,1,2,7,8\n";
        let file = normalize("x.csv", content);
        assert_eq!(file.rows[0].form1, Some(7.0));
        assert_eq!(file.rows[0].form2, Some(8.0));
        assert_eq!(file.rows[0].datetime.as_deref(), Some("2025-09-01T08:00:00"));
    }

    #[test]
    fn test_headerless_positional_columns() {
        let content = b"RELATORIO DE PRODUCAO\n\
            26/08/25,17:40:00,Linha A,1,2,3,4\n\
            26/08/25,17:41:00,,,,9\n";
        let file = normalize("legacy.csv", content);

        assert_eq!(file.rows.len(), 2);
        let first = &file.rows[0];
        assert_eq!(first.date.as_deref(), Some("26/08/25"));
        assert_eq!(first.time.as_deref(), Some("17:40:00"));
        assert_eq!(first.form1, Some(1.0));
        assert_eq!(first.form2, Some(2.0));
        assert_eq!(first.values, vec![Some(3.0), Some(4.0)]);
        assert_eq!(file.rows[1].label, None);
        assert_eq!(file.rows[1].values, vec![Some(9.0)]);
    }

    #[test]
    fn test_slots_beyond_forty_are_dropped() {
        let values: Vec<String> = (1..=45).map(|v| v.to_string()).collect();
        let content = format!("title\n26/08/25,17:40:00,L,1,2,{}\n", values.join(","));
        let file = normalize("wide.csv", content.as_bytes());
        assert_eq!(file.rows[0].values.len(), MAX_SLOTS);
        assert_eq!(file.rows[0].values[39], Some(40.0));
    }

    #[test]
    fn test_malformed_rows_are_skipped_and_counted() {
        let content = b"title\n\
            26/08/25,17:40:00,A,1,2,3\n\
            orphan\n\
            ,,,\n\
            26/08/25,17:42:00,B,1,2,3\n";
        let file = normalize("gaps.csv", content);
        assert_eq!(file.rows.len(), 2);
        assert_eq!(file.skipped, 2);
    }

    #[test]
    fn test_unparsable_date_keeps_raw_fields() {
        let content = b"title\nontem,cedo,A,1,2\n";
        let file = normalize("odd.csv", content);
        let row = &file.rows[0];
        assert_eq!(row.datetime, None);
        assert_eq!(row.date.as_deref(), Some("ontem"));
        assert_eq!(row.time.as_deref(), Some("cedo"));
    }

    #[test]
    fn test_bom_and_empty_input() {
        let content = b"\xEF\xBB\xBFdate;time;label\n26/08/25;17:40;A\n";
        let file = normalize("bom.csv", content);
        assert_eq!(file.rows.len(), 1);
        assert_eq!(file.rows[0].datetime.as_deref(), Some("2025-08-26T17:40:00"));

        assert!(normalize("empty.csv", b"").rows.is_empty());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 12 "), Some(12.0));
        assert_eq!(parse_number("1,25"), Some(1.25));
        assert_eq!(parse_number("NaN"), None);
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number(""), None);
    }
}
