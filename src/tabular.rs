//! Tabular (TSV/CSV) and plain numeric-matrix conversion.
//!
//! Tables become column-oriented objects, one array per header field:
//!
//! ```text
//! participant_id  age          {"participant_id": ["sub-01", "sub-02"],
//! sub-01          21     ──▶    "age": [21, null]}
//! sub-02          n/a
//! ```

use serde_json::{Map, Number, Value};

use crate::error::{FoldError, Result};

/// Cell values meaning "missing".
const NULL_TOKENS: &[&str] = &["", "n/a", "N/A", "NaN"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Tab,
    Comma,
}

impl Delimiter {
    pub fn for_extension(chain: &str) -> Self {
        if chain == "csv" {
            Delimiter::Comma
        } else {
            Delimiter::Tab
        }
    }
}

/// Parse a delimited table into a column-oriented JSON object.
///
/// Short rows are padded with `null`; rows longer than the header are
/// rejected rather than silently truncated.
pub fn parse_table(text: &str, delimiter: Delimiter, path: &str) -> Result<Value> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = match lines.next() {
        Some(h) => split_row(h, delimiter),
        None => return Ok(Value::Array(Vec::new())),
    };
    let names = unique_names(&header);
    let mut columns: Vec<Vec<Value>> = vec![Vec::new(); names.len()];

    for (row_idx, line) in lines.enumerate() {
        let cells = split_row(line, delimiter);
        if cells.len() > names.len() {
            return Err(FoldError::Malformed {
                format: "table",
                path: path.to_string(),
                reason: format!(
                    "row {} has {} cells but the header has {}",
                    row_idx + 2,
                    cells.len(),
                    names.len()
                ),
            });
        }
        for (col, column) in columns.iter_mut().enumerate() {
            let cell = cells.get(col).map(String::as_str).unwrap_or("");
            column.push(cell_value(cell));
        }
    }

    let mut obj = Map::new();
    for (name, column) in names.into_iter().zip(columns) {
        obj.insert(name, Value::Array(column));
    }
    Ok(Value::Object(obj))
}

fn split_row(line: &str, delimiter: Delimiter) -> Vec<String> {
    let line = line.trim_end_matches('\r');
    match delimiter {
        Delimiter::Tab => line.split('\t').map(|s| s.trim().to_string()).collect(),
        Delimiter::Comma => split_csv(line),
    }
}

/// RFC 4180 style split of one line: quoted fields, `""` escapes.
fn split_csv(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.trim().is_empty() => {
                field.clear();
                in_quotes = true;
            }
            (',', false) => out.push(std::mem::take(&mut field).trim().to_string()),
            _ => field.push(c),
        }
    }
    out.push(field.trim().to_string());
    out
}

fn unique_names(header: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::with_capacity(header.len());
    for (idx, raw) in header.iter().enumerate() {
        let base = if raw.is_empty() {
            format!("column_{}", idx + 1)
        } else {
            raw.clone()
        };
        let mut name = base.clone();
        let mut n = 1;
        while seen.contains(&name) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        seen.push(name);
    }
    seen
}

/// Typed cell value: integer, finite float, `null` for missing, else string.
pub fn cell_value(cell: &str) -> Value {
    if NULL_TOKENS.contains(&cell) {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = cell.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(cell.to_string())
}

/// Whitespace-separated numeric rows (`.bval`, `.bvec`).
///
/// A single row becomes a flat array, several rows an array of arrays.
pub fn parse_numeric_matrix(text: &str, path: &str) -> Result<Value> {
    let mut rows: Vec<Value> = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut row = Vec::new();
        for token in line.split_whitespace() {
            let f: f64 = token.parse().map_err(|_| FoldError::Malformed {
                format: "numeric",
                path: path.to_string(),
                reason: format!("line {}: '{}' is not a number", idx + 1, token),
            })?;
            row.push(cell_value_f64(f, token));
        }
        rows.push(Value::Array(row));
    }
    if rows.len() == 1 {
        return Ok(rows.pop().unwrap_or(Value::Null));
    }
    Ok(Value::Array(rows))
}

fn cell_value_f64(f: f64, token: &str) -> Value {
    if let Ok(i) = token.parse::<i64>() {
        return Value::from(i);
    }
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tsv_to_columns() {
        let v = parse_table(
            "participant_id\tage\tsex\nsub-01\t21\tF\nsub-02\tn/a\tM\n",
            Delimiter::Tab,
            "participants.tsv",
        )
        .unwrap();
        assert_eq!(
            v,
            json!({"participant_id": ["sub-01", "sub-02"], "age": [21, null], "sex": ["F", "M"]})
        );
    }

    #[test]
    fn csv_with_quotes_and_short_rows() {
        let v = parse_table(
            "name,score,note\n\"Doe, J\",1.5,\"said \"\"hi\"\"\"\nX,2\n",
            Delimiter::Comma,
            "t.csv",
        )
        .unwrap();
        assert_eq!(
            v,
            json!({"name": ["Doe, J", "X"], "score": [1.5, 2], "note": ["said \"hi\"", null]})
        );
    }

    #[test]
    fn long_rows_are_malformed() {
        let err = parse_table("a\tb\n1\t2\t3\n", Delimiter::Tab, "x.tsv").unwrap_err();
        assert!(matches!(err, FoldError::Malformed { .. }));
    }

    #[test]
    fn duplicate_and_blank_headers_get_unique_names() {
        let v = parse_table("a\ta\t\n1\t2\t3\n", Delimiter::Tab, "x.tsv").unwrap();
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["a", "a_1", "column_3"]);
    }

    #[test]
    fn numeric_matrix_shapes() {
        assert_eq!(
            parse_numeric_matrix("0 1000 1000\n", "dwi.bval").unwrap(),
            json!([0, 1000, 1000])
        );
        assert_eq!(
            parse_numeric_matrix("0 1\n0 0.5\n1 -0.5\n", "dwi.bvec").unwrap(),
            json!([[0, 1], [0, 0.5], [1, -0.5]])
        );
        assert!(parse_numeric_matrix("0 x\n", "dwi.bval").is_err());
    }
}
