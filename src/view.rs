//! Human-readable rendering of JSON and BJData documents with truncation.
//!
//! Large arrays and objects collapse into a one-line preview of their first
//! four entries; long strings keep their head and tail.

use serde_json::Value;

use crate::bjdata::{self, BjdataError};

/// Entries shown in the preview of a collapsed container.
const PREVIEW_ITEMS: usize = 4;
/// Short numeric arrays are kept on one line up to this width.
const INLINE_WIDTH: usize = 80;
const INLINE_ITEMS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct ViewOptions {
    pub max_data: usize,
    pub max_str: usize,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            max_data: 100,
            max_str: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Json,
    Bjdata,
}

#[derive(Debug)]
pub struct LoadedDocument {
    pub value: Value,
    pub format: SourceFormat,
    /// Bytes left after the first top-level BJData value.
    pub trailing: usize,
}

/// Parse `data` as text JSON when it looks like JSON, else as BJData.
///
/// A buffer that looks like JSON but fails to parse is retried as BJData.
pub fn load_document(data: &[u8], big_endian: bool) -> Result<LoadedDocument, BjdataError> {
    if bjdata::detect_json(data) {
        if let Ok(value) = serde_json::from_slice::<Value>(data) {
            return Ok(LoadedDocument {
                value,
                format: SourceFormat::Json,
                trailing: 0,
            });
        }
    }
    let (value, trailing) = bjdata::decode_prefix(data, big_endian)?;
    Ok(LoadedDocument {
        value,
        format: SourceFormat::Bjdata,
        trailing,
    })
}

pub fn truncate_str(s: &str, max_str: usize) -> String {
    let len = s.chars().count();
    if len <= max_str {
        return s.to_string();
    }
    let half = max_str / 2;
    let head: String = s.chars().take(half).collect();
    let tail: String = s.chars().skip(len - half).collect();
    format!("{}...{} ({} chars)", head, tail, len)
}

pub fn render(value: &Value, opts: &ViewOptions) -> String {
    render_at(value, opts, 0)
}

fn render_at(value: &Value, opts: &ViewOptions, depth: usize) -> String {
    let pad = "  ".repeat(depth);
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("\"{}\"", truncate_str(s, opts.max_str)),
        Value::Array(items) if items.is_empty() => "[]".to_string(),
        Value::Array(items) => {
            if items.len() > opts.max_data {
                let preview: Vec<String> = items
                    .iter()
                    .take(PREVIEW_ITEMS)
                    .map(|v| render_at(v, opts, 0))
                    .collect();
                return format!("<array[{}]: [{}, ...]>", items.len(), preview.join(", "));
            }
            if items.len() <= INLINE_ITEMS && items.iter().all(Value::is_number) {
                let line = format!(
                    "[{}]",
                    items
                        .iter()
                        .map(|v| render_at(v, opts, 0))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                if line.len() < INLINE_WIDTH {
                    return line;
                }
            }
            let mut out = vec!["[".to_string()];
            for item in items {
                out.push(format!("{}  {},", pad, render_at(item, opts, depth + 1)));
            }
            out.push(format!("{}]", pad));
            out.join("\n")
        }
        Value::Object(map) if map.is_empty() => "{}".to_string(),
        Value::Object(map) => {
            if map.len() > opts.max_data {
                let preview: Vec<String> = map
                    .iter()
                    .take(PREVIEW_ITEMS)
                    .map(|(k, v)| format!("\"{}\": {}", k, render_at(v, opts, 0)))
                    .collect();
                return format!(
                    "<object[{} keys]: {{ {}, ... }}>",
                    map.len(),
                    preview.join(", ")
                );
            }
            let mut out = vec!["{".to_string()];
            for (k, v) in map {
                out.push(format!("{}  \"{}\": {},", pad, k, render_at(v, opts, depth + 1)));
            }
            out.push(format!("{}}}", pad));
            out.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn long_strings_keep_head_and_tail() {
        assert_eq!(truncate_str("abcdefghij", 4), "ab...ij (10 chars)");
        assert_eq!(truncate_str("short", 10), "short");
    }

    #[test]
    fn large_arrays_collapse_to_preview() {
        let v = json!((0..200).collect::<Vec<i32>>());
        assert_eq!(render(&v, &ViewOptions::default()), "<array[200]: [0, 1, 2, 3, ...]>");
    }

    #[test]
    fn small_numeric_arrays_stay_inline() {
        let v = json!({"dims": [2, 3, 4], "name": "t1"});
        assert_eq!(
            render(&v, &ViewOptions::default()),
            "{\n  \"dims\": [2, 3, 4],\n  \"name\": \"t1\",\n}"
        );
    }

    #[test]
    fn large_objects_collapse_to_preview() {
        let opts = ViewOptions {
            max_data: 2,
            max_str: 200,
        };
        let v = json!({"a": 1, "b": 2, "c": 3});
        assert_eq!(render(&v, &opts), "<object[3 keys]: { \"a\": 1, \"b\": 2, \"c\": 3, ... }>");
    }

    #[test]
    fn loads_json_and_bjdata() {
        let doc = load_document(b"{\"a\": [1, 2]}", false).unwrap();
        assert_eq!(doc.format, SourceFormat::Json);
        assert_eq!(doc.value, json!({"a": [1, 2]}));

        let doc = load_document(b"{U\x01aU\x07}", false).unwrap();
        assert_eq!(doc.format, SourceFormat::Bjdata);
        assert_eq!(doc.value, json!({"a": 7}));
        assert_eq!(doc.trailing, 0);
    }
}
