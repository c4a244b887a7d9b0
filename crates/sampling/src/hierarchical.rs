//! Hierarchical (JSON) analysis.
//!
//! Items are located at the configured root path and flattened into
//! dotted keys up to the sample depth. A truncated prefix is scanned item
//! by item so that only complete array elements are counted.

use indexmap::IndexMap;
use serde_json::Value;

use bulkload_core::job::{root_path_segments, ParsingConfig};
use bulkload_core::preview::{FieldAccumulator, PreviewReport, SAMPLE_ROW_LIMIT};

use crate::{Analysis, Unstructured};

type FlatItem = IndexMap<String, Option<String>>;

/// Analyze JSON text.
pub fn analyze(text: &str, config: &ParsingConfig, truncated: bool) -> Result<Analysis, Unstructured> {
    let segments = root_path_segments(&config.root_path);

    let (items, consumed) = if truncated {
        scan_prefix(text, &segments)?
    } else {
        (parse_full(text, &segments)?, text.len())
    };

    if items.is_empty() {
        return Err(Unstructured("No complete item found".to_string()));
    }

    let depth = config.sample_depth.max(1);
    let mut fields: IndexMap<String, FieldAccumulator> = IndexMap::new();
    let mut samples: Vec<FlatItem> = Vec::new();
    let mut seen: u64 = 0;

    for item in &items {
        let mut flat = FlatItem::new();
        flatten(item, "", depth, &mut flat);

        for key in flat.keys() {
            if !fields.contains_key(key) {
                let mut field = FieldAccumulator::new(key.clone());
                field.observe_missing(seen);
                fields.insert(key.clone(), field);
            }
        }
        for (key, field) in fields.iter_mut() {
            field.observe(flat.get(key).and_then(|v| v.as_deref()));
        }

        if samples.len() < SAMPLE_ROW_LIMIT {
            samples.push(flat);
        }
        seen += 1;
    }

    let sample_rows = samples
        .iter()
        .map(|flat| {
            fields
                .keys()
                .map(|key| flat.get(key).cloned().flatten().unwrap_or_default())
                .collect()
        })
        .collect();

    tracing::debug!(items = seen, keys = fields.len(), truncated, "Analyzed JSON text");

    Ok(Analysis {
        report: PreviewReport {
            total_records: seen,
            columns: fields.into_values().map(FieldAccumulator::finish).collect(),
            sample_rows,
            ..Default::default()
        },
        consumed,
    })
}

/// Parse a complete document. Falls back to newline-delimited JSON when
/// the text is not a single value.
fn parse_full(text: &str, segments: &[&str]) -> Result<Vec<Value>, Unstructured> {
    let document = match serde_json::from_str::<Value>(text) {
        Ok(document) => document,
        Err(err) => {
            let lines: Result<Vec<Value>, _> = serde_json::Deserializer::from_str(text)
                .into_iter::<Value>()
                .collect();
            return match lines {
                Ok(values) if values.len() > 1 && segments.is_empty() => Ok(values),
                _ => Err(Unstructured(format!("Invalid JSON: {err}"))),
            };
        }
    };

    let mut node = &document;
    for segment in segments {
        node = node
            .get(segment)
            .ok_or_else(|| Unstructured(format!("Root path segment '{segment}' not found")))?;
    }

    match node {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(_) => Ok(vec![node.clone()]),
        _ => Err(Unstructured(
            "Root path does not point at an array or object".to_string(),
        )),
    }
}

/// Extract complete items from a truncated prefix.
fn scan_prefix(text: &str, segments: &[&str]) -> Result<(Vec<Value>, usize), Unstructured> {
    let Some(start) = find_array_start(text, segments) else {
        if segments.is_empty() {
            return scan_lines(text);
        }
        return Err(Unstructured(format!(
            "Could not locate the array at '{}' in the sampled prefix",
            segments.join(".")
        )));
    };

    let bytes = text.as_bytes();
    let mut items = Vec::new();
    let mut pos = start;
    let mut consumed = start;

    loop {
        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b',') {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        if bytes[pos] == b']' {
            consumed = pos + 1;
            break;
        }
        let Some(end) = value_end(bytes, pos) else {
            break;
        };
        match serde_json::from_str::<Value>(text[pos..end].trim()) {
            Ok(item) => items.push(item),
            Err(_) => break,
        }
        consumed = end;
        pos = end;
    }

    Ok((items, consumed))
}

/// Newline-delimited JSON prefix: take values until the first one that
/// does not parse.
fn scan_lines(text: &str) -> Result<(Vec<Value>, usize), Unstructured> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    let mut items = Vec::new();
    let mut consumed = 0;
    while let Some(Ok(item)) = stream.next() {
        items.push(item);
        consumed = stream.byte_offset();
    }
    if items.is_empty() {
        return Err(Unstructured(
            "No top-level JSON structure found in the sampled prefix".to_string(),
        ));
    }
    Ok((items, consumed))
}

/// Byte offset just past the `[` that opens the item array.
fn find_array_start(text: &str, segments: &[&str]) -> Option<usize> {
    let bytes = text.as_bytes();
    let Some(last) = segments.last() else {
        let first = bytes.iter().position(|b| !b.is_ascii_whitespace())?;
        return (bytes[first] == b'[').then_some(first + 1);
    };

    let needle = format!("\"{last}\"");
    let mut from = 0;
    while let Some(found) = text[from..].find(&needle) {
        let mut pos = from + found + needle.len();
        from = pos;
        pos = skip_whitespace(bytes, pos);
        if bytes.get(pos) != Some(&b':') {
            continue;
        }
        pos = skip_whitespace(bytes, pos + 1);
        if bytes.get(pos) == Some(&b'[') {
            return Some(pos + 1);
        }
    }
    None
}

fn skip_whitespace(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

/// End of the JSON value starting at `start`, or `None` if the text ends
/// first. Containers end after their closing bracket; scalars end at the
/// next top-level `,` or `]`.
fn value_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
                if depth == 0 && i != start {
                    return Some(i + 1);
                }
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            b',' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

/// Flatten nested objects into dotted keys, `depth` levels deep. Deeper
/// values and arrays are kept as compact JSON text.
fn flatten(value: &Value, prefix: &str, depth: u8, out: &mut FlatItem) {
    let Value::Object(map) = value else {
        let key = if prefix.is_empty() { "value" } else { prefix };
        out.insert(key.to_string(), scalar_text(value));
        return;
    };

    for (key, child) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match child {
            Value::Object(_) if depth > 1 => flatten(child, &path, depth - 1, out),
            _ => {
                out.insert(path, scalar_text(child));
            }
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
