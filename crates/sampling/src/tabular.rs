//! Delimited (CSV) analysis.

use bulkload_core::job::ParsingConfig;
use bulkload_core::preview::{FieldAccumulator, PreviewReport, SAMPLE_ROW_LIMIT};

use crate::{Analysis, Unstructured};

/// Analyze delimited text.
///
/// When `truncated` is set the text is a prefix of the file: everything
/// after the last line break is discarded as a partial record.
pub fn analyze(text: &str, config: &ParsingConfig, truncated: bool) -> Result<Analysis, Unstructured> {
    let body = if truncated {
        match text.rfind('\n') {
            Some(idx) => &text[..=idx],
            None => {
                return Err(Unstructured(
                    "No complete row found in the sampled prefix".to_string(),
                ))
            }
        }
    } else {
        text
    };

    if body.trim().is_empty() {
        return Err(Unstructured("File contains no rows".to_string()));
    }

    let delimiter = u8::try_from(config.delimiter).map_err(|_| {
        Unstructured(format!(
            "Delimiter {:?} is not a single-byte character",
            config.delimiter
        ))
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut fields: Vec<FieldAccumulator> = Vec::new();
    let mut header_pending = config.has_header;
    let mut rows: u64 = 0;
    let mut sample_rows = Vec::new();
    let mut warning = None;
    let mut consumed = body.len();

    let mut record = csv::StringRecord::new();
    loop {
        let start = reader.position().byte() as usize;
        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                if rows == 0 && fields.is_empty() {
                    return Err(Unstructured(format!("Could not parse delimited text: {err}")));
                }
                warning = Some(format!("Parsing stopped early: {err}"));
                consumed = start;
                break;
            }
        }

        if header_pending {
            header_pending = false;
            fields = record
                .iter()
                .enumerate()
                .map(|(i, name)| FieldAccumulator::new(column_name(name, i)))
                .collect();
            continue;
        }

        if config.skip_empty_rows && record.iter().all(|v| v.trim().is_empty()) {
            continue;
        }

        // Rows wider than the header introduce new columns that were
        // absent in every earlier row.
        while fields.len() < record.len() {
            let mut field = FieldAccumulator::new(column_name("", fields.len()));
            field.observe_missing(rows);
            fields.push(field);
        }

        for (i, field) in fields.iter_mut().enumerate() {
            field.observe(record.get(i));
        }

        if sample_rows.len() < SAMPLE_ROW_LIMIT {
            sample_rows.push(record.iter().map(str::to_string).collect());
        }
        rows += 1;
    }

    if fields.is_empty() {
        return Err(Unstructured("No columns found".to_string()));
    }

    tracing::debug!(rows, columns = fields.len(), truncated, "Analyzed delimited text");

    Ok(Analysis {
        report: PreviewReport {
            total_records: rows,
            columns: fields.into_iter().map(FieldAccumulator::finish).collect(),
            sample_rows,
            warning,
            ..Default::default()
        },
        consumed,
    })
}

fn column_name(raw: &str, index: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        format!("column_{}", index + 1)
    } else {
        trimmed.to_string()
    }
}
