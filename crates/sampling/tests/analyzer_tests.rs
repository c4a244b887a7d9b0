//! Integration tests for the sampling analyzer.
//!
//! Files are written to temporary paths; large files are created sparse so
//! that only the leading bytes contain data.

use std::io::Write;

use bulkload_core::job::{ParsingConfig, SourceFormat};
use bulkload_core::preview::InferredType;
use bulkload_sampling::{AnalyzerConfig, SamplingAnalyzer};

const MB: u64 = 1024 * 1024;

fn csv_rows(rows: usize) -> String {
    let mut text = String::from("id,name,status,note\n");
    for i in 0..rows {
        let status = if i % 3 == 0 { "active" } else { "inactive" };
        let note = if i % 4 == 0 { "" } else { "checked" };
        text.push_str(&format!("{i},person-{i},{status},{note}\n"));
    }
    text
}

fn write_file(contents: &[u8], total_len: Option<u64>) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(contents).expect("write");
    if let Some(len) = total_len {
        file.as_file().set_len(len).expect("set_len");
    }
    file.flush().expect("flush");
    file
}

// ---------------------------------------------------------------------------
// Test: small CSV is analyzed exactly
// ---------------------------------------------------------------------------

#[tokio::test]
async fn small_csv_counts_every_data_row() {
    let text = csv_rows(60);
    assert!(text.len() < 3000);
    let file = write_file(text.as_bytes(), None);

    let report = SamplingAnalyzer::default()
        .analyze(file.path(), &ParsingConfig::for_format(SourceFormat::Csv))
        .await
        .expect("analysis should succeed");

    let line_count = text.lines().count() as u64;
    assert_eq!(report.total_records, line_count - 1);
    assert!(!report.sampling.is_sampled);
    assert!(report.sampling.note.is_none());
    assert_eq!(report.bytes_read, text.len() as u64);

    let types: Vec<_> = report.columns.iter().map(|c| c.inferred_type).collect();
    assert_eq!(
        types,
        [
            InferredType::Number,
            InferredType::Text,
            InferredType::Category,
            InferredType::Category,
        ]
    );
    assert_eq!(report.columns[3].empty_count, 15);
}

// ---------------------------------------------------------------------------
// Test: large CSV only reads the prefix
// ---------------------------------------------------------------------------

#[tokio::test]
async fn large_csv_is_sampled_from_prefix() {
    let text = csv_rows(25_000);
    assert!(text.len() as u64 > 512_000);
    let file = write_file(text.as_bytes(), Some(50 * MB));

    let analyzer = SamplingAnalyzer::default();
    let report = analyzer
        .analyze(file.path(), &ParsingConfig::for_format(SourceFormat::Csv))
        .await
        .expect("analysis should succeed");

    assert!(report.bytes_read <= analyzer.config().prefix_bytes);
    assert_eq!(report.file_size, 50 * MB);
    assert!(report.sampling.is_sampled);
    assert!(report.sampling.note.is_some());
    assert!(report.total_records > report.sampling.sampled_records);

    // Scaling: reported empties are the sampled empties times the ratio.
    let factor = report.file_size as f64 / report.sampling.sample_size as f64;
    let sampled_rows = report.sampling.sampled_records;
    let sampled_empty = sampled_rows.div_ceil(4);
    let expected = (sampled_empty as f64 * factor).round() as i64;
    let reported = report.columns[3].empty_count as i64;
    assert!(
        (reported - expected).abs() <= 1,
        "reported {reported}, expected {expected}"
    );
}

// ---------------------------------------------------------------------------
// Test: custom threshold and prefix are honoured
// ---------------------------------------------------------------------------

#[tokio::test]
async fn custom_prefix_bound() {
    let text = csv_rows(2_000);
    let file = write_file(text.as_bytes(), None);

    let analyzer = SamplingAnalyzer::new(AnalyzerConfig {
        sample_threshold_bytes: 1024,
        prefix_bytes: 4096,
    });
    let report = analyzer
        .analyze(file.path(), &ParsingConfig::for_format(SourceFormat::Csv))
        .await
        .expect("analysis should succeed");

    assert_eq!(report.bytes_read, 4096);
    assert!(report.sampling.is_sampled);
    assert!(report.sampling.sample_size <= 4096);
}

// ---------------------------------------------------------------------------
// Test: large JSON array is sampled item by item
// ---------------------------------------------------------------------------

#[tokio::test]
async fn large_json_is_sampled() {
    let mut text = String::from("{\"data\":{\"items\":[");
    for i in 0..20_000 {
        if i > 0 {
            text.push(',');
        }
        text.push_str(&format!(
            "{{\"id\":{i},\"owner\":{{\"name\":\"n{i}\",\"team\":\"t{}\"}}}}",
            i % 4
        ));
    }
    text.push_str("]}}");
    let file = write_file(text.as_bytes(), Some(20 * MB));

    let mut config = ParsingConfig::for_format(SourceFormat::Json);
    config.root_path = "data.items".to_string();
    let report = SamplingAnalyzer::default()
        .analyze(file.path(), &config)
        .await
        .expect("analysis should succeed");

    assert!(report.sampling.is_sampled);
    assert!(report.is_structured());
    let names: Vec<_> = report.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["id", "owner.name", "owner.team"]);
    assert_eq!(report.columns[2].inferred_type, InferredType::Category);
}

// ---------------------------------------------------------------------------
// Test: unparseable text degrades to an opaque preview
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_json_yields_opaque_preview() {
    let file = write_file(b"this is not json at all", None);

    let report = SamplingAnalyzer::default()
        .analyze(file.path(), &ParsingConfig::for_format(SourceFormat::Json))
        .await
        .expect("analysis never fails on content");

    assert!(!report.is_structured());
    assert_eq!(report.raw_preview.as_deref(), Some("this is not json at all"));
    assert!(report.warning.is_some());
}

#[tokio::test]
async fn missing_file_is_an_error() {
    let result = SamplingAnalyzer::default()
        .analyze(
            std::path::Path::new("/nonexistent/input.csv"),
            &ParsingConfig::default(),
        )
        .await;
    assert!(result.is_err());
}
