mod common;

use common::report_sheet;
use common::write_workbook;
use common::Sheet;
use rusty_ingest::cache::CacheStatus;
use rusty_ingest::pipeline::Directives;
use rusty_ingest::pipeline::Envelope;
use rusty_ingest::pipeline::Pipeline;
use rusty_ingest::pipeline::PipelineConfig;
use rusty_ingest::pipeline::Stage;
use rusty_ingest::ErrorKind;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn run(path: &Path, pairs: &[(&str, &str)]) -> Envelope {
    let directives: Directives = pairs.iter().copied().collect();
    Pipeline::default().run(path, &directives)
}

fn failure(envelope: &Envelope) -> Option<(ErrorKind, Stage)> {
    envelope.error.as_ref().map(|error| (error.kind, error.stage))
}

#[test]
fn range_with_auto_header() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);

    let envelope = run(&path, &[("range", "B2:D5"), ("header-row", "auto")]);
    assert!(envelope.success, "{:?}", envelope.error);
    let metadata = &envelope.metadata;
    assert_eq!(metadata.sheet.as_deref(), Some("Report"));
    assert_eq!(metadata.detected_range.as_deref(), Some("B2:D5"));
    assert_eq!(metadata.headers, Some(vec!["Region".to_owned(), "Units".to_owned(), "Revenue".to_owned()]));
    assert_eq!((metadata.row_count, metadata.col_count), (3, 3));
    assert_eq!(metadata.cache, Some(CacheStatus::Bypass));
    let header = metadata.header.as_ref().unwrap();
    assert!(header.has_header);
    assert_eq!(header.confidence, 0.8);

    let data = envelope.data.unwrap();
    assert_eq!(data[0], json!({"Region": "North", "Units": 10, "Revenue": 20.5}));
    assert_eq!(data[2], json!({"Region": "East", "Units": 7, "Revenue": 12.25}));
}

#[test]
fn whole_columns_run_to_the_last_row() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);

    let envelope = run(&path, &[("range", "B:C")]);
    assert!(envelope.success, "{:?}", envelope.error);
    assert_eq!(envelope.metadata.detected_range.as_deref(), Some("B1:C10"));
    // the blank first row is passed over, rows above the header are dropped
    assert_eq!(envelope.metadata.headers, Some(vec!["Region".to_owned(), "Units".to_owned()]));
    assert_eq!(envelope.metadata.row_count, 8);
    assert_eq!(envelope.data.unwrap()[7], json!({"Region": "", "Units": 95}));
}

#[test]
fn ranges_outside_the_sheet_are_rejected() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);

    let envelope = run(&path, &[("range", "A1:G20")]);
    assert_eq!(failure(&envelope), Some((ErrorKind::RangeOutOfBoundsError, Stage::RangeResolve)));
    let suggestion = envelope.error.unwrap().suggestion.unwrap();
    assert!(suggestion.contains("A1:F10"), "{suggestion}");
    assert!(envelope.data.is_none());

    let envelope = run(&path, &[("range", "A1:B2:C3")]);
    assert_eq!(failure(&envelope), Some((ErrorKind::MalformedRangeError, Stage::RangeResolve)));
}

#[test]
fn reversed_range_is_normalized_with_a_warning() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);

    let envelope = run(&path, &[("range", "D5:B2")]);
    assert!(envelope.success);
    assert_eq!(envelope.metadata.detected_range.as_deref(), Some("B2:D5"));
    assert!(envelope.warnings.iter().any(|warning| warning.contains("reversed")));
}

#[test]
fn explicit_header_row_must_exist() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);

    let envelope = run(&path, &[("range", "B2:D5"), ("header-row", "5")]);
    assert_eq!(failure(&envelope), Some((ErrorKind::HeaderRowOutOfRangeError, Stage::Convert)));
    assert!(envelope.error.unwrap().suggestion.unwrap().contains("between 1 and 4"));

    let envelope = run(&path, &[("range", "B2:D5"), ("header-row", "2")]);
    assert!(envelope.success);
    assert_eq!(envelope.metadata.headers, Some(vec!["North".to_owned(), "10".to_owned(), "20.5".to_owned()]));
    assert_eq!(envelope.metadata.row_count, 2);
}

#[test]
fn skipped_rows_count_from_the_range_start() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);

    let envelope = run(&path, &[("range", "B2:D5"), ("skip-rows", "1-2")]);
    assert!(envelope.success, "{:?}", envelope.error);
    assert_eq!(envelope.metadata.row_count, 1);
    assert_eq!(envelope.data.unwrap()[0]["Region"], json!("East"));

    let envelope = run(&path, &[("skip-rows", "1,,2")]);
    assert_eq!(failure(&envelope), Some((ErrorKind::MalformedSkipSpecError, Stage::RangeResolve)));
}

#[test]
fn header_none_yields_a_matrix() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);

    let envelope = run(&path, &[("range", "B2:C3"), ("header-row", "none")]);
    assert!(envelope.success);
    assert_eq!(envelope.metadata.headers, None);
    assert_eq!(envelope.data.unwrap(), json!([["Region", "Units"], ["North", 10]]));
}

fn merged_sheet() -> Sheet {
    Sheet::new(
        "Merged",
        &[&["Merged", "", "x"], &["", "", "y"], &["a", "b", "c"]],
    )
    .merge("A1:B2")
}

#[test]
fn merge_modes_on_a_two_by_two_region() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "merged.xlsx", &[merged_sheet()]);

    let expand = run(&path, &[("header-row", "none"), ("merge-cells", "expand")]);
    assert_eq!(
        expand.data.unwrap(),
        json!([["Merged", "Merged", "x"], ["Merged", "Merged", "y"], ["a", "b", "c"]])
    );
    assert_eq!(expand.metadata.merge.as_ref().map(|merge| merge.cells_filled), Some(3));

    let first = run(&path, &[("header-row", "none"), ("merge-cells", "first")]);
    assert_eq!(first.data.unwrap(), json!([["Merged", "", "x"], ["", "", "y"], ["a", "b", "c"]]));

    let skip = run(&path, &[("header-row", "none"), ("merge-cells", "skip")]);
    assert_eq!(skip.data.unwrap(), json!([["a", "b", "c"]]));
    assert_eq!(skip.metadata.merge.as_ref().map(|merge| merge.rows_skipped), Some(2));
    assert!(skip.warnings.iter().any(|warning| warning.contains("skipped")));
}

#[test]
fn merge_anchor_outside_the_range_still_fills() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "merged.xlsx", &[merged_sheet()]);

    let envelope = run(&path, &[("range", "B2:C3"), ("header-row", "none")]);
    assert_eq!(envelope.data.unwrap(), json!([["Merged", "y"], ["b", "c"]]));
}

#[test]
fn merged_header_cells_can_be_filled() {
    let directory = tempfile::tempdir().unwrap();
    let sheet = Sheet::new(
        "Sales",
        &[&["Region", "Sales", "", "Total"], &["North", "10", "12", "22"], &["South", "8", "9", "17"]],
    )
    .merge("B1:C1");
    let path = write_workbook(directory.path(), "sales.xlsx", &[sheet]);

    let plain = run(&path, &[]);
    assert_eq!(
        plain.metadata.headers,
        Some(vec!["Region".to_owned(), "Sales".to_owned(), "column3".to_owned(), "Total".to_owned()])
    );

    let filled = run(&path, &[("merge-headers", "true")]);
    assert_eq!(
        filled.metadata.headers,
        Some(vec!["Region".to_owned(), "Sales".to_owned(), "Sales_2".to_owned(), "Total".to_owned()])
    );
    assert_eq!(filled.data.unwrap()[1]["Sales_2"], json!(9));
}

#[test]
fn smart_detection_trims_blank_edges() {
    let directory = tempfile::tempdir().unwrap();
    let sheet = Sheet::new(
        "Scores",
        &[
            &["", "", "", "", ""],
            &["", "Name", "Score", "", ""],
            &["", "Ann", "90", "", ""],
            &["", "Bob", "85", "", ""],
            &["", "", "", "", ""],
            &["", "", "", "", ""],
        ],
    );
    let path = write_workbook(directory.path(), "scores.xlsx", &[sheet]);

    let auto = run(&path, &[]);
    assert_eq!((auto.metadata.row_count, auto.metadata.col_count), (4, 5));

    let smart = run(&path, &[("detect-range", "smart")]);
    assert_eq!((smart.metadata.row_count, smart.metadata.col_count), (2, 2));
    assert_eq!(smart.metadata.headers, Some(vec!["Name".to_owned(), "Score".to_owned()]));
    assert_eq!(smart.data.unwrap(), json!([{"Name": "Ann", "Score": 90}, {"Name": "Bob", "Score": 85}]));

    let manual = run(&path, &[("detect-range", "manual")]);
    assert_eq!(failure(&manual), Some((ErrorKind::InvalidOptionError, Stage::RangeResolve)));
}

#[test]
fn sheets_are_selected_by_name_or_position() {
    let directory = tempfile::tempdir().unwrap();
    let summary = Sheet::new("Summary", &[&["only"]]);
    let path = write_workbook(directory.path(), "two.xlsx", &[summary, report_sheet()]);

    let by_position = run(&path, &[("sheet", "1"), ("range", "B2:D5")]);
    assert_eq!(by_position.metadata.sheet.as_deref(), Some("Report"));

    let active = run(&path, &[("header-row", "none")]);
    assert_eq!(active.metadata.sheet.as_deref(), Some("Summary"));
    assert_eq!(active.data.unwrap(), json!([["only"]]));

    let typo = run(&path, &[("sheet", "Reprot")]);
    assert_eq!(failure(&typo), Some((ErrorKind::SheetNotFoundError, Stage::RangeResolve)));
    assert_eq!(typo.error.unwrap().suggestion.as_deref(), Some("did you mean 'Report'?"));
}

#[test]
fn empty_sheets_produce_empty_results() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "empty.xlsx", &[Sheet::new("Blank", &[])]);

    let envelope = run(&path, &[]);
    assert!(envelope.success);
    assert_eq!(envelope.metadata.row_count, 0);
    assert_eq!(envelope.metadata.detected_range, None);
    assert_eq!(envelope.data.unwrap(), json!([]));

    let envelope = run(&path, &[("range", "A1")]);
    assert_eq!(failure(&envelope), Some((ErrorKind::RangeOutOfBoundsError, Stage::RangeResolve)));
}

#[test]
fn files_that_are_not_workbooks_are_unreadable() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("notes.xlsx");
    std::fs::write(&path, "just some text").unwrap();

    let envelope = run(&path, &[]);
    assert_eq!(failure(&envelope), Some((ErrorKind::UnreadableFileError, Stage::SecurityCheck)));
}

#[test]
fn unknown_options_are_warnings() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);

    let envelope = run(&path, &[("range", "B2:D5"), ("colour", "blue")]);
    assert!(envelope.success);
    assert!(envelope.warnings.contains(&"unknown option 'colour' was ignored".to_owned()));
}

#[test]
fn envelope_serializes_without_empty_sections() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);

    let success: serde_json::Value = serde_json::from_str(&run(&path, &[("range", "B2:D5")]).to_json().unwrap()).unwrap();
    assert_eq!(success["success"], json!(true));
    assert!(success.get("error").is_none());
    assert_eq!(success["metadata"]["cache"], json!("bypass"));

    let failed: serde_json::Value = serde_json::from_str(&run(&path, &[("range", "Z99")]).to_json().unwrap()).unwrap();
    assert!(failed.get("data").is_none());
    assert_eq!(failed["error"]["kind"], json!("RangeOutOfBoundsError"));
    assert_eq!(failed["error"]["stage"], json!("range-resolve"));
}

#[test]
fn cached_results_follow_options_and_content() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);
    let config = PipelineConfig::default();
    let pipeline = Pipeline::new(config.clone()).with_cache(config.build_cache());
    let status = |pairs: &[(&str, &str)]| {
        let directives: Directives = pairs.iter().copied().collect();
        let envelope = pipeline.run(&path, &directives);
        assert!(envelope.success, "{:?}", envelope.error);
        envelope.metadata.cache
    };

    assert_eq!(status(&[("range", "B2:D5")]), Some(CacheStatus::Miss));
    assert_eq!(status(&[("range", "B2:D5")]), Some(CacheStatus::Hit));
    assert_eq!(status(&[("range", "B2:D6")]), Some(CacheStatus::Miss));
    assert_eq!(status(&[("range", "B2:D5"), ("json-cache", "false")]), Some(CacheStatus::Bypass));

    write_workbook(directory.path(), "report.xlsx", &[report_sheet().merge("E2:F2")]);
    assert_eq!(status(&[("range", "B2:D5")]), Some(CacheStatus::Miss));
    assert_eq!(status(&[("range", "B2:D5")]), Some(CacheStatus::Hit));
}

#[test]
fn concurrent_runs_compute_once() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);
    let config = PipelineConfig::default();
    let pipeline = Arc::new(Pipeline::new(config.clone()).with_cache(config.build_cache()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            let path = path.clone();
            std::thread::spawn(move || {
                let directives = Directives::new().set("range", "B2:D5");
                pipeline.run(&path, &directives).metadata.cache
            })
        })
        .collect();
    let statuses: Vec<_> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();
    assert_eq!(statuses.iter().filter(|status| **status == Some(CacheStatus::Miss)).count(), 1);
    assert_eq!(statuses.iter().filter(|status| **status == Some(CacheStatus::Hit)).count(), 7);
}

#[test]
fn disk_cache_survives_a_new_pipeline() {
    let directory = tempfile::tempdir().unwrap();
    let path = write_workbook(directory.path(), "report.xlsx", &[report_sheet()]);
    let config = PipelineConfig {
        cache_directory: Some(directory.path().join("cache")),
        ..PipelineConfig::default()
    };
    let directives = Directives::new().set("range", "B2:D5");

    let first = Pipeline::new(config.clone()).with_cache(config.build_cache()).run(&path, &directives);
    let second = Pipeline::new(config.clone()).with_cache(config.build_cache()).run(&path, &directives);
    assert_eq!(first.metadata.cache, Some(CacheStatus::Miss));
    assert_eq!(second.metadata.cache, Some(CacheStatus::Hit));
    assert_eq!(first.data, second.data);
}
