//! # Extraction pipeline
//!
//! Runs one workbook through `SecurityCheck → RangeResolve → Read → Convert → Integrate` and
//! reports either a [`Outcome`] or a [`Failure`] naming the stage that stopped it. [`Pipeline::run`]
//! wraps both into the uniform [`Envelope`].
//!
//! The security scan runs on every call. Only the stages after it are memoized, through an
//! optional shared [`CacheLayer`].
pub mod options;

pub use crate::pipeline::options::DetectRange;
pub use crate::pipeline::options::Directives;
pub use crate::pipeline::options::ExtractOptions;
pub use crate::pipeline::options::Param;

use crate::cache::CacheKey;
use crate::cache::CacheLayer;
use crate::cache::CacheStatus;
use crate::cache::DEFAULT_CAPACITY;
use crate::error::ErrorKind;
use crate::error::IngestError;
use crate::error::ResultMessage;
use crate::pipeline::options::MacroSecurityParam;
use crate::security::SecurityScanner;
use crate::security::ValidationResult;
use crate::spreadsheet::merge::MergeCellResolver;
use crate::spreadsheet::merge::MergeSummary;
use crate::spreadsheet::open_workbook;
use crate::spreadsheet::range::RangeInfo;
use crate::spreadsheet::ReadWindow;
use crate::spreadsheet::Row;
use crate::table::header::normalize_names;
use crate::table::header::DEFAULT_SAMPLE_SIZE;
use crate::table::ConversionResult;
use crate::table::DataConverter;
use crate::table::HeaderDetectionResult;
use crate::table::HeaderDetector;
use crate::table::HeaderThresholds;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// The cache a pipeline shares across calls and threads.
pub type ExtractionCache = CacheLayer<Extraction>;

/// Tunables of a pipeline instance. Every field has a default, so any subset may be supplied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PipelineConfig {
    pub header_thresholds: HeaderThresholds,
    /// Number of leading rows the header heuristic looks at
    pub header_sample_rows: usize,
    /// Added to the built-in business keywords of the keyword tier
    pub extra_keywords: Vec<String>,
    pub cache_capacity: usize,
    /// Persist cache entries as JSON files under this directory
    pub cache_directory: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            header_thresholds: HeaderThresholds::default(),
            header_sample_rows: DEFAULT_SAMPLE_SIZE,
            extra_keywords: Vec::new(),
            cache_capacity: DEFAULT_CAPACITY,
            cache_directory: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(text: &str) -> Result<PipelineConfig, IngestError> {
        Ok(serde_json::from_str(text)?)
    }

    /// A fresh cache sized and located as configured.
    pub fn build_cache(&self) -> Arc<ExtractionCache> {
        let cache = CacheLayer::new(self.cache_capacity);
        match &self.cache_directory {
            Some(directory) => Arc::new(cache.with_directory(directory)),
            None => Arc::new(cache),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    SecurityCheck,
    RangeResolve,
    Read,
    Convert,
    Integrate,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::SecurityCheck => "security-check",
            Stage::RangeResolve => "range-resolve",
            Stage::Read => "read",
            Stage::Convert => "convert",
            Stage::Integrate => "integrate",
        };
        write!(f, "{name}")
    }
}

/// Everything computed after the security check. This is the cached value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub sheet: String,
    /// The window that was read, `None` for an empty sheet
    pub detected_range: Option<RangeInfo>,
    pub header: HeaderDetectionResult,
    pub merge: MergeSummary,
    pub result: ConversionResult,
}

/// A successful run.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub extraction: Extraction,
    pub validation: ValidationResult,
    pub cache: CacheStatus,
    /// Option, security and conversion warnings, in that order
    pub warnings: Vec<String>,
}

/// A run that stopped at `stage`.
#[derive(Error, Debug)]
#[error("{stage} failed: {error}")]
pub struct Failure {
    pub stage: Stage,
    #[source]
    pub error: IngestError,
    /// Warnings collected before the failure
    pub warnings: Vec<String>,
    /// Present once the security check has completed
    pub validation: Option<ValidationResult>,
}

impl Failure {
    pub fn new(stage: Stage, error: IngestError) -> Failure {
        Failure {
            stage,
            error,
            warnings: Vec::new(),
            validation: None,
        }
    }

    fn at(stage: Stage) -> impl Fn(IngestError) -> Failure {
        move |error| Failure::new(stage, error)
    }

    fn with_context(mut self, warnings: &[String], validation: Option<&ValidationResult>) -> Failure {
        let mut collected = warnings.to_vec();
        collected.append(&mut self.warnings);
        self.warnings = collected;
        if self.validation.is_none() {
            self.validation = validation.cloned();
        }
        self
    }
}

/// Stage an option parsing error is reported at: the security policy belongs to the security
/// check, every other option to range resolution.
fn option_stage(error: &IngestError) -> Stage {
    match error {
        IngestError::InvalidOption { name, .. } if name == MacroSecurityParam::name() => Stage::SecurityCheck,
        _ => Stage::RangeResolve,
    }
}

/// Runs extractions. Holds configuration and an optional shared cache, nothing per call.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    detector: HeaderDetector,
    cache: Option<Arc<ExtractionCache>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::new(PipelineConfig::default())
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Pipeline {
        let detector = HeaderDetector::new(config.header_thresholds, config.header_sample_rows, &config.extra_keywords);
        Pipeline { config, detector, cache: None }
    }

    pub fn with_cache(mut self, cache: Arc<ExtractionCache>) -> Pipeline {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<ExtractionCache>> {
        self.cache.as_ref()
    }

    /// Parses `directives` and extracts `path`, reporting the result as an [`Envelope`].
    pub fn run(&self, path: &Path, directives: &Directives) -> Envelope {
        let result = ExtractOptions::try_from(directives)
            .map_err(|error| Failure::new(option_stage(&error), error))
            .and_then(|options| self.extract(path, &options));
        match result {
            Ok(outcome) => Envelope::succeeded(path, outcome),
            Err(failure) => Envelope::failed(path, failure),
        }
    }

    /// Typed entry point: runs every stage for already validated options.
    pub fn extract(&self, path: &Path, options: &ExtractOptions) -> Result<Outcome, Failure> {
        let mut warnings = options.warnings.clone();

        tracing::debug!("{}: {} under {} policy", Stage::SecurityCheck, path.display(), options.macro_security);
        let validation = SecurityScanner::new(options.macro_security)
            .scan(path)
            .map_err(|error| Failure::new(Stage::SecurityCheck, error).with_context(&warnings, None))?;
        if !validation.is_valid() {
            tracing::warn!("{} blocked by the {} policy", path.display(), options.macro_security);
            let error = IngestError::SecurityValidation {
                path: path.display().to_string(),
                result: validation.clone(),
            };
            return Err(Failure::new(Stage::SecurityCheck, error).with_context(&warnings, Some(&validation)));
        }
        warnings.extend(validation.warnings().iter().cloned());

        let computed = match self.cache.as_ref().filter(|_| options.json_cache) {
            Some(cache) => CacheKey::for_file(path, &options.canonical())
                .map_err(Failure::at(Stage::RangeResolve))
                .and_then(|key| cache.get_or_compute(&key, || self.compute(path, options))),
            None => self.compute(path, options).map(|extraction| (extraction, CacheStatus::Bypass)),
        };
        let (extraction, cache) = computed.map_err(|failure| failure.with_context(&warnings, Some(&validation)))?;
        warnings.extend(extraction.result.warnings.iter().cloned());

        tracing::debug!("{} finished with cache {:?}", path.display(), cache);
        Ok(Outcome {
            extraction,
            validation,
            cache,
            warnings,
        })
    }

    fn compute(&self, path: &Path, options: &ExtractOptions) -> Result<Extraction, Failure> {
        tracing::debug!("{}: {}", Stage::RangeResolve, path.display());
        let mut workbook = open_workbook(path).map_err(Failure::at(Stage::RangeResolve))?;
        let info = workbook.info();
        let sheet = info.resolve(&options.sheet).map_err(Failure::at(Stage::RangeResolve))?;
        let sheet_name = info.sheet_names.get(sheet).cloned().unwrap_or_default();
        let dimensions = info.dimensions_of(sheet);
        let window = match &options.range {
            Some(range) => {
                range
                    .validate(dimensions, &sheet_name)
                    .map_err(Failure::at(Stage::RangeResolve))?;
                Some(range.bind(dimensions))
            }
            None => dimensions.full_range(),
        };

        let Some(window) = window else {
            tracing::debug!("Sheet '{sheet_name}' of {} is empty", path.display());
            let header = self
                .detector
                .resolve(&[], options.header)
                .map_err(Failure::at(Stage::Convert))?;
            let merge = MergeSummary {
                mode: options.merge_cells,
                ..MergeSummary::default()
            };
            let result = DataConverter::default().convert(Vec::new(), &header, Some(&merge));
            return Ok(Extraction {
                sheet: sheet_name,
                detected_range: None,
                header,
                merge,
                result,
            });
        };

        tracing::debug!("{}: sheet '{sheet_name}' window {window}", Stage::Read);
        let regions = workbook
            .merged_regions(sheet)
            .with_prefix(&format!("Failed to read merged cells of sheet '{sheet_name}'"))
            .map_err(Failure::at(Stage::Read))?;
        let read_window = ReadWindow::new(window.clone()).capturing_anchors(&regions);
        let (rows, captured) = {
            let prefix = format!("Failed to read sheet '{sheet_name}'");
            let mut sheet_rows = workbook
                .read_sheet(sheet, &read_window)
                .with_prefix(&prefix)
                .map_err(Failure::at(Stage::Read))?;
            let rows = sheet_rows
                .by_ref()
                .collect::<Result<Vec<Row>, IngestError>>()
                .with_prefix(&prefix)
                .map_err(Failure::at(Stage::Read))?;
            (rows, sheet_rows.captured().clone())
        };
        drop(workbook);

        tracing::debug!("{}: {} row(s), {} merged region(s)", Stage::Convert, rows.len(), regions.len());
        let resolver = MergeCellResolver::new(&regions, options.merge_cells, &window, &rows, &captured);
        let mut kept: Vec<Row> = rows
            .into_iter()
            .enumerate()
            .filter(|(position, _)| !options.skip_rows.contains(position))
            .map(|(_, row)| row)
            .collect();
        let mut header = self
            .detector
            .resolve(&kept, options.header)
            .map_err(Failure::at(Stage::Convert))?;
        let data_rows = match header.header_row_index.filter(|_| header.has_header) {
            Some(position) => {
                // rows above the header are preamble
                let mut data_rows = kept.split_off(position);
                let mut header_row = data_rows.remove(0);
                if options.merge_headers && resolver.fill_header(&mut header_row) > 0 {
                    (header.normalized_names, header.generated_names) = normalize_names(&header_row.cells);
                }
                data_rows
            }
            None => kept,
        };
        let (data_rows, merge) = resolver.apply(data_rows);
        let mut result = DataConverter::new(window.start_col).convert(data_rows, &header, Some(&merge));

        tracing::debug!("{}: {} row(s) x {} column(s)", Stage::Integrate, result.row_count, result.col_count);
        if options.detect_range == DetectRange::Smart {
            result.trim_empty_edges();
        }
        Ok(Extraction {
            sheet: sheet_name,
            detected_range: Some(window),
            header,
            merge,
            result,
        })
    }
}

/// Error section of an [`Envelope`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnvelopeError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Provenance of an envelope. Fields stay empty for stages that were not reached.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Metadata {
    pub file: String,
    pub sheet: Option<String>,
    pub detected_range: Option<String>,
    pub headers: Option<Vec<String>>,
    pub header: Option<HeaderDetectionResult>,
    pub row_count: usize,
    pub col_count: usize,
    pub security: Option<ValidationResult>,
    pub merge: Option<MergeSummary>,
    pub cache: Option<CacheStatus>,
}

/// Uniform result of [`Pipeline::run`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
    pub warnings: Vec<String>,
    pub metadata: Metadata,
}

impl Envelope {
    fn succeeded(path: &Path, outcome: Outcome) -> Envelope {
        let Outcome {
            extraction,
            validation,
            cache,
            warnings,
        } = outcome;
        let result = &extraction.result;
        Envelope {
            success: true,
            data: Some(result.data_json()),
            error: None,
            warnings,
            metadata: Metadata {
                file: path.display().to_string(),
                sheet: Some(extraction.sheet.clone()),
                detected_range: extraction.detected_range.as_ref().map(ToString::to_string),
                headers: result.headers.clone(),
                row_count: result.row_count,
                col_count: result.col_count,
                header: Some(extraction.header),
                security: Some(validation),
                merge: Some(extraction.merge),
                cache: Some(cache),
            },
        }
    }

    fn failed(path: &Path, failure: Failure) -> Envelope {
        let Failure {
            stage,
            error,
            warnings,
            validation,
        } = failure;
        if error.is_user_facing() {
            tracing::debug!("{stage} rejected {}: {error}", path.display());
        } else {
            tracing::error!("{stage} failed for {}: {error}", path.display());
        }
        let error = error.into_boundary();
        let validation = match &error {
            IngestError::SecurityValidation { result, .. } => Some(result.clone()),
            _ => validation,
        };
        Envelope {
            success: false,
            data: None,
            error: Some(EnvelopeError {
                kind: error.kind(),
                stage,
                message: error.to_string(),
                suggestion: error.suggestion(),
            }),
            warnings,
            metadata: Metadata {
                file: path.display().to_string(),
                security: validation,
                ..Metadata::default()
            },
        }
    }

    pub fn to_json(&self) -> Result<String, IngestError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_accepts_partial_json() -> Result<(), IngestError> {
        let config = PipelineConfig::from_json(
            r#"{"header-sample-rows": 5, "extra-keywords": ["sku"], "header-thresholds": {"strict_text_ratio": 0.9}}"#,
        )?;
        assert_eq!(config.header_sample_rows, 5);
        assert_eq!(config.extra_keywords, vec!["sku".to_owned()]);
        assert_eq!(config.header_thresholds.strict_text_ratio, 0.9);
        assert_eq!(config.header_thresholds.strict_numeric_ratio, 0.5);
        assert_eq!(config.cache_capacity, DEFAULT_CAPACITY);
        assert!(config.cache_directory.is_none());
        Ok(())
    }

    #[test]
    fn option_errors_are_attributed_to_a_stage() {
        let policy = IngestError::InvalidOption {
            name: "macro-security".to_owned(),
            message: "bad".to_owned(),
        };
        let merge = IngestError::InvalidOption {
            name: "merge-cells".to_owned(),
            message: "bad".to_owned(),
        };
        assert_eq!(option_stage(&policy), Stage::SecurityCheck);
        assert_eq!(option_stage(&merge), Stage::RangeResolve);
    }

    #[test]
    fn invalid_directives_fail_before_touching_the_file() {
        let directives = Directives::new().set("macro-security", "paranoid");
        let envelope = Pipeline::default().run(Path::new("/nonexistent/book.xlsx"), &directives);
        assert!(!envelope.success);
        let error = envelope.error.as_ref().map(|error| (error.kind, error.stage));
        assert_eq!(error, Some((ErrorKind::InvalidOptionError, Stage::SecurityCheck)));
    }

    #[test]
    fn missing_file_is_unreadable_at_the_security_check() {
        let envelope = Pipeline::default().run(Path::new("/nonexistent/book.xlsx"), &Directives::new());
        let error = envelope.error.as_ref().map(|error| (error.kind, error.stage));
        assert_eq!(error, Some((ErrorKind::UnreadableFileError, Stage::SecurityCheck)));
        assert!(envelope.metadata.security.is_none());
    }

    #[test]
    fn pipeline_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Pipeline>();
        assert_send_sync::<Arc<ExtractionCache>>();
    }
}
