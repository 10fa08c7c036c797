use crate::security::ValidationResult;
use serde::Serialize;
use thiserror::Error;

/// Main error type for the ingestion pipeline.
///
/// The first group of variants are user-facing kinds: they are surfaced verbatim and never
/// wrapped. The second group aggregates faults from the standard library, dependencies and
/// helper modules; the pipeline boundary folds those into [`IngestError::Processing`].
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed range '{spec}': {reason} (expected syntax: 'A1:C10', 'B2' or 'A:C')")]
    MalformedRange { spec: String, reason: String },

    #[error("Range '{range}' is outside sheet '{sheet}' which spans '{bounds}'")]
    RangeOutOfBounds {
        range: String,
        sheet: String,
        bounds: String,
        suggestion: Option<String>,
    },

    #[error("Malformed skip-rows token '{token}' in '{spec}' (expected syntax: '1,3,5-7')")]
    MalformedSkipSpec { spec: String, token: String },

    #[error("Header row {index} is out of range, {rows} row(s) remain after range restriction")]
    HeaderRowOutOfRange { index: usize, rows: usize },

    #[error("Unreadable file '{path}': {reason}")]
    UnreadableFile { path: String, reason: String },

    #[error("Sheet '{requested}' not found")]
    SheetNotFound {
        requested: String,
        available: Vec<String>,
        suggestion: Option<String>,
    },

    #[error("Security validation failed for '{path}': {count} issue(s) blocked by policy", count = result.security_issues().len())]
    SecurityValidation { path: String, result: ValidationResult },

    #[error("Invalid option '{name}': {message}")]
    InvalidOption { name: String, message: String },

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("{0}")]
    WithContext(String),

    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),

    // Standard library errors
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    ParseInt(#[from] std::num::ParseIntError),

    // Third-party library errors
    #[error("{0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{0}")]
    Xml(#[from] quick_xml::Error),

    #[error("{0}")]
    XmlEncoding(#[from] quick_xml::encoding::EncodingError),

    #[error("{0}")]
    XmlAttribute(#[from] quick_xml::events::attributes::AttrError),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    // Helper module errors
    #[error("{0}")]
    Cfb(#[from] crate::helpers::cfb::CfbError),

    #[error("{0}")]
    XmlHelper(#[from] crate::helpers::xml::XmlError),

    #[error("{0}")]
    Biff8(#[from] crate::helpers::biff8::Biff8Error),
}

/// Stable, serializable name of an error kind as reported in the result envelope.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    MalformedRangeError,
    RangeOutOfBoundsError,
    MalformedSkipSpecError,
    HeaderRowOutOfRangeError,
    UnreadableFileError,
    SheetNotFoundError,
    SecurityValidationError,
    InvalidOptionError,
    ProcessingError,
}

impl IngestError {
    /// Returns the envelope kind of this error. Internal faults all report as `ProcessingError`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedRange { .. } => ErrorKind::MalformedRangeError,
            Self::RangeOutOfBounds { .. } => ErrorKind::RangeOutOfBoundsError,
            Self::MalformedSkipSpec { .. } => ErrorKind::MalformedSkipSpecError,
            Self::HeaderRowOutOfRange { .. } => ErrorKind::HeaderRowOutOfRangeError,
            Self::UnreadableFile { .. } => ErrorKind::UnreadableFileError,
            Self::SheetNotFound { .. } => ErrorKind::SheetNotFoundError,
            Self::SecurityValidation { .. } => ErrorKind::SecurityValidationError,
            Self::InvalidOption { .. } => ErrorKind::InvalidOptionError,
            _ => ErrorKind::ProcessingError,
        }
    }

    /// True for the typed kinds that must reach the caller unchanged.
    pub fn is_user_facing(&self) -> bool {
        self.kind() != ErrorKind::ProcessingError || matches!(self, Self::Processing(_))
    }

    /// An actionable hint for the caller, where one can be derived.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::MalformedRange { .. } => Some("use 'A1:C10', a single cell such as 'B2', or whole columns such as 'A:C'".to_owned()),
            Self::RangeOutOfBounds { suggestion, .. } => suggestion.as_ref().map(|range| format!("try the smaller range '{range}'")),
            Self::MalformedSkipSpec { .. } => Some("use comma-separated row indices and inclusive ranges, e.g. '1,3,5-7'".to_owned()),
            Self::HeaderRowOutOfRange { rows, .. } if *rows > 0 => Some(format!("choose a header row between 1 and {rows}, or 'auto'")),
            Self::HeaderRowOutOfRange { .. } => Some("the selected range has no rows; widen the range or use 'auto'".to_owned()),
            Self::SheetNotFound { suggestion: Some(name), .. } => Some(format!("did you mean '{name}'?")),
            Self::SheetNotFound { available, .. } if !available.is_empty() => Some(format!("available sheets: {}", available.join(", "))),
            _ => None,
        }
    }

    /// Folds internal faults into a generic `Processing` error, leaving user-facing kinds intact.
    pub(crate) fn into_boundary(self) -> IngestError {
        if self.is_user_facing() {
            self
        } else {
            IngestError::Processing(self.to_string())
        }
    }
}

pub(crate) trait ResultOptionChain {
    fn ok_none_else<F>(self, f: F) -> Self
    where
        F: FnOnce() -> Self;
}

impl<T, E> ResultOptionChain for Result<Option<T>, E> {
    fn ok_none_else<F>(self, f: F) -> Self
    where
        F: FnOnce() -> Self,
    {
        match self {
            Ok(None) => f(),
            _ => self,
        }
    }
}

pub(crate) trait ResultMessage {
    fn with_prefix(self, message: &str) -> Self;
}

impl<T> ResultMessage for Result<T, IngestError> {
    /// Prefixes internal faults with context. User-facing kinds keep their own message.
    fn with_prefix(self, message: &str) -> Self {
        self.map_err(|e| {
            if e.is_user_facing() {
                e
            } else {
                IngestError::WithContext(format!("{}: {}", message, e))
            }
        })
    }
}
