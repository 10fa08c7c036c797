//! # Table shaping
//!
//! Header detection over range-restricted rows and conversion of resolved rows into records
//! or a matrix.
pub mod converter;
pub mod header;

pub use converter::ConversionResult;
pub use converter::DataConverter;
pub use converter::TableData;
pub use header::HeaderDetectionResult;
pub use header::HeaderDetector;
pub use header::HeaderMode;
pub use header::HeaderThresholds;
