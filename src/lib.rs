//! # Spreadsheet Ingestion Pipeline
//!
//! Turns an Excel workbook plus a set of declarative extraction directives into a validated,
//! structured table, or a typed error naming the stage that rejected it.
//!
//! ## Features
//!
//! - **Multi-format support**: Office Open XML (`.xlsx`, `.xlsm`, `.xltx`, `.xltm`, `.xlam`) and,
//!   with the default `legacy` feature, BIFF8 workbooks (`.xls`, `.xla`)
//! - **Security scanning**: macro containers and unsafe hyperlink or formula schemes are found
//!   without executing anything, then judged by a `strict`, `warn` or `allow` policy
//! - **Range expressions**: `A1:C10`, `B2` and whole columns `A:C`, validated against the sheet
//! - **Header detection**: a two-tier text/number heuristic with an explicit override
//! - **Merged cells**: expand, keep the first cell only, or skip intersecting rows
//! - **Caching**: results keyed by file content and options, computed once under concurrency
//!
//! ## Stages
//!
//! `SecurityCheck → RangeResolve → Read → Convert → Integrate`, see [`pipeline::Pipeline`].
//!
//! ```no_run
//! use rusty_ingest::pipeline::{Directives, Pipeline, PipelineConfig};
//! use std::path::Path;
//!
//! let config = PipelineConfig::default();
//! let pipeline = Pipeline::new(config.clone()).with_cache(config.build_cache());
//! let directives = Directives::new().set("range", "B2:D5").set("header-row", "auto");
//! let envelope = pipeline.run(Path::new("report.xlsx"), &directives);
//! println!("{}", envelope.to_json().unwrap_or_default());
//! ```
pub mod cache;
pub mod error;
pub mod pipeline;
pub mod security;
pub mod spreadsheet;
pub mod table;

pub(crate) mod helpers {
    pub(crate) mod biff8;
    pub(crate) mod bytes;
    pub(crate) mod cfb;
    pub(crate) mod reader;
    pub(crate) mod xml;
    pub(crate) mod zip;
}

pub use crate::error::ErrorKind;
pub use crate::error::IngestError;
pub use crate::pipeline::Envelope;
pub use crate::pipeline::Pipeline;
