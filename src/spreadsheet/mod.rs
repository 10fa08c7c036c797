//! # Workbook access
//!
//! Opens Office Open XML (`.xlsx`, `.xlsm`, ...) and, with the `legacy` feature, BIFF8 (`.xls`)
//! workbooks behind one [`Workbook`] trait. Sheets are read lazily as dense rows over a
//! [`ReadWindow`]; merged regions and declared dimensions are exposed alongside.
pub(crate) mod excel;
pub mod merge;
pub mod range;
pub mod reference;
pub(crate) mod sheet;
pub mod skip;
#[cfg(feature = "legacy")]
mod xls;
pub(crate) mod xlsx;

pub mod cell;

use crate::error::IngestError;
use crate::helpers::cfb::Cfb;
use crate::helpers::reader::UnifiedReader;
use crate::spreadsheet::cell::CellValue;
use crate::spreadsheet::merge::MergedRegion;
use crate::spreadsheet::range::RangeInfo;
use crate::spreadsheet::range::SheetDimensions;
use serde::Serialize;
use std::fmt::Display;
use std::path::Path;

pub use crate::spreadsheet::sheet::SheetRows;

/// Read-only facts about an opened workbook.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkbookInfo {
    pub sheet_names: Vec<String>,
    /// Index of the sheet selected in the workbook view
    pub active_sheet: usize,
    /// Declared extent of each sheet, in `sheet_names` order
    pub dimensions: Vec<SheetDimensions>,
}

impl WorkbookInfo {
    /// Resolves a sheet selector to an index. On a name miss the closest existing name
    /// (by edit distance) is offered as a suggestion.
    pub fn resolve(&self, sheet: &SheetRef) -> Result<usize, IngestError> {
        match sheet {
            SheetRef::Active => Ok(self.active_sheet.min(self.sheet_names.len().saturating_sub(1))),
            SheetRef::Index(index) if *index < self.sheet_names.len() => Ok(*index),
            SheetRef::Name(name) => {
                if let Some(index) = self.sheet_names.iter().position(|sheet| sheet == name) {
                    return Ok(index);
                }
                if let Some(index) = self.sheet_names.iter().position(|sheet| sheet.eq_ignore_ascii_case(name)) {
                    return Ok(index);
                }
                // A purely numeric selector that is not a sheet name addresses by position
                match name.trim().parse::<usize>() {
                    Ok(index) if index < self.sheet_names.len() => Ok(index),
                    _ => Err(self.not_found(name)),
                }
            }
            SheetRef::Index(index) => Err(self.not_found(&index.to_string())),
        }
    }

    pub fn dimensions_of(&self, sheet: usize) -> SheetDimensions {
        self.dimensions.get(sheet).copied().unwrap_or_default()
    }

    fn not_found(&self, requested: &str) -> IngestError {
        let requested_lower = requested.to_lowercase();
        let suggestion = self
            .sheet_names
            .iter()
            .map(|name| (strsim::levenshtein(&requested_lower, &name.to_lowercase()), name))
            .filter(|(distance, name)| *distance <= name.chars().count().max(requested.chars().count()) / 2 + 1)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, name)| name.to_owned());
        IngestError::SheetNotFound {
            requested: requested.to_owned(),
            available: self.sheet_names.clone(),
            suggestion,
        }
    }
}

/// Sheet selector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SheetRef {
    /// The workbook's active sheet
    #[default]
    Active,
    Name(String),
    /// 0-based position
    Index(usize),
}

impl Display for SheetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SheetRef::Active => write!(f, "(active)"),
            SheetRef::Name(name) => write!(f, "{name}"),
            SheetRef::Index(index) => write!(f, "#{index}"),
        }
    }
}

/// The cells a sheet read produces: a bounded rectangle, plus positions outside it whose
/// values should be captured (anchors of merged regions that reach into the window).
#[derive(Clone, Debug, PartialEq)]
pub struct ReadWindow {
    pub range: RangeInfo,
    pub capture: Vec<(usize, usize)>,
}

impl ReadWindow {
    pub fn new(range: RangeInfo) -> ReadWindow {
        ReadWindow { range, capture: Vec::new() }
    }

    /// Adds the anchors of `regions` that lie outside the window while the region overlaps it.
    pub fn capturing_anchors(mut self, regions: &[MergedRegion]) -> ReadWindow {
        for region in regions {
            if region.intersects(&self.range) && !self.range.contains(region.min_row, region.min_col) {
                self.capture.push((region.min_row, region.min_col));
            }
        }
        self
    }

    pub(crate) fn wants(&self, row: usize, col: usize) -> bool {
        self.range.contains(row, col) || self.capture.contains(&(row, col))
    }

    /// The last row any requested cell can be on.
    pub(crate) fn last_row(&self) -> usize {
        self.capture
            .iter()
            .map(|(row, _)| *row)
            .fold(self.range.end_row, usize::max)
    }
}

/// A row of the read window. `cells` is dense over the window's columns.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    /// 0-based absolute sheet row
    pub index: usize,
    pub cells: Vec<CellValue>,
}

impl Row {
    pub fn empty(index: usize, width: usize) -> Row {
        Row { index, cells: vec![CellValue::Empty; width] }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(CellValue::is_empty)
    }
}

/// Uniform access to an opened workbook. The container is released when the value is dropped.
pub trait Workbook: Send {
    fn info(&self) -> &WorkbookInfo;

    /// Starts a lazy, single-pass read of `sheet` restricted to `window`.
    fn read_sheet(&mut self, sheet: usize, window: &ReadWindow) -> Result<SheetRows<'_>, IngestError>;

    /// All merged rectangles of `sheet`, in document order.
    fn merged_regions(&mut self, sheet: usize) -> Result<Vec<MergedRegion>, IngestError>;
}

/// Container families recognized by their leading bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Zip,
    Cfb,
    Unknown,
}

impl ContainerKind {
    pub(crate) fn sniff(head: &[u8]) -> ContainerKind {
        if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
            ContainerKind::Zip
        } else if Cfb::is_cfb(head) {
            ContainerKind::Cfb
        } else {
            ContainerKind::Unknown
        }
    }

    /// The container an extension promises, if the extension is a known spreadsheet one.
    pub(crate) fn expected_for(path: &Path) -> Option<ContainerKind> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "xlsx" | "xlsm" | "xltx" | "xltm" | "xlam" | "xlsb" => Some(ContainerKind::Zip),
            "xls" | "xla" | "xlt" => Some(ContainerKind::Cfb),
            _ => None,
        }
    }
}

/// Opens a workbook, choosing the reader from the file content rather than its extension.
pub fn open_workbook(path: &Path) -> Result<Box<dyn Workbook>, IngestError> {
    let mut reader = UnifiedReader::open(path)?;
    let unreadable = |reason: &str| IngestError::UnreadableFile {
        path: path.display().to_string(),
        reason: reason.to_owned(),
    };
    match ContainerKind::sniff(&reader.head(8)?) {
        ContainerKind::Zip => Ok(Box::new(xlsx::XlsxWorkbook::open(path, reader)?)),
        ContainerKind::Cfb => {
            let cfb = Cfb::new(&mut reader).map_err(|error| unreadable(&error.to_string()))?;
            if cfb.exists("EncryptedPackage") {
                return Err(unreadable("the workbook is encrypted (password protected)"));
            }
            open_legacy(path, cfb)
        }
        ContainerKind::Unknown => Err(unreadable("not a spreadsheet container")),
    }
}

#[cfg(feature = "legacy")]
fn open_legacy(path: &Path, cfb: Cfb) -> Result<Box<dyn Workbook>, IngestError> {
    Ok(Box::new(xls::XlsWorkbook::open(path, cfb)?))
}

#[cfg(not(feature = "legacy"))]
fn open_legacy(path: &Path, _cfb: Cfb) -> Result<Box<dyn Workbook>, IngestError> {
    Err(IngestError::UnreadableFile {
        path: path.display().to_string(),
        reason: "legacy .xls workbooks require the `legacy` feature".to_owned(),
    })
}
