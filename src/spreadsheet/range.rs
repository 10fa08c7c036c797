use crate::error::IngestError;
use crate::spreadsheet::reference::col_to_index;
use crate::spreadsheet::reference::index_to_col;
use crate::spreadsheet::reference::index_to_reference;
use crate::spreadsheet::reference::row_to_index;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

/// Extent of a sheet as row and column counts. `(0, 0)` is an empty sheet.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetDimensions {
    pub rows: usize,
    pub cols: usize,
}

impl SheetDimensions {
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// The whole sheet as a range, `None` when empty.
    pub fn full_range(&self) -> Option<RangeInfo> {
        (!self.is_empty()).then(|| RangeInfo::new(0, self.rows - 1, 0, self.cols - 1))
    }
}

impl Display for SheetDimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.full_range() {
            Some(range) => write!(f, "{range}"),
            None => write!(f, "nothing (empty sheet)"),
        }
    }
}

/// A rectangular, 0-based, inclusive cell range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeInfo {
    pub start_row: usize,
    pub end_row: usize,
    pub start_col: usize,
    pub end_col: usize,
    pub sheet_name: Option<String>,
    /// Parsed from a column-only spec such as `A:C`; rows are open until [`RangeInfo::bind`]
    pub whole_columns: bool,
}

/// Outcome of parsing a range spec: the normalized range and a warning when it had to be reordered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedRange {
    pub range: RangeInfo,
    pub warning: Option<String>,
}

impl RangeInfo {
    pub fn new(start_row: usize, end_row: usize, start_col: usize, end_col: usize) -> RangeInfo {
        RangeInfo {
            start_row: start_row.min(end_row),
            end_row: start_row.max(end_row),
            start_col: start_col.min(end_col),
            end_col: start_col.max(end_col),
            sheet_name: None,
            whole_columns: false,
        }
    }

    /// Parses `A1:C10`, `B2` or `A:C` (case-insensitive, surrounding whitespace ignored).
    pub fn parse(spec: &str) -> Result<ParsedRange, IngestError> {
        let malformed = |reason: &str| IngestError::MalformedRange {
            spec: spec.to_owned(),
            reason: reason.to_owned(),
        };
        let value = spec.trim();
        if value.is_empty() {
            return Err(malformed("range is empty"));
        }
        if let Some(character) = value.chars().find(|c| !c.is_ascii_alphanumeric() && *c != ':') {
            return Err(malformed(&format!("unexpected character '{character}'")));
        }

        let pattern = Regex::new(r"^([A-Za-z]+)(\d*)(?::([A-Za-z]+)(\d*))?$").expect("Hardcode regex pattern");
        let captures = pattern
            .captures(value)
            .ok_or_else(|| malformed("expected '<cell>:<cell>', '<cell>' or '<col>:<col>'"))?;
        let text = |index: usize| captures.get(index).map(|matcher| matcher.as_str()).unwrap_or("");
        let col = |letters: &str| col_to_index(letters).ok_or_else(|| malformed(&format!("column '{letters}' is out of range")));
        let row = |digits: &str| row_to_index(digits).ok_or_else(|| malformed(&format!("row '{digits}' is not a positive row number")));

        let (start_col, start_row) = (text(1), text(2));
        let (end_col, end_row) = (text(3), text(4));
        let has_end = captures.get(3).is_some();
        let (range, reordered) = match (has_end, start_row.is_empty(), end_row.is_empty()) {
            (false, false, _) => {
                let (row, col) = (row(start_row)?, col(start_col)?);
                (RangeInfo::new(row, row, col, col), false)
            }
            (true, false, false) => {
                let (top, left) = (row(start_row)?, col(start_col)?);
                let (bottom, right) = (row(end_row)?, col(end_col)?);
                (RangeInfo::new(top, bottom, left, right), top > bottom || left > right)
            }
            (true, true, true) => {
                let (left, right) = (col(start_col)?, col(end_col)?);
                let mut range = RangeInfo::new(0, 0, left, right);
                range.whole_columns = true;
                (range, left > right)
            }
            (false, true, _) => return Err(malformed("a single column is not a range, use '<col>:<col>'")),
            _ => return Err(malformed("cannot mix a cell with a whole column")),
        };

        let warning = reordered.then(|| format!("range '{spec}' was reversed and has been normalized to '{range}'"));
        Ok(ParsedRange { range, warning })
    }

    pub fn with_sheet(mut self, sheet_name: &str) -> RangeInfo {
        self.sheet_name = Some(sheet_name.to_owned());
        self
    }

    /// Closes a whole-column range at the sheet's last row. Bounded ranges are returned as is.
    pub fn bind(&self, dimensions: SheetDimensions) -> RangeInfo {
        let mut range = self.clone();
        if self.whole_columns {
            range.start_row = 0;
            range.end_row = dimensions.rows.saturating_sub(1);
            range.whole_columns = false;
        }
        range
    }

    /// Fails with `RangeOutOfBounds` if any bound lies outside the sheet. Never clips.
    pub fn validate(&self, dimensions: SheetDimensions, sheet: &str) -> Result<(), IngestError> {
        let range = self.bind(dimensions);
        if !dimensions.is_empty() && range.end_row < dimensions.rows && range.end_col < dimensions.cols {
            return Ok(());
        }
        let suggestion = range
            .intersect(dimensions)
            .or_else(|| dimensions.full_range())
            .map(|range| range.to_string());
        Err(IngestError::RangeOutOfBounds {
            range: self.to_string(),
            sheet: sheet.to_owned(),
            bounds: dimensions.to_string(),
            suggestion,
        })
    }

    /// The part of this range that lies inside the sheet.
    pub fn intersect(&self, dimensions: SheetDimensions) -> Option<RangeInfo> {
        let range = self.bind(dimensions);
        if dimensions.is_empty() || range.start_row >= dimensions.rows || range.start_col >= dimensions.cols {
            return None;
        }
        Some(RangeInfo {
            end_row: range.end_row.min(dimensions.rows - 1),
            end_col: range.end_col.min(dimensions.cols - 1),
            ..range
        })
    }

    pub fn rows(&self) -> usize {
        self.end_row - self.start_row + 1
    }

    pub fn cols(&self) -> usize {
        self.end_col - self.start_col + 1
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.contains_row(row) && self.contains_col(col)
    }

    pub fn contains_row(&self, row: usize) -> bool {
        self.whole_columns || (self.start_row <= row && row <= self.end_row)
    }

    pub fn contains_col(&self, col: usize) -> bool {
        self.start_col <= col && col <= self.end_col
    }
}

impl TryFrom<&str> for RangeInfo {
    type Error = IngestError;

    /// Parses a range spec, logging the reorder warning instead of returning it.
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let ParsedRange { range, warning } = RangeInfo::parse(value)?;
        if let Some(warning) = warning {
            tracing::warn!("{warning}");
        }
        Ok(range)
    }
}

impl Display for RangeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.whole_columns {
            write!(f, "{}:{}", index_to_col(self.start_col), index_to_col(self.end_col))
        } else if self.start_row == self.end_row && self.start_col == self.end_col {
            write!(f, "{}", index_to_reference(self.start_row, self.start_col))
        } else {
            write!(
                f,
                "{}:{}",
                index_to_reference(self.start_row, self.start_col),
                index_to_reference(self.end_row, self.end_col)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn parse(spec: &str) -> RangeInfo {
        RangeInfo::parse(spec).unwrap().range
    }

    #[test]
    fn cell_pair() {
        let range = parse("A1:C10");
        assert_eq!((range.start_row, range.end_row, range.start_col, range.end_col), (0, 9, 0, 2));
        assert_eq!(range.to_string(), "A1:C10");
        assert_eq!(range.rows(), 10);
        assert_eq!(range.cols(), 3);
    }

    #[test]
    fn single_cell_and_lowercase() {
        let range = parse(" b2 ");
        assert_eq!((range.start_row, range.end_row, range.start_col, range.end_col), (1, 1, 1, 1));
        assert_eq!(range.to_string(), "B2");
    }

    #[test]
    fn whole_columns_bind_to_sheet() {
        let range = parse("A:C");
        assert!(range.whole_columns);
        assert_eq!(range.to_string(), "A:C");
        let bound = range.bind(SheetDimensions { rows: 6, cols: 10 });
        assert_eq!(bound.to_string(), "A1:C6");
        assert!(!bound.whole_columns);
    }

    #[test]
    fn reversed_range_is_swapped_with_warning() {
        let parsed = RangeInfo::parse("C3:A1").unwrap();
        assert_eq!(parsed.range, parse("A1:C3"));
        assert!(parsed.warning.unwrap().contains("A1:C3"));
        assert!(RangeInfo::parse("A1:C3").unwrap().warning.is_none());

        let parsed = RangeInfo::parse("A3:C1").unwrap();
        assert_eq!(parsed.range.to_string(), "A1:C3");
        assert!(parsed.warning.is_some());
    }

    #[test]
    fn round_trip_of_normalized_ranges() {
        for spec in ["A1:C10", "B2", "A:C", "AA100:AB200", "XFD1048576"] {
            assert_eq!(parse(&parse(spec).to_string()), parse(spec), "{spec}");
        }
    }

    #[test]
    fn malformed_specs() {
        for spec in ["", "   ", "A1-C3", "A1:", ":A1", "1:10", "A", "A1:C", "A:C3", "A0", "A1:B0", "Sheet1!A1", "A1:B2:C3", "A1 :B2"] {
            let error = RangeInfo::parse(spec).unwrap_err();
            assert_eq!(error.kind(), ErrorKind::MalformedRangeError, "{spec}");
            assert!(error.to_string().contains("A1:C10"), "{spec}");
        }
    }

    #[test]
    fn validation_never_clips() {
        let dimensions = SheetDimensions { rows: 6, cols: 10 };
        assert!(parse("B2:D5").validate(dimensions, "Data").is_ok());
        assert!(parse("A:J").validate(dimensions, "Data").is_ok());

        let error = parse("B2:D8").validate(dimensions, "Data").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::RangeOutOfBoundsError);
        assert!(error.to_string().contains("A1:J6"));
        assert_eq!(error.suggestion().as_deref(), Some("try the smaller range 'B2:D6'"));

        let error = parse("A:K").validate(dimensions, "Data").unwrap_err();
        assert!(matches!(error, IngestError::RangeOutOfBounds { range, .. } if range == "A:K"));

        let error = parse("Z20").validate(dimensions, "Data").unwrap_err();
        assert!(matches!(error, IngestError::RangeOutOfBounds { suggestion: Some(ref s), .. } if s == "A1:J6"));

        let error = parse("A1").validate(SheetDimensions::default(), "Empty").unwrap_err();
        assert!(matches!(error, IngestError::RangeOutOfBounds { suggestion: None, .. }));
    }
}
