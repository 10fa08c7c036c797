use crate::spreadsheet::cell::CellValue;
use crate::spreadsheet::range::RangeInfo;
use crate::spreadsheet::Row;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

/// A merged rectangle, 0-based and inclusive. The top-left cell is the anchor that holds the value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergedRegion {
    pub min_row: usize,
    pub max_row: usize,
    pub min_col: usize,
    pub max_col: usize,
}

impl MergedRegion {
    pub fn new(min_row: usize, max_row: usize, min_col: usize, max_col: usize) -> MergedRegion {
        MergedRegion {
            min_row: min_row.min(max_row),
            max_row: min_row.max(max_row),
            min_col: min_col.min(max_col),
            max_col: min_col.max(max_col),
        }
    }

    pub fn anchor(&self) -> (usize, usize) {
        (self.min_row, self.min_col)
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.contains_row(row) && self.min_col <= col && col <= self.max_col
    }

    pub fn contains_row(&self, row: usize) -> bool {
        self.min_row <= row && row <= self.max_row
    }

    pub fn intersects(&self, range: &RangeInfo) -> bool {
        let rows = range.whole_columns || (self.min_row <= range.end_row && range.start_row <= self.max_row);
        rows && self.min_col <= range.end_col && range.start_col <= self.max_col
    }

    /// Intersects the column span `[start_col, end_col]`.
    pub fn overlaps_cols(&self, start_col: usize, end_col: usize) -> bool {
        self.min_col <= end_col && start_col <= self.max_col
    }
}

impl From<&RangeInfo> for MergedRegion {
    fn from(range: &RangeInfo) -> Self {
        MergedRegion::new(range.start_row, range.end_row, range.start_col, range.end_col)
    }
}

/// How covered cells of a merged region are materialized.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Every covered cell receives the anchor value
    #[default]
    Expand,
    /// The anchor keeps its value, covered cells are empty
    First,
    /// Rows intersecting a merged region are omitted
    Skip,
}

impl FromStr for MergeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "expand" => Ok(MergeMode::Expand),
            "first" => Ok(MergeMode::First),
            "skip" => Ok(MergeMode::Skip),
            other => Err(format!("expected 'expand', 'first' or 'skip', got '{other}'")),
        }
    }
}

impl Display for MergeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MergeMode::Expand => "expand",
            MergeMode::First => "first",
            MergeMode::Skip => "skip",
        };
        write!(f, "{name}")
    }
}

/// What a merge pass did, reported in result metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub mode: MergeMode,
    /// Regions that overlap the read window
    pub regions: usize,
    pub cells_filled: usize,
    pub cells_cleared: usize,
    pub rows_skipped: usize,
}

/// Applies a [`MergeMode`] to rows produced from a window starting at `start_col`.
pub struct MergeCellResolver<'a> {
    regions: Vec<&'a MergedRegion>,
    mode: MergeMode,
    start_col: usize,
    end_col: usize,
    anchors: HashMap<(usize, usize), CellValue>,
}

impl<'a> MergeCellResolver<'a> {
    /// Keeps the regions that overlap `window` and records their anchor values from `rows`
    /// (every row read, before skipping) and from values captured outside the window.
    pub fn new(
        regions: &'a [MergedRegion],
        mode: MergeMode,
        window: &RangeInfo,
        rows: &[Row],
        captured: &HashMap<(usize, usize), CellValue>,
    ) -> MergeCellResolver<'a> {
        let regions: Vec<&MergedRegion> = regions.iter().filter(|region| region.intersects(window)).collect();
        let mut anchors = HashMap::new();
        for region in &regions {
            let (row, col) = region.anchor();
            let value = if window.contains_col(col) {
                rows.iter()
                    .find(|candidate| candidate.index == row)
                    .and_then(|candidate| candidate.cells.get(col - window.start_col))
                    .cloned()
            } else {
                None
            };
            let value = value.or_else(|| captured.get(&(row, col)).cloned()).unwrap_or_default();
            anchors.insert((row, col), value);
        }
        MergeCellResolver {
            regions,
            mode,
            start_col: window.start_col,
            end_col: window.end_col,
            anchors,
        }
    }

    /// Rewrites data rows according to the mode.
    pub fn apply(&self, rows: Vec<Row>) -> (Vec<Row>, MergeSummary) {
        let mut summary = MergeSummary {
            mode: self.mode,
            regions: self.regions.len(),
            ..MergeSummary::default()
        };
        let rows = match self.mode {
            MergeMode::Skip => {
                let before = rows.len();
                let kept: Vec<Row> = rows
                    .into_iter()
                    .filter(|row| {
                        !self.regions.iter().any(|region| {
                            region.contains_row(row.index) && region.overlaps_cols(self.start_col, self.end_col)
                        })
                    })
                    .collect();
                summary.rows_skipped = before - kept.len();
                kept
            }
            MergeMode::Expand | MergeMode::First => {
                let mut rows = rows;
                for row in rows.iter_mut() {
                    let (filled, cleared) = self.fill_row(row);
                    summary.cells_filled += filled;
                    summary.cells_cleared += cleared;
                }
                rows
            }
        };
        (rows, summary)
    }

    /// Propagates anchor values across the covered cells of a header row, leaving non-empty
    /// header cells untouched.
    pub fn fill_header(&self, header: &mut Row) -> usize {
        let mut filled = 0;
        for region in self.regions.iter().filter(|region| region.contains_row(header.index)) {
            let anchor = &self.anchors[&region.anchor()];
            for col in self.covered_cols(region) {
                let cell = &mut header.cells[col - self.start_col];
                if cell.is_empty() && !anchor.is_empty() {
                    *cell = anchor.clone();
                    filled += 1;
                }
            }
        }
        filled
    }

    fn fill_row(&self, row: &mut Row) -> (usize, usize) {
        let mut filled = 0;
        let mut cleared = 0;
        for region in self.regions.iter().filter(|region| region.contains_row(row.index)) {
            let anchor = &self.anchors[&region.anchor()];
            for col in self.covered_cols(region) {
                if (row.index, col) == region.anchor() {
                    continue;
                }
                let cell = &mut row.cells[col - self.start_col];
                match self.mode {
                    MergeMode::Expand => {
                        *cell = anchor.clone();
                        filled += 1;
                    }
                    _ => {
                        if !cell.is_empty() {
                            cleared += 1;
                        }
                        *cell = CellValue::Empty;
                    }
                }
            }
        }
        (filled, cleared)
    }

    fn covered_cols(&self, region: &MergedRegion) -> std::ops::RangeInclusive<usize> {
        region.min_col.max(self.start_col)..=region.max_col.min(self.end_col)
    }
}
