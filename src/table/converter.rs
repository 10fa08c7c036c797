use crate::spreadsheet::cell::CellValue;
use crate::spreadsheet::merge::MergeMode;
use crate::spreadsheet::merge::MergeSummary;
use crate::spreadsheet::reference::index_to_reference;
use crate::spreadsheet::Row;
use crate::table::header::HeaderDetectionResult;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// Converted cell data: keyed records when a header was accepted, a plain matrix otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableData {
    Records(Vec<IndexMap<String, CellValue>>),
    Matrix(Vec<Vec<CellValue>>),
}

impl TableData {
    pub fn len(&self) -> usize {
        match self {
            TableData::Records(records) => records.len(),
            TableData::Matrix(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub data: TableData,
    pub headers: Option<Vec<String>>,
    pub row_count: usize,
    pub col_count: usize,
    pub warnings: Vec<String>,
    /// Columns whose header cell was blank and got a generated name; every matrix column
    #[serde(default)]
    pub generated_columns: Vec<bool>,
}

impl ConversionResult {
    /// JSON rendering for result envelopes: records become objects, the matrix an array of arrays.
    pub fn data_json(&self) -> serde_json::Value {
        match &self.data {
            TableData::Records(records) => records
                .iter()
                .map(|record| {
                    record
                        .iter()
                        .map(|(name, value)| (name.clone(), value.to_json()))
                        .collect::<serde_json::Map<_, _>>()
                        .into()
                })
                .collect::<Vec<serde_json::Value>>()
                .into(),
            TableData::Matrix(rows) => rows
                .iter()
                .map(|row| row.iter().map(CellValue::to_json).collect::<Vec<_>>().into())
                .collect::<Vec<serde_json::Value>>()
                .into(),
        }
    }

    /// Drops fully-empty leading and trailing rows, and fully-empty outer columns.
    /// A named column is kept even when all its values are empty.
    pub fn trim_empty_edges(&mut self) {
        let generated = std::mem::take(&mut self.generated_columns);
        let is_generated = |col: usize| generated.get(col).copied().unwrap_or(true);
        match &mut self.data {
            TableData::Records(records) => {
                trim_rows(records, |record| record.values().all(CellValue::is_empty));
                let names = self.headers.take().unwrap_or_default();
                let (first, last) = column_span(names.len(), |col| {
                    is_generated(col)
                        && records
                            .iter()
                            .all(|record| record.get(&names[col]).map(CellValue::is_empty).unwrap_or(true))
                });
                let kept = &names[first..last];
                for record in records.iter_mut() {
                    record.retain(|name, _| kept.contains(name));
                }
                self.headers = Some(kept.to_vec());
                self.generated_columns = generated.get(first..last).map(<[bool]>::to_vec).unwrap_or_else(|| vec![true; last - first]);
            }
            TableData::Matrix(rows) => {
                trim_rows(rows, |row| row.iter().all(CellValue::is_empty));
                let width = rows.iter().map(Vec::len).max().unwrap_or(0);
                let (first, last) = column_span(width, |col| {
                    is_generated(col) && rows.iter().all(|row| row.get(col).map(CellValue::is_empty).unwrap_or(true))
                });
                for row in rows.iter_mut() {
                    row.truncate(last);
                    row.drain(..first.min(row.len()));
                }
                self.generated_columns = vec![true; last - first];
            }
        }
        self.row_count = self.data.len();
        self.col_count = match &self.data {
            TableData::Records(_) => self.headers.as_ref().map(Vec::len).unwrap_or(0),
            TableData::Matrix(rows) => rows.iter().map(Vec::len).max().unwrap_or(0),
        };
    }
}

fn trim_rows<T>(rows: &mut Vec<T>, is_empty: impl Fn(&T) -> bool) {
    while rows.last().map(&is_empty).unwrap_or(false) {
        rows.pop();
    }
    let leading = rows.iter().take_while(|row| is_empty(*row)).count();
    rows.drain(..leading);
}

/// `[first, last)` of the columns that are not blank outer columns.
fn column_span(width: usize, mut is_blank: impl FnMut(usize) -> bool) -> (usize, usize) {
    let mut last = width;
    while last > 0 && is_blank(last - 1) {
        last -= 1;
    }
    let mut first = 0;
    while first < last && is_blank(first) {
        first += 1;
    }
    (first, last)
}

/// Turns resolved rows into a [`ConversionResult`].
#[derive(Copy, Clone, Debug, Default)]
pub struct DataConverter {
    /// Absolute sheet column of the first cell of each row
    start_col: usize,
}

impl DataConverter {
    pub fn new(start_col: usize) -> DataConverter {
        DataConverter { start_col }
    }

    /// Converts data rows (header row already removed). Native values pass through, empty cells
    /// become `""` and error cells become their text with a warning naming the cell.
    pub fn convert(&self, rows: Vec<Row>, header: &HeaderDetectionResult, merge: Option<&MergeSummary>) -> ConversionResult {
        let mut warnings = Vec::new();
        if let Some(summary) = merge {
            if summary.mode == MergeMode::Skip && summary.rows_skipped > 0 {
                warnings.push(format!("{} row(s) intersecting merged cells were skipped", summary.rows_skipped));
            }
        }

        let rows: Vec<Vec<CellValue>> = rows.into_iter().map(|row| self.convert_row(row, &mut warnings)).collect();
        let row_count = rows.len();
        if header.has_header {
            let names = header.normalized_names.clone();
            let records = rows
                .into_iter()
                .map(|cells| {
                    let mut cells = cells.into_iter();
                    names
                        .iter()
                        .map(|name| (name.clone(), cells.next().unwrap_or_else(|| CellValue::String(String::new()))))
                        .collect::<IndexMap<_, _>>()
                })
                .collect();
            let generated_columns = (0..names.len())
                .map(|position| header.generated_names.get(position).copied().unwrap_or(false))
                .collect();
            ConversionResult {
                data: TableData::Records(records),
                col_count: names.len(),
                headers: Some(names),
                row_count,
                warnings,
                generated_columns,
            }
        } else {
            let col_count = rows.iter().map(Vec::len).max().unwrap_or(0);
            ConversionResult {
                data: TableData::Matrix(rows),
                headers: None,
                row_count,
                col_count,
                warnings,
                generated_columns: vec![true; col_count],
            }
        }
    }

    fn convert_row(&self, row: Row, warnings: &mut Vec<String>) -> Vec<CellValue> {
        let index = row.index;
        row.cells
            .into_iter()
            .enumerate()
            .map(|(position, cell)| match cell {
                CellValue::Empty => CellValue::String(String::new()),
                CellValue::Error(text) => {
                    let reference = index_to_reference(index, self.start_col + position);
                    warnings.push(format!("cell {reference} holds the error value {text}"));
                    CellValue::String(text)
                }
                cell => cell,
            })
            .collect()
    }
}
