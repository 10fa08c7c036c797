use crate::error::IngestError;
use crate::spreadsheet::cell::Cell;
use crate::spreadsheet::cell::CellValue;
use crate::spreadsheet::ReadWindow;
use crate::spreadsheet::Row;
use std::collections::HashMap;
use std::collections::VecDeque;

/// A format-specific producer of decoded cells in row-major document order.
pub(crate) trait CellSource {
    /// Next non-empty cell with `row <= last_row`, or `None` once the sheet is exhausted.
    fn next_cell(&mut self, window: &ReadWindow) -> Result<Option<Cell>, IngestError>;
}

/// Lazy, finite, single-pass iterator of dense rows over a [`ReadWindow`].
///
/// Rows between the window's first and last row are always yielded, gap rows as empty rows.
/// Values at the window's capture positions are kept aside and available through
/// [`SheetRows::captured`] once the read has passed them.
pub struct SheetRows<'a> {
    source: Box<dyn CellSource + 'a>,
    window: ReadWindow,
    /// Row currently being filled
    current: Option<Row>,
    /// Next row index that has not been queued yet
    next_row: usize,
    ready: VecDeque<Row>,
    captured: HashMap<(usize, usize), CellValue>,
    finished: bool,
}

impl<'a> SheetRows<'a> {
    pub(crate) fn new(source: Box<dyn CellSource + 'a>, window: &ReadWindow) -> SheetRows<'a> {
        SheetRows {
            source,
            window: window.clone(),
            current: None,
            next_row: window.range.start_row,
            ready: VecDeque::new(),
            captured: HashMap::new(),
            finished: false,
        }
    }

    pub fn captured(&self) -> &HashMap<(usize, usize), CellValue> {
        &self.captured
    }

    fn width(&self) -> usize {
        self.window.range.cols()
    }

    fn accept(&mut self, cell: Cell) {
        if self.window.capture.contains(&(cell.row, cell.col)) {
            self.captured.insert((cell.row, cell.col), cell.value.clone());
        }
        let range = &self.window.range;
        if !range.contains(cell.row, cell.col) {
            return;
        }
        let start_col = range.start_col;
        if self.current.as_ref().map(|row| row.index != cell.row).unwrap_or(true) {
            if cell.row < self.next_row {
                tracing::debug!("Ignoring out-of-order cell at row {} col {}", cell.row, cell.col);
                return;
            }
            self.flush_until(cell.row);
            self.current = Some(Row::empty(cell.row, self.width()));
            self.next_row = cell.row + 1;
        }
        if let Some(row) = self.current.as_mut() {
            row.cells[cell.col - start_col] = cell.value;
        }
    }

    /// Queues the current row and empty rows for every index before `row`.
    fn flush_until(&mut self, row: usize) {
        if let Some(current) = self.current.take() {
            self.ready.push_back(current);
        }
        let width = self.width();
        while self.next_row < row {
            self.ready.push_back(Row::empty(self.next_row, width));
            self.next_row += 1;
        }
    }

    fn finish(&mut self) {
        let end = self.window.range.end_row.saturating_add(1);
        self.flush_until(end);
        self.finished = true;
    }
}

impl Iterator for SheetRows<'_> {
    type Item = Result<Row, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.ready.pop_front() {
                return Some(Ok(row));
            }
            if self.finished {
                return None;
            }
            match self.source.next_cell(&self.window) {
                Ok(Some(cell)) if cell.row > self.window.last_row() => self.finish(),
                Ok(Some(cell)) => self.accept(cell),
                Ok(None) => self.finish(),
                Err(error) => {
                    self.finished = true;
                    self.current = None;
                    return Some(Err(error));
                }
            }
        }
    }
}
