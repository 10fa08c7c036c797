use crate::error::IngestError;
use crate::error::ResultOptionChain;
use crate::helpers::biff8::Biff8Reader;
use crate::helpers::cfb::Cfb;
use crate::match_biff8_record;
use crate::spreadsheet::cell::to_error_value;
use crate::spreadsheet::cell::Cell;
use crate::spreadsheet::cell::CellType;
use crate::spreadsheet::excel::load_number_formats;
use crate::spreadsheet::merge::MergedRegion;
use crate::spreadsheet::range::SheetDimensions;
use crate::spreadsheet::sheet::CellSource;
use crate::spreadsheet::sheet::SheetRows;
use crate::spreadsheet::ReadWindow;
use crate::spreadsheet::Workbook;
use crate::spreadsheet::WorkbookInfo;
use either::Either;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use thiserror::Error;

// BIFF8 record types
const FORMULA: u16 = 6;
const EOF: u16 = 10;
const DATE1904: u16 = 34;
const FILE_PASS: u16 = 47;
const WINDOW1: u16 = 61;
const CODE_PAGE: u16 = 66;
const BOUND_SHEET8: u16 = 133;
const MUL_RK: u16 = 189;
const XF: u16 = 224;
const MERGED_CELLS: u16 = 229;
const SST: u16 = 252;
const LABEL_SST: u16 = 253;
const DIMENSIONS: u16 = 512;
const NUMBER: u16 = 515;
const LABEL: u16 = 516;
const BOOL_ERR: u16 = 517;
const STRING: u16 = 519;
const RK: u16 = 638;
const FORMAT: u16 = 1054;
const BOF: u16 = 2057;

#[derive(Error, Debug)]
pub(crate) enum XlsError {
    #[error("Invalid Code page '{0}'")]
    CodePageError(u16),

    #[error("Invalid Formula value '{0}'")]
    FormulaValueError(u64),
}

impl From<XlsError> for IngestError {
    fn from(error: XlsError) -> Self {
        IngestError::WithContext(error.to_string())
    }
}

/// A legacy Excel 97-2003 workbook held in memory.
pub(crate) struct XlsWorkbook {
    reader: Biff8Reader,
    info: WorkbookInfo,
    /// Stream offset of each worksheet's BOF record, parallel to `info.sheet_names`
    sheet_offsets: Vec<usize>,
    shared_strings: Vec<String>,
    number_formats: Vec<CellType>,
}

impl XlsWorkbook {
    /// Parses the workbook globals substream and each sheet's dimensions.
    pub(crate) fn open(path: &Path, cfb: Cfb) -> Result<XlsWorkbook, IngestError> {
        let unreadable = |reason: String| IngestError::UnreadableFile {
            path: path.display().to_string(),
            reason,
        };
        let stream = cfb
            .read("Workbook")
            .ok_none_else(|| cfb.read("Book"))?
            .ok_or_else(|| unreadable("no Workbook stream in compound file".to_owned()))?;
        Self::load(Biff8Reader::new(stream))
            .map_err(|error| if error.is_user_facing() { error } else { unreadable(error.to_string()) })
            .and_then(|workbook| match workbook {
                Some(workbook) if !workbook.info.sheet_names.is_empty() => Ok(workbook),
                Some(_) => Err(unreadable("the workbook contains no worksheets".to_owned())),
                None => Err(unreadable("the workbook is encrypted (password protected)".to_owned())),
            })
    }

    /// Returns `None` for encrypted workbooks.
    fn load(mut reader: Biff8Reader) -> Result<Option<XlsWorkbook>, IngestError> {
        let mut is_1904 = false;
        let mut is_encrypted = false;
        let mut active_tab = 0usize;
        let mut shared_strings = Vec::new();
        let mut custom_formats: HashMap<String, CellType> = HashMap::new();
        let mut format_indexes: Vec<String> = Vec::new();
        let mut sheets: Vec<(usize, String, usize)> = Vec::new();
        let mut tab = 0usize;
        match_biff8_record!(reader => {
            EOF => break,
            FILE_PASS => {
                is_encrypted = true;
                break;
            }
            DATE1904 => is_1904 = reader.read_u16()? == 1,
            WINDOW1 => {
                reader.skip(10)?;
                active_tab = reader.read_u16()? as usize;
            }
            CODE_PAGE => {
                let code_page = reader.read_u16()?;
                // 1200 marks UTF-16 text, which is handled per string
                if code_page != 1200 {
                    reader.encoding = codepage::to_encoding(code_page).ok_or(XlsError::CodePageError(code_page))?;
                }
            }
            FORMAT => {
                let id = reader.read_u16()?;
                let format = reader.read_xl_unicode_string()?;
                custom_formats.insert(id.to_string(), CellType::parse_custom_number_format(&format, is_1904));
            }
            XF => {
                reader.skip(2)?;
                format_indexes.push(reader.read_u16()?.to_string());
            }
            SST => shared_strings = load_shared_strings(&mut reader)?,
            BOUND_SHEET8 => {
                let pointer = reader.read_usize()?;
                reader.skip(1)?;
                let sheet_type = reader.read_u8()?;
                let sheet_name = reader.read_short_xl_unicode_string()?;
                // 0 = worksheet; macro sheets, chart sheets and VB modules are not readable
                if sheet_type == 0 {
                    sheets.push((tab, sheet_name, pointer));
                }
                tab += 1;
            }
        });
        if is_encrypted {
            return Ok(None);
        }

        let number_formats = load_number_formats(format_indexes, custom_formats, is_1904);
        let mut sheet_names = Vec::with_capacity(sheets.len());
        let mut sheet_offsets = Vec::with_capacity(sheets.len());
        let mut dimensions = Vec::with_capacity(sheets.len());
        let mut active_sheet = 0;
        for (position, (tab, name, pointer)) in sheets.into_iter().enumerate() {
            if tab == active_tab {
                active_sheet = position;
            }
            dimensions.push(load_dimensions(&mut reader, pointer)?);
            sheet_names.push(name);
            sheet_offsets.push(pointer);
        }

        Ok(Some(XlsWorkbook {
            reader,
            info: WorkbookInfo { sheet_names, active_sheet, dimensions },
            sheet_offsets,
            shared_strings,
            number_formats,
        }))
    }

    fn sheet_offset(&self, sheet: usize) -> Result<usize, IngestError> {
        self.sheet_offsets.get(sheet).copied().ok_or_else(|| IngestError::SheetNotFound {
            requested: sheet.to_string(),
            available: self.info.sheet_names.clone(),
            suggestion: None,
        })
    }
}

impl Workbook for XlsWorkbook {
    fn info(&self) -> &WorkbookInfo {
        &self.info
    }

    fn read_sheet(&mut self, sheet: usize, window: &ReadWindow) -> Result<SheetRows<'_>, IngestError> {
        let pointer = self.sheet_offset(sheet)?;
        self.reader.goto(pointer);
        self.reader.next()?;
        let source = XlsCells {
            reader: &mut self.reader,
            shared_strings: &self.shared_strings,
            number_formats: &self.number_formats,
            pending: VecDeque::new(),
        };
        Ok(SheetRows::new(Box::new(source), window))
    }

    fn merged_regions(&mut self, sheet: usize) -> Result<Vec<MergedRegion>, IngestError> {
        let pointer = self.sheet_offset(sheet)?;
        let reader = &mut self.reader;
        reader.goto(pointer);
        reader.next()?;
        let mut regions = Vec::new();
        match_biff8_record!(reader => {
            BOF | EOF => break,
            MERGED_CELLS => {
                let count = reader.read_u16()?;
                for _ in 0..count {
                    let first_row = reader.read_u16()? as usize;
                    let last_row = reader.read_u16()? as usize;
                    let first_col = reader.read_u16()? as usize;
                    let last_col = reader.read_u16()? as usize;
                    regions.push(MergedRegion::new(first_row, last_row, first_col, last_col));
                }
            }
        });
        Ok(regions)
    }
}

/// Streams cell records of one worksheet substream.
struct XlsCells<'a> {
    reader: &'a mut Biff8Reader,
    shared_strings: &'a [String],
    number_formats: &'a [CellType],
    /// Cells of a `MULRK` record not yet handed out
    pending: VecDeque<Cell>,
}

impl CellSource for XlsCells<'_> {
    fn next_cell(&mut self, window: &ReadWindow) -> Result<Option<Cell>, IngestError> {
        let last_row = window.last_row();
        loop {
            if let Some(cell) = self.pending.pop_front() {
                return Ok(Some(cell));
            }
            let tag = match self.reader.next()? {
                None | Some(BOF) | Some(EOF) => return Ok(None),
                Some(tag) => tag,
            };
            match tag {
                MUL_RK => {
                    let row = self.reader.read_u16()? as usize;
                    let first_col = self.reader.read_u16()? as usize;
                    let last_col = self.reader.get_u16_back(2)? as usize;
                    if row > last_row {
                        return Ok(None);
                    }
                    for col in first_col..=last_col {
                        let index = self.reader.read_u16()? as usize;
                        let value = self.reader.read_rk_number()?;
                        if window.wants(row, col) {
                            let value = self.kind_of(Either::Right(index)).decode(&value, self.shared_strings);
                            self.pending.push_back(Cell { row, col, value });
                        }
                    }
                }
                BOOL_ERR | NUMBER | RK | LABEL_SST | LABEL | FORMULA => {
                    let row = self.reader.read_u16()? as usize;
                    let col = self.reader.read_u16()? as usize;
                    if row > last_row {
                        return Ok(None);
                    }
                    if !window.wants(row, col) {
                        continue;
                    }
                    let (either, value) = match tag {
                        BOOL_ERR => read_bool_or_error_cell(self.reader)?,
                        NUMBER => read_number_cell(self.reader)?,
                        RK => read_rk_cell(self.reader)?,
                        LABEL_SST => read_label_sst_cell(self.reader)?,
                        LABEL => read_label_cell(self.reader)?,
                        _ => read_formula_cell(self.reader)?,
                    };
                    if !value.is_empty() {
                        let value = self.kind_of(either).decode(&value, self.shared_strings);
                        return Ok(Some(Cell { row, col, value }));
                    }
                }
                _ => (),
            }
        }
    }
}

impl XlsCells<'_> {
    fn kind_of(&self, either: Either<CellType, usize>) -> CellType {
        match either {
            Either::Left(kind) => kind,
            Either::Right(index) => self.number_formats.get(index).copied().unwrap_or(CellType::Number),
        }
    }
}

/// Declared extent from the sheet's `DIMENSIONS` record, or the bounding box of its cell records.
fn load_dimensions(reader: &mut Biff8Reader, pointer: usize) -> Result<SheetDimensions, IngestError> {
    reader.goto(pointer);
    reader.next()?;
    let mut rows = 0usize;
    let mut cols = 0usize;
    match_biff8_record!(reader => {
        BOF | EOF => break,
        DIMENSIONS => {
            reader.skip(4)?;
            let last_row = reader.read_usize()?;
            reader.skip(2)?;
            let last_col = reader.read_u16()? as usize;
            return Ok(SheetDimensions { rows: last_row, cols: last_col });
        }
        MUL_RK => {
            let row = reader.read_u16()? as usize;
            let last_col = reader.get_u16_back(2)? as usize;
            rows = rows.max(row + 1);
            cols = cols.max(last_col + 1);
        }
        BOOL_ERR | NUMBER | RK | LABEL_SST | LABEL | FORMULA => {
            let row = reader.read_u16()? as usize;
            let col = reader.read_u16()? as usize;
            rows = rows.max(row + 1);
            cols = cols.max(col + 1);
        }
    });
    Ok(SheetDimensions { rows, cols })
}

fn load_shared_strings(reader: &mut Biff8Reader) -> Result<Vec<String>, IngestError> {
    reader.skip(4)?;
    let count = reader.read_usize()?;
    let mut shared_strings = Vec::with_capacity(count.min(65_536));
    for _ in 0..count {
        shared_strings.push(reader.read_xl_unicode_rich_extended_string()?);
    }
    Ok(shared_strings)
}

fn read_bool_or_error_cell(reader: &mut Biff8Reader) -> Result<(Either<CellType, usize>, String), IngestError> {
    reader.skip(2)?;
    let value = reader.read_u8()?;
    let flag = reader.read_u8()?;
    if flag == 0 {
        Ok((Either::Left(CellType::Boolean), value.to_string()))
    } else {
        Ok((Either::Left(CellType::Error), to_error_value(value).to_owned()))
    }
}

fn read_number_cell(reader: &mut Biff8Reader) -> Result<(Either<CellType, usize>, String), IngestError> {
    let index = reader.read_u16()? as usize;
    let value = reader.read_f64()?;
    Ok((Either::Right(index), value.to_string()))
}

fn read_rk_cell(reader: &mut Biff8Reader) -> Result<(Either<CellType, usize>, String), IngestError> {
    let index = reader.read_u16()? as usize;
    let value = reader.read_rk_number()?;
    Ok((Either::Right(index), value))
}

fn read_label_sst_cell(reader: &mut Biff8Reader) -> Result<(Either<CellType, usize>, String), IngestError> {
    reader.skip(2)?;
    let value = reader.read_usize()?;
    Ok((Either::Left(CellType::SharedString), value.to_string()))
}

fn read_label_cell(reader: &mut Biff8Reader) -> Result<(Either<CellType, usize>, String), IngestError> {
    reader.skip(2)?;
    let value = reader.read_xl_unicode_string()?;
    Ok((Either::Left(CellType::InlineString), value))
}

/// Decodes the cached result of a formula. String results live in the following `STRING` record.
fn read_formula_cell(reader: &mut Biff8Reader) -> Result<(Either<CellType, usize>, String), IngestError> {
    let index = reader.read_u16()? as usize;
    let formula = reader.read_u64()?;
    let is_number = (formula & 0xFFFF000000000000) != 0xFFFF000000000000;
    let flag = formula & 0xFF;
    if is_number {
        return Ok((Either::Right(index), f64::from_bits(formula).to_string()));
    }
    match flag {
        0 => match reader.next()? {
            Some(STRING) => Ok((Either::Left(CellType::InlineString), reader.read_xl_unicode_string()?)),
            _ => Err(XlsError::FormulaValueError(formula).into()),
        },
        1 => {
            let value = if (formula & 0xFF0000) > 0 { "1" } else { "0" };
            Ok((Either::Left(CellType::Boolean), value.to_owned()))
        }
        2 => {
            let code = ((formula >> 16) & 0xFF) as u8;
            Ok((Either::Left(CellType::Error), to_error_value(code).to_owned()))
        }
        3 => Ok((Either::Left(CellType::InlineString), String::new())),
        _ => Err(XlsError::FormulaValueError(formula).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::biff8::tests::record;
    use crate::helpers::cfb;
    use crate::spreadsheet::cell::CellValue;
    use crate::spreadsheet::range::RangeInfo;
    use crate::spreadsheet::Row;
    use std::io::Cursor;

    fn cell_header(row: u16, col: u16, xf: u16) -> Vec<u8> {
        [row.to_le_bytes(), col.to_le_bytes(), xf.to_le_bytes()].concat()
    }

    /// A one-sheet workbook stream: globals with one SST entry, then a sheet with a
    /// label, a number, an RK integer and a 2x2 merge.
    fn workbook_stream() -> Vec<u8> {
        let bof = [0x00, 0x06, 0x05, 0x00, 0, 0, 0, 0];
        let mut globals = record(BOF, &bof);
        let mut sst = vec![1, 0, 0, 0, 1, 0, 0, 0, 4, 0, 0];
        sst.extend_from_slice(b"Name");
        globals.extend(record(SST, &sst));
        let mut bound = Vec::new();
        bound.extend_from_slice(&0u32.to_le_bytes());
        bound.extend_from_slice(&[0, 0, 5, 0]);
        bound.extend_from_slice(b"Sheet");
        let bound_index = globals.len();
        globals.extend(record(BOUND_SHEET8, &bound));
        globals.extend(record(EOF, &[]));

        let sheet_offset = globals.len() as u32;
        globals[bound_index + 4..bound_index + 8].copy_from_slice(&sheet_offset.to_le_bytes());

        let mut sheet = record(BOF, &bof);
        let dimensions = [0u32.to_le_bytes(), 3u32.to_le_bytes()].concat();
        let dimensions = [dimensions, vec![0, 0, 2, 0, 0, 0]].concat();
        sheet.extend(record(DIMENSIONS, &dimensions));
        sheet.extend(record(LABEL_SST, &[cell_header(0, 0, 0), 0u32.to_le_bytes().to_vec()].concat()));
        sheet.extend(record(NUMBER, &[cell_header(1, 1, 0), 2.5f64.to_le_bytes().to_vec()].concat()));
        sheet.extend(record(RK, &[cell_header(2, 0, 0), ((7u32 << 2) | 0x02).to_le_bytes().to_vec()].concat()));
        let merge = [1u16.to_le_bytes(), 1u16.to_le_bytes(), 2u16.to_le_bytes(), 0u16.to_le_bytes(), 1u16.to_le_bytes()].concat();
        sheet.extend(record(MERGED_CELLS, &merge));
        sheet.extend(record(EOF, &[]));

        globals.extend(sheet);
        globals
    }

    #[test]
    fn reads_legacy_sheet() -> Result<(), IngestError> {
        let bytes = cfb::tests::build("Workbook", &workbook_stream(), &[]);
        let cfb = Cfb::new(&mut Cursor::new(bytes))?;
        let mut workbook = XlsWorkbook::open(Path::new("legacy.xls"), cfb)?;

        assert_eq!(workbook.info().sheet_names, vec!["Sheet".to_owned()]);
        assert_eq!(workbook.info().dimensions[0], SheetDimensions { rows: 3, cols: 2 });
        assert_eq!(workbook.merged_regions(0)?, vec![MergedRegion::new(1, 2, 0, 1)]);

        let window = ReadWindow::new(RangeInfo::new(0, 2, 0, 1));
        let rows: Vec<Row> = workbook.read_sheet(0, &window)?.collect::<Result<_, _>>()?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].cells, vec![CellValue::String("Name".to_owned()), CellValue::Empty]);
        assert_eq!(rows[1].cells, vec![CellValue::Empty, CellValue::Float(2.5)]);
        assert_eq!(rows[2].cells, vec![CellValue::Int(7), CellValue::Empty]);
        Ok(())
    }
}
