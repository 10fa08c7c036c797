use crate::error::IngestError;
use crate::helpers::reader::UnifiedReader;
use crate::helpers::xml::XmlNodeHelper;
use crate::helpers::xml::XmlReader;
use crate::helpers::xml::XmlTextContextHelper;
use crate::helpers::zip::ZipHelper;
use crate::match_xml_events;
use crate::spreadsheet::cell::Cell;
use crate::spreadsheet::cell::CellType;
use crate::spreadsheet::excel;
use crate::spreadsheet::excel::load_relationships;
use crate::spreadsheet::merge::MergedRegion;
use crate::spreadsheet::range::RangeInfo;
use crate::spreadsheet::range::SheetDimensions;
use crate::spreadsheet::reference::reference_to_index;
use crate::spreadsheet::reference::row_to_index;
use crate::spreadsheet::sheet::CellSource;
use crate::spreadsheet::sheet::SheetRows;
use crate::spreadsheet::ReadWindow;
use crate::spreadsheet::Workbook;
use crate::spreadsheet::WorkbookInfo;
use quick_xml::events::Event;
use std::collections::HashMap;
use std::io::BufRead;
use std::io::Read;
use std::io::Seek;
use std::path::Path;
use zip::ZipArchive;

// SpreadsheetML element names, matched on local name
const TAG_CUSTOM_FORMATS: &[u8] = b"numFmts";
const TAG_CUSTOM_FORMAT: &[u8] = b"numFmt";
const TAG_FORMAT_INDEXES: &[u8] = b"cellXfs";
const TAG_FORMAT_INDEX: &[u8] = b"xf";
const TAG_SHARED_STRING_ITEM: &[u8] = b"si";
const TAG_PHONETIC_TEXT: &[u8] = b"rPh";
const TAG_TEXT: &[u8] = b"t";
const TAG_WORKBOOK_PROPERTIES: &[u8] = b"workbookPr";
const TAG_WORKBOOK_VIEW: &[u8] = b"workbookView";
const TAG_SHEET: &[u8] = b"sheet";
const TAG_DIMENSION: &[u8] = b"dimension";
const TAG_SHEET_DATA: &[u8] = b"sheetData";
const TAG_ROW: &[u8] = b"row";
const TAG_CELL: &[u8] = b"c";
const TAG_INLINE_STRING: &[u8] = b"is";
const TAG_VALUE: &[u8] = b"v";
const TAG_MERGE_CELL: &[u8] = b"mergeCell";

const DEFAULT_WORKBOOK_PART: &str = "xl/workbook.xml";

/// An Office Open XML workbook (`.xlsx`, `.xlsm`, `.xltx`, `.xltm`, `.xlam`).
pub(crate) struct XlsxWorkbook {
    zip: ZipArchive<UnifiedReader>,
    info: WorkbookInfo,
    /// Package path of each worksheet, parallel to `info.sheet_names`
    sheet_paths: Vec<String>,
    number_formats: Vec<CellType>,
    shared_strings_path: String,
    /// Loaded on the first sheet read
    shared_strings: Option<Vec<String>>,
}

impl XlsxWorkbook {
    /// Opens the package and reads the workbook part, styles and every sheet's declared dimension.
    pub(crate) fn open(path: &Path, reader: UnifiedReader) -> Result<XlsxWorkbook, IngestError> {
        let unreadable = |reason: String| IngestError::UnreadableFile {
            path: path.display().to_string(),
            reason,
        };
        let mut zip = ZipArchive::new(reader).map_err(|error| unreadable(format!("corrupt package: {error}")))?;
        Self::load(&mut zip)
            .map_err(|error| if error.is_user_facing() { error } else { unreadable(error.to_string()) })
            .and_then(|(info, sheet_paths, number_formats, shared_strings_path)| {
                if info.sheet_names.is_empty() {
                    Err(unreadable("the workbook contains no worksheets".to_owned()))
                } else {
                    Ok(XlsxWorkbook {
                        zip,
                        info,
                        sheet_paths,
                        number_formats,
                        shared_strings_path,
                        shared_strings: None,
                    })
                }
            })
    }

    #[allow(clippy::type_complexity)]
    fn load(zip: &mut ZipArchive<UnifiedReader>) -> Result<(WorkbookInfo, Vec<String>, Vec<CellType>, String), IngestError> {
        let workbook_path = office_document_path(zip)?;
        if workbook_path.ends_with(".bin") || zip.file(&workbook_path)?.is_none() {
            let reason = if zip.file("xl/workbook.bin")?.is_some() || workbook_path.ends_with(".bin") {
                "binary workbooks (.xlsb) are not supported"
            } else {
                "the package has no workbook part"
            };
            return Err(IngestError::WithContext(reason.to_owned()));
        }

        let relationships = load_relationships(zip, &workbook_path)?;
        let target_of = |kind: &str, fallback: &str| {
            relationships
                .iter()
                .find(|relationship| relationship.kind == kind)
                .map(|relationship| relationship.target.to_owned())
                .unwrap_or_else(|| fallback.to_owned())
        };
        let styles_path = target_of("styles", "xl/styles.xml");
        let shared_strings_path = target_of("sharedStrings", "xl/sharedStrings.xml");
        let worksheets: HashMap<&str, &str> = relationships
            .iter()
            .filter(|relationship| relationship.kind == "worksheet")
            .map(|relationship| (relationship.id.as_str(), relationship.target.as_str()))
            .collect();

        let (sheets, active_tab, is_1904) = load_workbook(zip, &workbook_path, &worksheets)?;
        let number_formats = load_number_formats(zip, &styles_path, is_1904)?;

        let mut sheet_names = Vec::with_capacity(sheets.len());
        let mut sheet_paths = Vec::with_capacity(sheets.len());
        let mut dimensions = Vec::with_capacity(sheets.len());
        let mut active_sheet = 0;
        for (position, (tab, name, path)) in sheets.into_iter().enumerate() {
            if tab == active_tab {
                active_sheet = position;
            }
            dimensions.push(load_dimensions(zip, &path)?);
            sheet_names.push(name);
            sheet_paths.push(path);
        }

        let info = WorkbookInfo { sheet_names, active_sheet, dimensions };
        Ok((info, sheet_paths, number_formats, shared_strings_path))
    }

    fn sheet_path(&self, sheet: usize) -> Result<String, IngestError> {
        self.sheet_paths
            .get(sheet)
            .cloned()
            .ok_or_else(|| IngestError::SheetNotFound {
                requested: sheet.to_string(),
                available: self.info.sheet_names.clone(),
                suggestion: None,
            })
    }
}

impl Workbook for XlsxWorkbook {
    fn info(&self) -> &WorkbookInfo {
        &self.info
    }

    fn read_sheet(&mut self, sheet: usize, window: &ReadWindow) -> Result<SheetRows<'_>, IngestError> {
        let path = self.sheet_path(sheet)?;
        if self.shared_strings.is_none() {
            self.shared_strings = Some(load_shared_strings(&mut self.zip, &self.shared_strings_path)?);
        }

        let XlsxWorkbook { zip, number_formats, shared_strings, .. } = self;
        let reader = zip
            .xml_reader(&path)?
            .ok_or_else(|| IngestError::WithContext(format!("worksheet part '{path}' is missing")))?;
        let source = XlsxCells {
            reader,
            shared_strings: shared_strings.as_deref().unwrap_or_default(),
            number_formats,
            row: 0,
            next_row: 0,
            next_col: 0,
        };
        Ok(SheetRows::new(Box::new(source), window))
    }

    fn merged_regions(&mut self, sheet: usize) -> Result<Vec<MergedRegion>, IngestError> {
        let path = self.sheet_path(sheet)?;
        let mut reader = match self.zip.xml_reader(&path)? {
            Some(reader) => reader,
            None => return Ok(Vec::new()),
        };
        let mut regions = Vec::new();
        match_xml_events!(reader => {
            Event::Start(event) if event.local_name().as_ref() == TAG_MERGE_CELL => {
                if let Some(reference) = event.get_attribute_value("ref")? {
                    match RangeInfo::parse(&reference) {
                        Ok(parsed) if !parsed.range.whole_columns => regions.push(MergedRegion::from(&parsed.range)),
                        _ => tracing::debug!("Ignoring merge reference '{reference}' in {path}"),
                    }
                }
            }
        });
        Ok(regions)
    }
}

/// Streams the cells of one worksheet part.
struct XlsxCells<'a, R: BufRead> {
    reader: XmlReader<R>,
    shared_strings: &'a [String],
    number_formats: &'a [CellType],
    /// Row of the `<row>` element being read
    row: usize,
    next_row: usize,
    next_col: usize,
}

impl<R: BufRead> CellSource for XlsxCells<'_, R> {
    fn next_cell(&mut self, window: &ReadWindow) -> Result<Option<Cell>, IngestError> {
        let last_row = window.last_row();
        let mut position: Option<(usize, usize)> = None;
        let mut kind = CellType::Empty;
        let mut value = String::new();
        match_xml_events!(self.reader => {
            Event::Start(event) if event.local_name().as_ref() == TAG_ROW => {
                self.row = event
                    .get_attribute_value("r")?
                    .and_then(|row| row_to_index(row.trim()))
                    .unwrap_or(self.next_row);
                self.next_row = self.row + 1;
                self.next_col = 0;
                if self.row > last_row {
                    return Ok(None);
                }
            }
            Event::Start(event) if event.local_name().as_ref() == TAG_CELL => {
                let (row, col) = event
                    .get_attribute_value("r")?
                    .and_then(|reference| reference_to_index(&reference))
                    .unwrap_or((self.row, self.next_col));
                self.next_col = col + 1;
                if row > last_row {
                    return Ok(None);
                }
                value.clear();
                if window.wants(row, col) {
                    position = Some((row, col));
                    kind = match event.get_attribute_value("t")?.as_deref() {
                        Some("inlineStr") | Some("str") => CellType::InlineString,
                        Some("s") => CellType::SharedString,
                        Some("d") => CellType::IsoDateTime,
                        Some("b") => CellType::Boolean,
                        Some("e") => CellType::Error,
                        _ => match event.parse_attribute_value::<usize>("s")? {
                            Some(index) => self.number_formats.get(index).copied().unwrap_or(CellType::Number),
                            None => CellType::Number,
                        },
                    };
                } else {
                    position = None;
                    kind = CellType::Empty;
                }
            }
            Event::Start(event) if position.is_some() && event.local_name().as_ref() == TAG_INLINE_STRING => {
                value = read_string_value(&mut self.reader, TAG_INLINE_STRING, false)?;
            }
            Event::Start(event) if position.is_some() && event.local_name().as_ref() == TAG_VALUE => {
                value = read_string_value(&mut self.reader, TAG_VALUE, true)?;
            }
            Event::End(event) if event.local_name().as_ref() == TAG_CELL => {
                if let Some((row, col)) = position.take() {
                    if !value.is_empty() {
                        let value = kind.decode(&value, self.shared_strings);
                        return Ok(Some(Cell { row, col, value }));
                    }
                }
            }
        });
        Ok(None)
    }
}

/// The workbook part named by the package's `officeDocument` relationship.
fn office_document_path<RS: Read + Seek>(zip: &mut ZipArchive<RS>) -> Result<String, IngestError> {
    let relationships = load_relationships(zip, "")?;
    Ok(relationships
        .into_iter()
        .find(|relationship| relationship.kind == "officeDocument")
        .map(|relationship| relationship.target)
        .unwrap_or_else(|| DEFAULT_WORKBOOK_PART.to_owned()))
}

/// Reads `(tab position, name, part path)` for every worksheet, the active tab and the date system.
#[allow(clippy::type_complexity)]
fn load_workbook<RS: Read + Seek>(
    zip: &mut ZipArchive<RS>,
    workbook_path: &str,
    worksheets: &HashMap<&str, &str>,
) -> Result<(Vec<(usize, String, String)>, usize, bool), IngestError> {
    let mut reader = zip
        .xml_reader(workbook_path)?
        .ok_or_else(|| IngestError::WithContext(format!("workbook part '{workbook_path}' is missing")))?;
    let mut sheets = Vec::new();
    let mut tab = 0usize;
    let mut active_tab = 0usize;
    let mut is_1904 = false;
    match_xml_events!(reader => {
        Event::Start(event) if event.local_name().as_ref() == TAG_SHEET => {
            let mut name = None;
            let mut id = None;
            for result in event.attributes() {
                let attribute = result?;
                match attribute.key.local_name().as_ref() {
                    b"name" => name = Some(attribute.unescape_value()?.to_string()),
                    b"id" => id = Some(attribute.unescape_value()?.to_string()),
                    _ => (),
                }
            }
            if let Some((name, id)) = name.zip(id) {
                // chartsheets and dialog sheets keep their tab position but are not readable
                if let Some(path) = worksheets.get(id.as_str()) {
                    sheets.push((tab, name, path.to_string()));
                }
            }
            tab += 1;
        }
        Event::Start(event) if event.local_name().as_ref() == TAG_WORKBOOK_PROPERTIES => {
            is_1904 = event.is_attribute_true("date1904")?;
        }
        Event::Start(event) if event.local_name().as_ref() == TAG_WORKBOOK_VIEW => {
            active_tab = event.parse_attribute_value("activeTab")?.unwrap_or(0);
        }
    });
    Ok((sheets, active_tab, is_1904))
}

/// Declared sheet extent from `<dimension ref>`, or the bounding box of all cell references.
fn load_dimensions<RS: Read + Seek>(zip: &mut ZipArchive<RS>, path: &str) -> Result<SheetDimensions, IngestError> {
    let mut reader = match zip.xml_reader(path)? {
        Some(reader) => reader,
        None => return Ok(SheetDimensions::default()),
    };
    let mut is_data = false;
    let mut rows = 0usize;
    let mut cols = 0usize;
    let mut next_row = 0usize;
    let mut next_col = 0usize;
    match_xml_events!(reader => {
        Event::Start(event) if !is_data && event.local_name().as_ref() == TAG_DIMENSION => {
            let declared = event
                .get_attribute_value("ref")?
                .and_then(|reference| RangeInfo::parse(&reference).ok())
                .filter(|parsed| !parsed.range.whole_columns);
            if let Some(parsed) = declared {
                return Ok(SheetDimensions {
                    rows: parsed.range.end_row + 1,
                    cols: parsed.range.end_col + 1,
                });
            }
        }
        Event::Start(event) if event.local_name().as_ref() == TAG_SHEET_DATA => is_data = true,
        Event::End(event) if event.local_name().as_ref() == TAG_SHEET_DATA => break,
        Event::Start(event) if is_data && event.local_name().as_ref() == TAG_ROW => {
            let row = event
                .get_attribute_value("r")?
                .and_then(|row| row_to_index(row.trim()))
                .unwrap_or(next_row);
            next_row = row + 1;
            next_col = 0;
        }
        Event::Start(event) if is_data && event.local_name().as_ref() == TAG_CELL => {
            let (row, col) = event
                .get_attribute_value("r")?
                .and_then(|reference| reference_to_index(&reference))
                .unwrap_or((next_row.saturating_sub(1), next_col));
            next_col = col + 1;
            rows = rows.max(row + 1);
            cols = cols.max(col + 1);
        }
    });
    Ok(SheetDimensions { rows, cols })
}

/// Loads the whole shared string table. A package without one yields an empty table.
pub(crate) fn load_shared_strings<RS: Read + Seek>(zip: &mut ZipArchive<RS>, path: &str) -> Result<Vec<String>, IngestError> {
    let mut shared_strings = Vec::new();
    let mut reader = match zip.xml_reader(path)? {
        Some(reader) => reader,
        None => return Ok(shared_strings),
    };
    match_xml_events!(reader => {
        Event::Start(event) if event.local_name().as_ref() == TAG_SHARED_STRING_ITEM => {
            shared_strings.push(read_string_value(&mut reader, TAG_SHARED_STRING_ITEM, false)?);
        }
    });
    Ok(shared_strings)
}

/// Maps cell-format indexes to cell types using `numFmts` and `cellXfs` from the styles part.
fn load_number_formats<RS: Read + Seek>(zip: &mut ZipArchive<RS>, path: &str, is_1904: bool) -> Result<Vec<CellType>, IngestError> {
    let mut reader = match zip.xml_reader(path)? {
        Some(reader) => reader,
        None => return Ok(Vec::new()),
    };

    let mut custom_formats_context = false;
    let mut custom_formats = HashMap::<String, CellType>::new();
    let mut format_indexes_context = false;
    let mut format_indexes = Vec::<String>::new();

    match_xml_events!(reader => {
        Event::Start(event) if event.local_name().as_ref() == TAG_CUSTOM_FORMATS => custom_formats_context = true,
        Event::End(event) if event.local_name().as_ref() == TAG_CUSTOM_FORMATS => custom_formats_context = false,
        Event::Start(event) if custom_formats_context && event.local_name().as_ref() == TAG_CUSTOM_FORMAT => {
            let id = event.get_attribute_value("numFmtId")?;
            let format = event.get_attribute_value("formatCode")?;
            if let Some((id, format)) = id.zip(format) {
                custom_formats.insert(id.to_string(), CellType::parse_custom_number_format(&format, is_1904));
            }
        }
        Event::Start(event) if event.local_name().as_ref() == TAG_FORMAT_INDEXES => format_indexes_context = true,
        Event::End(event) if event.local_name().as_ref() == TAG_FORMAT_INDEXES => format_indexes_context = false,
        Event::Start(event) if format_indexes_context && event.local_name().as_ref() == TAG_FORMAT_INDEX => {
            let id = event.get_attribute_value("numFmtId")?;
            format_indexes.push(id.map(|id| id.to_string()).unwrap_or_else(|| "0".to_owned()));
        }
    });

    Ok(excel::load_number_formats(format_indexes, custom_formats, is_1904))
}

/// Collects the text of a string item up to `end_tag`, skipping phonetic runs.
pub(crate) fn read_string_value<R: BufRead>(reader: &mut XmlReader<R>, end_tag: &[u8], is_text_content: bool) -> Result<String, IngestError> {
    let mut is_phonetic_text = false;
    let mut is_text = is_text_content;
    let mut text = String::new();
    match_xml_events!(reader => {
        Event::End(event) if event.local_name().as_ref() == end_tag => break,
        Event::Start(event) if event.local_name().as_ref() == TAG_PHONETIC_TEXT => is_phonetic_text = true,
        Event::End(event) if event.local_name().as_ref() == TAG_PHONETIC_TEXT => is_phonetic_text = false,
        Event::Start(event) if !is_phonetic_text && event.local_name().as_ref() == TAG_TEXT => is_text = true,
        Event::End(event) if is_text && event.local_name().as_ref() == TAG_TEXT => is_text = is_text_content,
        Event::Text(event) if is_text => text.push_bytes_text(&event)?,
        Event::CData(event) if is_text => text.push_str(&String::from_utf8_lossy(&event)),
        Event::GeneralRef(event) if is_text => text.push_bytes_ref(&event)?,
    });
    Ok(text)
}
