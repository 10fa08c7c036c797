//! Structural inspection of workbook containers. Parts and storages are only listed and
//! their text is only read; nothing inside a code project is decoded.
use crate::error::IngestError;
use crate::helpers::biff8::Biff8Reader;
use crate::helpers::cfb::Cfb;
use crate::helpers::xml::XmlNodeHelper;
use crate::helpers::xml::XmlTextContextHelper;
use crate::helpers::zip::ZipHelper;
use crate::match_xml_events;
use crate::security::scheme::find_unsafe_scheme;
use crate::security::scheme::hyperlink_scheme;
use crate::security::IssueKind;
use crate::security::SecurityIssue;
use crate::security::Severity;
use crate::spreadsheet::excel::load_relationships;
use crate::spreadsheet::reference::index_to_reference;
use crate::spreadsheet::xlsx::load_shared_strings;
use quick_xml::events::Event;
use std::collections::HashMap;
use std::io::Read;
use std::io::Seek;
use zip::ZipArchive;

const TAG_CELL: &[u8] = b"c";
const TAG_FORMULA: &[u8] = b"f";
const TAG_VALUE: &[u8] = b"v";
const TAG_TEXT: &[u8] = b"t";

const CONTENT_TYPES_PART: &str = "[Content_Types].xml";

/// Storage and stream names of VBA and Excel 4.0 macro projects in compound files
const MACRO_STORAGES: [&str; 4] = ["_VBA_PROJECT_CUR", "_VBA_PROJECT", "VBA", "Macros"];

// BIFF8 records that carry text or link targets
const FORMULA: u16 = 6;
const FILE_PASS: u16 = 47;
const SUP_BOOK: u16 = 430;
const HLINK: u16 = 440;
const SST: u16 = 252;
const LABEL: u16 = 516;
const STRING: u16 = 519;

/// Parts whose text content is checked cell by cell.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CellPart {
    Worksheet,
    SharedStrings,
}

impl CellPart {
    fn from_relationship(kind: &str) -> Option<CellPart> {
        match kind {
            "worksheet" | "dialogsheet" | "macrosheet" => Some(CellPart::Worksheet),
            "sharedStrings" => Some(CellPart::SharedStrings),
            _ => None,
        }
    }

    /// Conventional locations, for packages whose relationships do not name the part.
    fn from_default_path(lower: &str) -> Option<CellPart> {
        if lower.ends_with("sharedstrings.xml") {
            Some(CellPart::SharedStrings)
        } else if lower.starts_with("xl/worksheets/") && lower.ends_with(".xml") {
            Some(CellPart::Worksheet)
        } else {
            None
        }
    }
}

/// Reports every macro part, unsafe relationship target and unsafe cell text of an OOXML package.
/// Worksheets and shared strings are found through relationships, wherever they are stored.
pub(crate) fn scan_zip<RS: Read + Seek>(zip: &mut ZipArchive<RS>, issues: &mut Vec<SecurityIssue>) -> Result<(), IngestError> {
    let names = zip.entry_names();
    for name in &names {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with("vbaproject.bin") || lower.contains("vbaprojectsignature") || lower.starts_with("xl/macrosheets/") {
            issues.push(SecurityIssue::new(IssueKind::Macro, name, Severity::High, "embedded macro project part"));
        }
    }
    scan_content_types(zip, issues)?;

    // Keyed by lowercase path, part lookups ignore case
    let mut cell_parts = HashMap::new();
    for name in names.iter().filter(|name| name.to_ascii_lowercase().ends_with(".rels")) {
        let Some(part) = relationships_source(name) else {
            continue;
        };
        for relationship in load_relationships(zip, &part)? {
            if !relationship.is_external {
                if let Some(kind) = CellPart::from_relationship(&relationship.kind) {
                    cell_parts.insert(relationship.target.to_ascii_lowercase(), kind);
                }
            }
            if let Some(scheme) = hyperlink_scheme(&relationship.target) {
                let location = format!("{name}#{}", relationship.id);
                let detail = format!("{} target '{}' uses {scheme}", relationship.kind, relationship.target);
                issues.push(SecurityIssue::new(IssueKind::ExternalReference, &location, scheme.severity(), &detail));
            }
        }
    }

    for name in &names {
        let lower = name.to_ascii_lowercase();
        match cell_parts.get(&lower).copied().or_else(|| CellPart::from_default_path(&lower)) {
            Some(CellPart::SharedStrings) => {
                for (index, text) in load_shared_strings(zip, name)?.iter().enumerate() {
                    check_text(issues, &format!("{name}[{index}]"), text);
                }
            }
            Some(CellPart::Worksheet) => scan_worksheet(zip, name, issues)?,
            None => (),
        }
    }
    Ok(())
}

/// `[Content_Types].xml` declares a code project even when the part itself is hidden or renamed.
fn scan_content_types<RS: Read + Seek>(zip: &mut ZipArchive<RS>, issues: &mut Vec<SecurityIssue>) -> Result<(), IngestError> {
    let mut content = String::new();
    match zip.file(CONTENT_TYPES_PART)? {
        Some(mut file) => file.read_to_string(&mut content)?,
        None => return Ok(()),
    };
    let content = content.to_ascii_lowercase();
    if content.contains("vbaproject") {
        issues.push(SecurityIssue::new(IssueKind::Macro, CONTENT_TYPES_PART, Severity::High, "vbaProject content type declared"));
    } else if content.contains("macroenabled") {
        issues.push(SecurityIssue::new(IssueKind::Macro, CONTENT_TYPES_PART, Severity::Medium, "macro-enabled workbook content type"));
    }
    Ok(())
}

/// The part a relationships file belongs to: `xl/_rels/workbook.xml.rels` → `xl/workbook.xml`,
/// `_rels/.rels` → the package root (empty string).
fn relationships_source(path: &str) -> Option<String> {
    let path = path.strip_suffix(".rels")?;
    if let Some(name) = path.strip_prefix("_rels/") {
        return Some(name.to_owned());
    }
    let (directory, name) = path.rsplit_once("/_rels/")?;
    Some(format!("{directory}/{name}"))
}

/// Checks formula text, cached values and inline strings of every cell.
fn scan_worksheet<RS: Read + Seek>(zip: &mut ZipArchive<RS>, path: &str, issues: &mut Vec<SecurityIssue>) -> Result<(), IngestError> {
    let mut reader = match zip.xml_reader(path)? {
        Some(reader) => reader,
        None => return Ok(()),
    };
    let mut reference = String::new();
    let mut is_text = false;
    let mut text = String::new();
    match_xml_events!(reader => {
        Event::Start(event) if event.local_name().as_ref() == TAG_CELL => {
            reference = event.get_attribute_value("r")?.map(|r| r.to_string()).unwrap_or_default();
        }
        Event::Start(event) if matches!(event.local_name().as_ref(), TAG_FORMULA | TAG_VALUE | TAG_TEXT) => {
            is_text = true;
            text.clear();
        }
        Event::End(event) if matches!(event.local_name().as_ref(), TAG_FORMULA | TAG_VALUE | TAG_TEXT) => {
            is_text = false;
            check_text(issues, &format!("{path}!{reference}"), &text);
        }
        Event::Text(event) if is_text => text.push_bytes_text(&event)?,
        Event::CData(event) if is_text => text.push_str(&String::from_utf8_lossy(&event)),
        Event::GeneralRef(event) if is_text => text.push_bytes_ref(&event)?,
    });
    Ok(())
}

fn check_text(issues: &mut Vec<SecurityIssue>, location: &str, text: &str) {
    if let Some(scheme) = find_unsafe_scheme(text) {
        let detail = format!("cell text references {scheme}");
        issues.push(SecurityIssue::new(IssueKind::ExternalReference, location, scheme.severity(), &detail));
    }
}

/// Outcome of a compound-file scan.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CfbScan {
    Scanned,
    /// The workbook stream is protected by `FILEPASS`, its records cannot be inspected
    Encrypted,
}

/// Reports macro storages and unsafe text in the `Workbook` stream of a legacy workbook.
pub(crate) fn scan_cfb(cfb: &Cfb, issues: &mut Vec<SecurityIssue>) -> Result<CfbScan, IngestError> {
    for (name, _) in cfb.entries() {
        if MACRO_STORAGES.iter().any(|storage| storage.eq_ignore_ascii_case(name)) {
            issues.push(SecurityIssue::new(IssueKind::Macro, name, Severity::High, "embedded macro storage"));
        }
    }

    let (stream_name, stream) = match cfb.read("Workbook")? {
        Some(stream) => ("Workbook", stream),
        None => match cfb.read("Book")? {
            Some(stream) => ("Book", stream),
            None => return Ok(CfbScan::Scanned),
        },
    };
    let mut reader = Biff8Reader::new(stream);
    let mut shared_string_index = 0usize;
    loop {
        let offset = reader.position();
        let Some(kind) = reader.next()? else {
            break;
        };
        match kind {
            FILE_PASS => return Ok(CfbScan::Encrypted),
            SST => {
                let strings = read_shared_strings(&mut reader).unwrap_or_default();
                if strings.is_empty() {
                    check_record(issues, &format!("{stream_name} SST record at offset {offset}"), &reader.record_data());
                }
                for text in strings {
                    check_text(issues, &format!("{stream_name} SST[{shared_string_index}]"), &text);
                    shared_string_index += 1;
                }
            }
            LABEL => {
                let row = reader.read_u16()? as usize;
                let col = reader.read_u16()? as usize;
                reader.skip(2)?;
                let text = reader.read_xl_unicode_string().unwrap_or_default();
                check_text(issues, &format!("{stream_name} cell {}", index_to_reference(row, col)), &text);
            }
            HLINK | SUP_BOOK | FORMULA | STRING => {
                check_record(issues, &format!("{stream_name} record 0x{kind:04X} at offset {offset}"), &reader.record_data());
            }
            _ => (),
        }
    }
    Ok(CfbScan::Scanned)
}

fn read_shared_strings(reader: &mut Biff8Reader) -> Result<Vec<String>, IngestError> {
    reader.skip(4)?;
    let count = reader.read_usize()?;
    let mut strings = Vec::new();
    for _ in 0..count {
        strings.push(reader.read_xl_unicode_rich_extended_string()?);
    }
    Ok(strings)
}

/// Binary records mix UTF-16 and 8-bit text with structure; every plausible decoding is checked.
fn check_record(issues: &mut Vec<SecurityIssue>, location: &str, data: &[u8]) {
    let latin1: String = data.iter().map(|byte| char::from(*byte)).collect();
    let (utf16, _, _) = encoding_rs::UTF_16LE.decode(data);
    let (utf16_shifted, _, _) = encoding_rs::UTF_16LE.decode(data.get(1..).unwrap_or_default());
    for text in [latin1.as_str(), &*utf16, &*utf16_shifted] {
        if let Some(scheme) = find_unsafe_scheme(text) {
            let detail = format!("link or formula references {scheme}");
            issues.push(SecurityIssue::new(IssueKind::ExternalReference, location, scheme.severity(), &detail));
            return;
        }
    }
}
