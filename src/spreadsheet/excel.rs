//! Shared helpers for Excel containers: relationship parts and number-format tables.
use crate::error::IngestError;
use crate::helpers::xml::XmlNodeHelper;
use crate::helpers::zip::resolve_part_path;
use crate::helpers::zip::ZipHelper;
use crate::match_xml_events;
use crate::spreadsheet::cell::CellType;
use quick_xml::events::Event;
use std::collections::HashMap;
use std::io::Read;
use std::io::Seek;
use zip::ZipArchive;

const TAG_RELATIONSHIP: &[u8] = b"Relationship";

/// One entry of a `_rels/*.rels` part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Relationship {
    pub(crate) id: String,
    /// Last segment of the relationship type URI, e.g. `worksheet` or `hyperlink`
    pub(crate) kind: String,
    /// Package path for internal targets, the raw target for external ones
    pub(crate) target: String,
    pub(crate) is_external: bool,
}

/// The relationships part that belongs to `part`, e.g. `xl/worksheets/_rels/sheet1.xml.rels`.
pub(crate) fn relationships_path(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((directory, name)) => format!("{directory}/_rels/{name}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

/// Loads the relationships of `part`. A missing relationships part yields an empty list.
pub(crate) fn load_relationships<RS: Read + Seek>(zip: &mut ZipArchive<RS>, part: &str) -> Result<Vec<Relationship>, IngestError> {
    let mut relationships = Vec::new();
    let mut reader = match zip.xml_reader(&relationships_path(part))? {
        Some(reader) => reader,
        None => return Ok(relationships),
    };
    match_xml_events!(reader => {
        Event::Start(event) if event.local_name().as_ref() == TAG_RELATIONSHIP => {
            let id = event.get_attribute_value("Id")?;
            let kind = event.get_attribute_value("Type")?;
            let target = event.get_attribute_value("Target")?;
            let is_external = event
                .get_attribute_value("TargetMode")?
                .map(|mode| mode.eq_ignore_ascii_case("External"))
                .unwrap_or(false);
            if let Some(target) = target {
                let target = if is_external { target.to_string() } else { resolve_part_path(part, &target) };
                relationships.push(Relationship {
                    id: id.map(|id| id.to_string()).unwrap_or_default(),
                    kind: kind.and_then(|kind| kind.rsplit('/').next().map(str::to_owned)).unwrap_or_default(),
                    target,
                    is_external,
                });
            }
        }
    });
    Ok(relationships)
}

/// Maps each cell-format index to the cell type its number format implies.
pub(crate) fn load_number_formats(format_indexes: Vec<String>, custom_formats: HashMap<String, CellType>, is_1904: bool) -> Vec<CellType> {
    format_indexes
        .iter()
        .map(|id| {
            custom_formats
                .get(id)
                .copied()
                .or_else(|| CellType::parse_builtin_number_format_id(id, is_1904))
                .unwrap_or(CellType::Number)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    #[test]
    fn relationship_paths() {
        assert_eq!(relationships_path("xl/workbook.xml"), "xl/_rels/workbook.xml.rels");
        assert_eq!(relationships_path("xl/worksheets/sheet1.xml"), "xl/worksheets/_rels/sheet1.xml.rels");
    }

    #[test]
    fn loads_internal_and_external_targets() -> Result<(), IngestError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("xl/worksheets/_rels/sheet1.xml.rels", SimpleFileOptions::default())?;
        writer.write_all(br#"<?xml version="1.0"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink" Target="javascript:alert(1)" TargetMode="External"/>
  <Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/drawing" Target="../drawings/drawing1.xml"/>
</Relationships>"#)?;
        let mut zip = ZipArchive::new(writer.finish()?)?;

        let relationships = load_relationships(&mut zip, "xl/worksheets/sheet1.xml")?;
        assert_eq!(relationships.len(), 2);
        assert_eq!(relationships[0].kind, "hyperlink");
        assert!(relationships[0].is_external);
        assert_eq!(relationships[0].target, "javascript:alert(1)");
        assert_eq!(relationships[1].target, "xl/drawings/drawing1.xml");
        assert!(load_relationships(&mut zip, "xl/worksheets/sheet2.xml")?.is_empty());
        Ok(())
    }

    #[test]
    fn number_formats_fall_back_to_builtin() {
        let custom = HashMap::from([("164".to_owned(), CellType::NumberDate1900)]);
        let formats = load_number_formats(vec!["0".into(), "164".into(), "14".into(), "22".into()], custom, false);
        assert_eq!(formats, vec![CellType::Number, CellType::NumberDate1900, CellType::NumberDate1900, CellType::NumberDateTime1900]);
    }
}
