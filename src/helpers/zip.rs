//! ZIP archive helpers for Office Open XML packages.

use crate::error::IngestError;
use crate::helpers::xml::XmlReader;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use zip::read::ZipFile;
use zip::result::ZipError;
use zip::ZipArchive;

pub(crate) trait ZipHelper<RS: Read + Seek> {
    /// Gets an entry by name (case-insensitive, path separator agnostic, leading `/` ignored)
    fn file(&'_ mut self, name: &str) -> Result<Option<ZipFile<'_, RS>>, IngestError>;

    /// Opens an entry as a streaming XML reader
    fn xml_reader(&'_ mut self, name: &str) -> Result<Option<XmlReader<BufReader<ZipFile<'_, RS>>>>, IngestError>;

    /// Names of all entries, normalized to forward slashes
    fn entry_names(&self) -> Vec<String>;
}

impl<RS: Read + Seek> ZipHelper<RS> for ZipArchive<RS> {
    fn file(&'_ mut self, name: &str) -> Result<Option<ZipFile<'_, RS>>, IngestError> {
        let pattern = name.replace('\\', "/");
        let pattern = pattern.trim_start_matches('/');
        let path = self
            .file_names()
            .find(|file_name| pattern.eq_ignore_ascii_case(file_name.replace('\\', "/").trim_start_matches('/')))
            .map(|file_name| file_name.to_owned());
        match path.map(|file_name| self.by_name(&file_name)).transpose() {
            Ok(file) => Ok(file),
            Err(ZipError::FileNotFound) => Ok(None),
            Err(error) => Err(error)?,
        }
    }

    fn xml_reader(&'_ mut self, name: &str) -> Result<Option<XmlReader<BufReader<ZipFile<'_, RS>>>>, IngestError> {
        Ok(self.file(name)?.map(|file| XmlReader::new(BufReader::new(file))))
    }

    fn entry_names(&self) -> Vec<String> {
        self.file_names()
            .map(|name| name.replace('\\', "/"))
            .collect()
    }
}

/// Resolves a relationship target against the directory of the part that owns it,
/// e.g. `../drawings/d1.xml` from `xl/worksheets/sheet1.xml` becomes `xl/drawings/d1.xml`.
pub(crate) fn resolve_part_path(base_part: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_owned();
    }
    let mut segments: Vec<&str> = base_part.split('/').collect();
    segments.pop();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    #[test]
    fn lookup_ignores_case_and_separators() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("xl/Workbook.xml", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"<workbook/>").unwrap();
        let mut archive = ZipArchive::new(writer.finish().unwrap()).unwrap();

        assert!(archive.file("/XL\\workbook.xml").unwrap().is_some());
        assert!(archive.file("xl/missing.xml").unwrap().is_none());
        assert_eq!(archive.entry_names(), vec!["xl/Workbook.xml".to_owned()]);
    }

    #[test]
    fn relationship_targets() {
        assert_eq!(resolve_part_path("xl/workbook.xml", "worksheets/sheet1.xml"), "xl/worksheets/sheet1.xml");
        assert_eq!(resolve_part_path("xl/worksheets/sheet1.xml", "../drawings/d1.xml"), "xl/drawings/d1.xml");
        assert_eq!(resolve_part_path("xl/workbook.xml", "/xl/worksheets/sheet2.xml"), "xl/worksheets/sheet2.xml");
    }
}
