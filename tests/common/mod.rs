//! Minimal Office Open XML packages for end-to-end tests.
#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const MAIN_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const PACKAGE_REL_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

/// One worksheet. Cells that parse as numbers are written as numbers, empty strings are omitted.
#[derive(Clone, Debug)]
pub struct Sheet {
    name: String,
    rows: Vec<Vec<String>>,
    merges: Vec<String>,
    links: Vec<String>,
}

impl Sheet {
    pub fn new(name: &str, rows: &[&[&str]]) -> Sheet {
        Sheet {
            name: name.to_owned(),
            rows: rows.iter().map(|row| row.iter().map(|cell| cell.to_string()).collect()).collect(),
            merges: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn merge(mut self, reference: &str) -> Sheet {
        self.merges.push(reference.to_owned());
        self
    }

    /// Adds an external hyperlink on `A1`.
    pub fn link(mut self, target: &str) -> Sheet {
        self.links.push(target.to_owned());
        self
    }

    fn xml(&self) -> String {
        let width = self.rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut xml = format!(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="{MAIN_NS}" xmlns:r="{REL_NS}">"#);
        if !self.rows.is_empty() && width > 0 {
            xml.push_str(&format!(r#"<dimension ref="A1:{}{}"/>"#, column_name(width - 1), self.rows.len()));
        }
        xml.push_str("<sheetData>");
        for (row, cells) in self.rows.iter().enumerate() {
            xml.push_str(&format!(r#"<row r="{}">"#, row + 1));
            for (col, value) in cells.iter().enumerate().filter(|(_, value)| !value.is_empty()) {
                let reference = format!("{}{}", column_name(col), row + 1);
                if value.parse::<f64>().is_ok() {
                    xml.push_str(&format!(r#"<c r="{reference}"><v>{value}</v></c>"#));
                } else {
                    xml.push_str(&format!(r#"<c r="{reference}" t="inlineStr"><is><t>{}</t></is></c>"#, escape(value)));
                }
            }
            xml.push_str("</row>");
        }
        xml.push_str("</sheetData>");
        if !self.merges.is_empty() {
            xml.push_str(&format!(r#"<mergeCells count="{}">"#, self.merges.len()));
            for reference in &self.merges {
                xml.push_str(&format!(r#"<mergeCell ref="{reference}"/>"#));
            }
            xml.push_str("</mergeCells>");
        }
        if !self.links.is_empty() {
            xml.push_str("<hyperlinks>");
            for position in 0..self.links.len() {
                xml.push_str(&format!(r#"<hyperlink ref="A1" r:id="rIdLink{}"/>"#, position + 1));
            }
            xml.push_str("</hyperlinks>");
        }
        xml.push_str("</worksheet>");
        xml
    }

    fn relationships(&self) -> Option<String> {
        if self.links.is_empty() {
            return None;
        }
        let mut xml = format!(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="{PACKAGE_REL_NS}">"#);
        for (position, target) in self.links.iter().enumerate() {
            xml.push_str(&format!(
                r#"<Relationship Id="rIdLink{}" Type="{REL_NS}/hyperlink" Target="{}" TargetMode="External"/>"#,
                position + 1,
                escape(target)
            ));
        }
        xml.push_str("</Relationships>");
        Some(xml)
    }
}

/// `0 → A`, `25 → Z`, `26 → AA`.
pub fn column_name(index: usize) -> String {
    let mut index = index + 1;
    let mut name = Vec::new();
    while index > 0 {
        let remainder = (index - 1) % 26;
        name.push(b'A' + remainder as u8);
        index = (index - 1) / 26;
    }
    name.reverse();
    String::from_utf8(name).unwrap()
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

/// Writes an `.xlsx` package with `sheets` into `directory` and returns its path.
pub fn write_workbook(directory: &Path, file_name: &str, sheets: &[Sheet]) -> PathBuf {
    let path = directory.join(file_name);
    let mut writer = ZipWriter::new(File::create(&path).unwrap());
    let mut part = |name: &str, content: &str| {
        writer.start_file(name, SimpleFileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    };

    part(
        "[Content_Types].xml",
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/></Types>"#,
    );
    part(
        "_rels/.rels",
        &format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="{PACKAGE_REL_NS}"><Relationship Id="rId1" Type="{REL_NS}/officeDocument" Target="xl/workbook.xml"/></Relationships>"#
        ),
    );

    let mut workbook = format!(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><workbook xmlns="{MAIN_NS}" xmlns:r="{REL_NS}"><sheets>"#);
    let mut relationships = format!(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="{PACKAGE_REL_NS}">"#);
    for (position, sheet) in sheets.iter().enumerate() {
        let number = position + 1;
        workbook.push_str(&format!(r#"<sheet name="{}" sheetId="{number}" r:id="rId{number}"/>"#, escape(&sheet.name)));
        relationships.push_str(&format!(
            r#"<Relationship Id="rId{number}" Type="{REL_NS}/worksheet" Target="worksheets/sheet{number}.xml"/>"#
        ));
    }
    workbook.push_str("</sheets></workbook>");
    relationships.push_str("</Relationships>");
    part("xl/workbook.xml", &workbook);
    part("xl/_rels/workbook.xml.rels", &relationships);

    for (position, sheet) in sheets.iter().enumerate() {
        let number = position + 1;
        part(&format!("xl/worksheets/sheet{number}.xml"), &sheet.xml());
        if let Some(links) = sheet.relationships() {
            part(&format!("xl/worksheets/_rels/sheet{number}.xml.rels"), &links);
        }
    }
    writer.finish().unwrap();
    path
}

/// A 6 x 10 sheet whose `B2:D5` block is a small table with a header row.
pub fn report_sheet() -> Sheet {
    Sheet::new(
        "Report",
        &[
            &["Quarterly report", "", "", "", "", ""],
            &["", "Region", "Units", "Revenue", "Owner", "Flag"],
            &["", "North", "10", "20.5", "Ann", "y"],
            &["", "South", "12", "30", "Bob", "n"],
            &["", "East", "7", "12.25", "Cy", "y"],
            &["", "West", "9", "18", "Di", "n"],
            &["", "Central", "4", "8", "Ed", "n"],
            &["", "Online", "30", "61.5", "Fay", "y"],
            &["", "Export", "2", "5", "Gus", "n"],
            &["Total", "", "95", "185.25", "", ""],
        ],
    )
}
