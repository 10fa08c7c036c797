//! Streaming XML helpers for the SpreadsheetML parts of an `.xlsx` package
//! (workbook, worksheets, shared strings, styles and relationship files).

use crate::error::IngestError;
use quick_xml::escape::resolve_xml_entity;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::BytesRef;
use quick_xml::events::BytesStart;
use quick_xml::events::BytesText;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::borrow::Cow;
use std::io::BufRead;
use std::str::FromStr;
use thiserror::Error;

/// Errors specific to XML parsing operations
#[derive(Error, Debug)]
pub enum XmlError {
    #[error("Parse entity '{0}' failed")]
    ParseEntityError(String),

    #[error("Parse attribute value '{0}' failed")]
    ParseAttributeValueError(String),
}

/// Pull-based XML reader reusing a single event buffer.
pub(crate) struct XmlReader<R: BufRead> {
    reader: Reader<R>,
    buffer: Vec<u8>,
}

impl<R: BufRead> XmlReader<R> {
    pub(crate) fn new(buf_reader: R) -> XmlReader<R> {
        let mut reader = Reader::from_reader(buf_reader);
        let config = reader.config_mut();
        config.check_comments = false;
        config.check_end_names = false;
        config.expand_empty_elements = true;
        config.trim_text(false);

        XmlReader { reader, buffer: Vec::with_capacity(1024) }
    }

    /// Reads the next event, `None` at end of document
    pub(crate) fn next(&'_ mut self) -> Result<Option<Event<'_>>, IngestError> {
        self.buffer.clear();
        match self.reader.read_event_into(&mut self.buffer)? {
            Event::Eof => Ok(None),
            event => Ok(Some(event)),
        }
    }
}

pub(crate) trait XmlAttributeHelper<'a> {
    fn get_value(&self) -> Result<Cow<'a, str>, IngestError>;

    fn parse_value<T: FromStr>(&self) -> Result<T, IngestError>;
}

impl<'a> XmlAttributeHelper<'a> for Attribute<'a> {
    fn get_value(&self) -> Result<Cow<'a, str>, IngestError> {
        Ok(self.unescape_value()?)
    }

    fn parse_value<T: FromStr>(&self) -> Result<T, IngestError> {
        let value = self.get_value()?;
        value
            .trim()
            .parse()
            .map_err(|_| XmlError::ParseAttributeValueError(value.to_string()).into())
    }
}

/// Attribute lookup on start tags. Names are matched verbatim, including any prefix such as `r:id`.
pub(crate) trait XmlNodeHelper<'a> {
    fn get_attribute_value(&'a self, name: &str) -> Result<Option<Cow<'a, str>>, IngestError>;

    fn parse_attribute_value<T: FromStr>(&self, name: &str) -> Result<Option<T>, IngestError>;

    /// True when the attribute is present and spelled as an OOXML boolean truth value
    fn is_attribute_true(&self, name: &str) -> Result<bool, IngestError>;
}

impl<'a> XmlNodeHelper<'a> for BytesStart<'a> {
    fn get_attribute_value(&'a self, name: &str) -> Result<Option<Cow<'a, str>>, IngestError> {
        self.try_get_attribute(name)?
            .map(|attribute| attribute.get_value())
            .transpose()
    }

    fn parse_attribute_value<T: FromStr>(&self, name: &str) -> Result<Option<T>, IngestError> {
        self.try_get_attribute(name)?
            .map(|attribute| attribute.parse_value())
            .transpose()
    }

    fn is_attribute_true(&self, name: &str) -> Result<bool, IngestError> {
        Ok(match self.try_get_attribute(name)? {
            Some(attribute) => matches!(attribute.get_value()?.as_ref(), "1" | "true"),
            None => false,
        })
    }
}

/// Accumulates text content, resolving entity and character references.
pub(crate) trait XmlTextContextHelper {
    fn push_bytes_text(&mut self, text: &BytesText) -> Result<(), IngestError>;

    fn push_bytes_ref(&mut self, bytes: &BytesRef) -> Result<(), IngestError>;
}

impl XmlTextContextHelper for String {
    fn push_bytes_text(&mut self, text: &BytesText) -> Result<(), IngestError> {
        self.push_str(&text.xml_content()?);
        Ok(())
    }

    fn push_bytes_ref(&mut self, bytes: &BytesRef) -> Result<(), IngestError> {
        let raw = bytes.xml_content()?;
        if let Some(number) = raw.strip_prefix('#') {
            let code = match number.strip_prefix('x').or_else(|| number.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16)?,
                None => number.parse::<u32>()?,
            };
            if let Some(character) = char::from_u32(code) {
                self.push(character);
            }
        } else if let Some(entity) = resolve_xml_entity(&raw) {
            self.push_str(entity);
        } else {
            Err(XmlError::ParseEntityError(raw.to_string()))?;
        }
        Ok(())
    }
}

/// Drives an [`XmlReader`] to the end of the document, dispatching each event to the given arms.
#[macro_export]
macro_rules! match_xml_events {
    ($reader:expr => { $($arms:tt)* }) => {
        while let Some(result) = $reader.next()? {
            match result {
                Event::Eof => break,
                $($arms)*
                _ => (),
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_text_with_references() -> Result<(), IngestError> {
        let xml = r#"<si><t>Tom &amp; Jerry &#x4E2D;&#25991;</t></si>"#;
        let mut reader = XmlReader::new(xml.as_bytes());
        let mut text = String::new();
        match_xml_events!(reader => {
            Event::Text(ref event) => text.push_bytes_text(event)?,
            Event::GeneralRef(ref event) => text.push_bytes_ref(event)?,
        });
        assert_eq!(text, "Tom & Jerry 中文");
        Ok(())
    }

    #[test]
    fn malformed_character_references_fail_to_parse() {
        let collect = || -> Result<String, IngestError> {
            let mut reader = XmlReader::new("<t>&#12x;</t>".as_bytes());
            let mut text = String::new();
            match_xml_events!(reader => {
                Event::GeneralRef(ref event) => text.push_bytes_ref(event)?,
            });
            Ok(text)
        };
        assert!(matches!(collect(), Err(IngestError::ParseInt(_))));
    }

    #[test]
    fn attribute_helpers() -> Result<(), IngestError> {
        let xml = r#"<c r="B2" s=" 3 " hidden="1"/>"#;
        let mut reader = XmlReader::new(xml.as_bytes());
        let mut seen = false;
        match_xml_events!(reader => {
            Event::Start(ref node) if node.local_name().as_ref() == b"c" => {
                assert_eq!(node.get_attribute_value("r")?.as_deref(), Some("B2"));
                assert_eq!(node.parse_attribute_value::<usize>("s")?, Some(3));
                assert!(node.is_attribute_true("hidden")?);
                assert!(!node.is_attribute_true("missing")?);
                seen = true;
            },
        });
        assert!(seen);
        Ok(())
    }
}
