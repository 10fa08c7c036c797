//! Microsoft Office Binary Interchange File Format (BIFF8)
//! Record reader for the `Workbook` stream of Excel 97-2003 files.
//! Records may be split across `CONTINUE` records; the reader presents them as one logical record.

use crate::error::IngestError;
use crate::helpers::bytes::u16_at;
use crate::helpers::bytes::u32_at;
use crate::helpers::bytes::u64_at;
use encoding_rs::Encoding;
use thiserror::Error;

const CONTINUE: u16 = 60;

/// Errors specific to BIFF8 format parsing
#[derive(Error, Debug)]
pub enum Biff8Error {
    #[error("Fewer than {0} bytes remaining in record")]
    NoEnoughDataError(usize),
}

/// Reader for the BIFF8 record stream
pub(crate) struct Biff8Reader {
    /// Encoding of 8-bit strings, updated from the `CODEPAGE` record
    pub(crate) encoding: &'static Encoding,
    buffer: Vec<u8>,
    /// Next record position in buffer
    pointer: usize,
    /// Current record chunks (start, end), clamped to the buffer
    chunks: Vec<(usize, usize)>,
    /// Current chunk index
    index: usize,
    /// Offset within current chunk
    offset: usize,
}

impl Biff8Reader {
    pub(crate) fn new(data: Vec<u8>) -> Biff8Reader {
        Biff8Reader {
            encoding: encoding_rs::WINDOWS_1252,
            buffer: data,
            pointer: 0,
            chunks: Vec::new(),
            index: 0,
            offset: 0,
        }
    }

    /// Advances to the next record and returns its type, `None` at end of stream
    pub(crate) fn next(&mut self) -> Result<Option<u16>, IngestError> {
        if self.pointer + 4 > self.buffer.len() {
            return Ok(None);
        }
        self.index = 0;
        self.offset = 0;
        self.chunks.clear();

        let kind = self.get_u16_at(self.pointer)?;
        let chunk = self.chunk_at(self.pointer)?;
        self.chunks.push(chunk);
        while self.pointer + 4 <= self.buffer.len() && self.get_u16_at(self.pointer)? == CONTINUE {
            let chunk = self.chunk_at(self.pointer)?;
            self.chunks.push(chunk);
        }
        Ok(Some(kind))
    }

    /// Reads the record header at `position` and moves the pointer past its body
    fn chunk_at(&mut self, position: usize) -> Result<(usize, usize), IngestError> {
        let size = self.get_u16_at(position + 2)? as usize;
        let lower = position + 4;
        let upper = (lower + size).min(self.buffer.len());
        self.pointer = lower + size;
        Ok((lower, upper))
    }

    /// Position of the next record header
    pub(crate) fn position(&self) -> usize {
        self.pointer
    }

    pub(crate) fn goto(&mut self, pointer: usize) {
        self.pointer = pointer;
        self.chunks.clear();
    }

    /// The complete body of the current record, continuation records included
    pub(crate) fn record_data(&self) -> Vec<u8> {
        self.chunks
            .iter()
            .flat_map(|(lower, upper)| self.buffer[*lower..*upper].iter().copied())
            .collect()
    }

    fn read_extract(&mut self, length: usize) -> Result<&[u8], IngestError> {
        let (source, target) = self.read_bounds(length);
        if target - source == length {
            Ok(&self.buffer[source..target])
        } else {
            Err(Biff8Error::NoEnoughDataError(length))?
        }
    }

    /// Advances by up to `length` bytes within the current chunk, returning the consumed span
    fn read_bounds(&mut self, length: usize) -> (usize, usize) {
        if let Some((lower, upper)) = self.chunks.get(self.index).copied() {
            let source = upper.min(lower + self.offset);
            let target = upper.min(source + length);
            if source < upper {
                if target == upper {
                    self.index += 1;
                    self.offset = 0;
                } else {
                    self.offset += target - source;
                }
                return (source, target);
            }
        }
        (0, 0)
    }

    pub(crate) fn skip(&mut self, length: usize) -> Result<(), IngestError> {
        let mut remaining = length;
        while remaining > 0 {
            let (source, target) = self.read_bounds(remaining);
            if source == target {
                Err(Biff8Error::NoEnoughDataError(length))?;
            }
            remaining -= target - source;
        }
        Ok(())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, IngestError> {
        self.read_extract(1).map(|data| data[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, IngestError> {
        let data = self.read_extract(2)?;
        Ok(u16_at(data, 0).unwrap_or_default())
    }

    /// Reads a `u16` counted from the end of the current record
    pub(crate) fn get_u16_back(&self, offset: usize) -> Result<u16, IngestError> {
        let mut offset = offset;
        for (lower, upper) in self.chunks.iter().rev() {
            if *lower + offset <= *upper {
                return self.get_u16_at(*upper - offset);
            }
            offset -= *upper - *lower;
        }
        Err(Biff8Error::NoEnoughDataError(2))?
    }

    fn get_u16_at(&self, index: usize) -> Result<u16, IngestError> {
        Ok(u16_at(&self.buffer, index).ok_or(Biff8Error::NoEnoughDataError(2))?)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, IngestError> {
        let data = self.read_extract(4)?;
        Ok(u32_at(data, 0).unwrap_or_default())
    }

    pub(crate) fn read_usize(&mut self) -> Result<usize, IngestError> {
        Ok(self.read_u32()? as usize)
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, IngestError> {
        let data = self.read_extract(8)?;
        Ok(u64_at(data, 0).unwrap_or_default())
    }

    pub(crate) fn read_f64(&mut self) -> Result<f64, IngestError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Decodes an RK number: a 30-bit integer or the high bits of a double, optionally divided by 100
    pub(crate) fn read_rk_number(&mut self) -> Result<String, IngestError> {
        let value = self.read_u32()?;
        let is_percentage = (value & 0x01) != 0;
        let is_integer = (value & 0x02) != 0;

        if is_integer {
            let integer = ((value as i32) >> 2) as i64;
            if !is_percentage {
                return Ok(integer.to_string());
            }
            return Ok((integer as f64 / 100.0).to_string());
        }
        let mut value = f64::from_bits(((value >> 2) as u64) << 34);
        if is_percentage {
            value /= 100.0;
        }
        Ok(value.to_string())
    }

    /// Reads a string with a 1-byte character count
    pub(crate) fn read_short_xl_unicode_string(&mut self) -> Result<String, IngestError> {
        let mut string = String::new();
        let chars = self.read_u8()? as usize;
        self.read_string_into(chars, false, &mut string)?;
        Ok(string)
    }

    /// Reads a string with a 2-byte character count
    pub(crate) fn read_xl_unicode_string(&mut self) -> Result<String, IngestError> {
        let mut string = String::new();
        let chars = self.read_u16()? as usize;
        self.read_string_into(chars, false, &mut string)?;
        Ok(string)
    }

    /// Reads a shared-string-table entry. Its characters may continue in the next chunk behind a
    /// fresh flag byte; formatting runs and phonetic data follow the last piece.
    pub(crate) fn read_xl_unicode_rich_extended_string(&mut self) -> Result<String, IngestError> {
        let mut string = String::new();
        let mut expected = self.read_u16()? as usize;
        let (mut actual, trailing) = self.read_string_into(expected, true, &mut string)?;
        while actual < expected {
            expected -= actual;
            (actual, _) = self.read_string_into(expected, false, &mut string)?;
            if actual == 0 {
                Err(Biff8Error::NoEnoughDataError(expected))?;
            }
        }
        self.skip(trailing)?;
        Ok(string)
    }

    /// Appends up to `chars` characters and returns how many were read together with the
    /// number of trailing run/phonetic bytes announced by the flags
    fn read_string_into(&mut self, chars: usize, is_extend: bool, content: &mut String) -> Result<(usize, usize), IngestError> {
        let flag = self.read_u8()?;
        let is_high_byte = (flag & 0x1) > 0;
        let rich_string_count = if is_extend && (flag & 0x8) > 0 {
            self.read_u16()? as usize
        } else {
            0
        };
        let phonetic_count = if is_extend && (flag & 0x4) > 0 {
            self.read_usize()?
        } else {
            0
        };
        let expected = if is_high_byte { chars << 1 } else { chars };
        let (source, target) = self.read_bounds(expected);
        let bytes = &self.buffer[source..target];
        if is_high_byte {
            let (string, _, _) = encoding_rs::UTF_16LE.decode(bytes);
            content.push_str(&string);
        } else {
            let (string, _, _) = self.encoding.decode(bytes);
            content.push_str(&string);
        }
        let actual = target - source;
        let actual = if is_high_byte { actual >> 1 } else { actual };
        Ok((actual, 4 * rich_string_count + phonetic_count))
    }
}

#[macro_export]
macro_rules! match_biff8_record {
    ($reader:expr => { $($arms:tt)* }) => {
        while let Some(kind) = $reader.next()? {
            match kind {
                $($arms)*
                _ => (),
            }
        }
    };
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record(kind: u16, body: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(body.len() + 4);
        bytes.extend_from_slice(&kind.to_le_bytes());
        bytes.extend_from_slice(&(body.len() as u16).to_le_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn records_join_continuations() -> Result<(), IngestError> {
        let mut stream = record(0x00FC, &[1, 2]);
        stream.extend(record(CONTINUE, &[3, 4]));
        stream.extend(record(0x000A, &[]));
        let mut reader = Biff8Reader::new(stream);

        assert_eq!(reader.next()?, Some(0x00FC));
        assert_eq!(reader.record_data(), vec![1, 2, 3, 4]);
        assert_eq!(reader.next()?, Some(0x000A));
        assert_eq!(reader.next()?, None);
        Ok(())
    }

    #[test]
    fn truncated_record_is_an_error() -> Result<(), IngestError> {
        let mut stream = record(0x0203, &[0; 4]);
        stream.truncate(6);
        let mut reader = Biff8Reader::new(stream);
        assert_eq!(reader.next()?, Some(0x0203));
        assert!(reader.read_u32().is_err());
        Ok(())
    }

    #[test]
    fn strings_and_rk_numbers() -> Result<(), IngestError> {
        let mut body = vec![3, 0, 0];
        body.extend_from_slice(b"abc");
        body.extend_from_slice(&((42u32 << 2) | 0x02).to_le_bytes());
        let mut reader = Biff8Reader::new(record(0x0204, &body));
        reader.next()?;
        assert_eq!(reader.read_xl_unicode_string()?, "abc");
        assert_eq!(reader.read_rk_number()?, "42");
        Ok(())
    }
}
