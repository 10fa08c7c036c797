use crate::error::IngestError;
use std::fs::File;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;

/// A seekable byte source over a local workbook file
pub(crate) enum UnifiedReader {
    Local(BufReader<File>),
}

impl UnifiedReader {
    /// Opens a local file. Missing or unreadable files are reported as `UnreadableFile`.
    pub(crate) fn open(path: &Path) -> Result<UnifiedReader, IngestError> {
        let file = File::open(path).map_err(|error| IngestError::UnreadableFile {
            path: path.display().to_string(),
            reason: error.to_string(),
        })?;
        Ok(UnifiedReader::Local(BufReader::new(file)))
    }

    /// Reads up to `length` leading bytes and rewinds to the start
    pub(crate) fn head(&mut self, length: usize) -> Result<Vec<u8>, IngestError> {
        self.seek(SeekFrom::Start(0))?;
        let mut head = Vec::with_capacity(length);
        self.by_ref().take(length as u64).read_to_end(&mut head)?;
        self.seek(SeekFrom::Start(0))?;
        Ok(head)
    }
}

impl Read for UnifiedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            UnifiedReader::Local(reader) => reader.read(buf),
        }
    }
}

impl Seek for UnifiedReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            UnifiedReader::Local(reader) => reader.seek(pos),
        }
    }
}
