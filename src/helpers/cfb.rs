//! OLE Compound File Binary (CFB) reader for legacy containers.
//! Used to read the `Workbook` stream of `.xls` files and to enumerate storages such as
//! `_VBA_PROJECT_CUR` during security scanning. Input is treated as untrusted: every sector
//! access is bounds-checked and allocation chains are cycle-limited.

use crate::error::IngestError;
use crate::helpers::bytes::to_usize_iter;
use crate::helpers::bytes::u16_at;
use crate::helpers::bytes::u64_at;
use crate::helpers::bytes::usize_at;
use encoding_rs::UTF_16LE;
use std::collections::HashMap;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use thiserror::Error;

const MAX_REG_SECT: usize = 0xFFFF_FFFA;
const SIGNATURE: u64 = 0xE11A_B1A1_E011_CFD0;
const MINI_STREAM_CUTOFF: usize = 4096;
const MINI_SECTOR_SIZE: usize = 64;

/// Magic bytes at the start of every compound file.
pub(crate) const CFB_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Errors specific to Compound File Binary format parsing
#[derive(Error, Debug)]
pub enum CfbError {
    #[error("The file is corrupted or has an invalid CFB structure")]
    FileFormatError,

    #[error("Invalid OLE signature (not an office document?)")]
    OleSignatureError,

    #[error("Invalid Sector size '2 ^ {1}' for major version '{0}'")]
    SectorSizeError(u16, u16),

    #[error("Sector chain starting at '{0}' is broken or cyclic")]
    SectorChainError(usize),

    #[error("Empty Root directory")]
    RootDirectoryError,
}

/// Kind of a directory entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Storage,
    Stream,
    Root,
}

/// Compound File Binary structure representing the entire OLE file
pub(crate) struct Cfb {
    /// Directory entries keyed by upper-cased name (CFB names compare case-insensitively)
    directories: HashMap<String, Directory>,
    file_allocation_table: Vec<usize>,
    sectors: Sectors,
    mini_file_allocation_table: Vec<usize>,
    mini_sectors: Sectors,
}

impl Cfb {
    /// Checks the leading magic bytes without parsing anything else.
    pub(crate) fn is_cfb(head: &[u8]) -> bool {
        head.starts_with(&CFB_MAGIC)
    }

    /// Loads the complete compound file into memory and parses its directory.
    pub(crate) fn new<RS: Read + Seek>(reader: &mut RS) -> Result<Cfb, IngestError> {
        let size = reader.seek(SeekFrom::End(0))?;
        if size < 512 {
            Err(CfbError::FileFormatError)?;
        }
        reader.seek(SeekFrom::Start(0))?;
        let mut data: Vec<u8> = Vec::with_capacity(size as usize);
        reader.read_to_end(&mut data)?;

        let header = Header::new(&data)?;
        let sectors = Sectors { data, size: header.sector_size()?, behind_header: true };
        let file_allocation_table = Self::load_file_allocation_table(&sectors, &header)?;
        let directories = Self::load_directories(&file_allocation_table, &sectors, header.directory_start)?;
        let mini_file_allocation_table = if header.mini_file_allocation_table_count > 0 {
            let bytes = Self::read_chain(&file_allocation_table, &sectors, header.mini_file_allocation_table_start)?;
            to_usize_iter(&bytes).collect()
        } else {
            Vec::new()
        };
        let mini_sectors = match directories.values().find(|directory| directory.kind == EntryKind::Root) {
            Some(root) => {
                let mut data = Self::read_chain(&file_allocation_table, &sectors, root.start)?;
                data.truncate(root.size);
                Sectors { data, size: MINI_SECTOR_SIZE, behind_header: false }
            }
            None => Sectors { data: Vec::new(), size: MINI_SECTOR_SIZE, behind_header: false },
        };

        Ok(Cfb {
            directories,
            file_allocation_table,
            sectors,
            mini_file_allocation_table,
            mini_sectors,
        })
    }

    /// Checks if a storage or stream with this name exists anywhere in the directory
    pub(crate) fn exists(&self, name: &str) -> bool {
        self.directories.contains_key(&name.to_ascii_uppercase())
    }

    /// Names of all storages and streams, in no particular order
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&str, EntryKind)> + '_ {
        self.directories
            .values()
            .map(|directory| (directory.name.as_str(), directory.kind))
    }

    /// Reads the contents of a stream
    pub(crate) fn read(&self, name: &str) -> Result<Option<Vec<u8>>, IngestError> {
        let directory = match self.directories.get(&name.to_ascii_uppercase()) {
            Some(directory) if directory.kind == EntryKind::Stream => directory,
            _ => return Ok(None),
        };
        let mut bytes = if directory.size < MINI_STREAM_CUTOFF {
            Self::read_chain(&self.mini_file_allocation_table, &self.mini_sectors, directory.start)?
        } else {
            Self::read_chain(&self.file_allocation_table, &self.sectors, directory.start)?
        };
        bytes.truncate(directory.size);
        Ok(Some(bytes))
    }

    /// Loads the file allocation table through the header and the DIFAT chain
    fn load_file_allocation_table(sectors: &Sectors, header: &Header) -> Result<Vec<usize>, IngestError> {
        let mut difat: Vec<usize> = to_usize_iter(sectors.data.get(76..512).ok_or(CfbError::FileFormatError)?).collect();

        let mut index = header.difat_start;
        let mut visited = 0usize;
        while index < MAX_REG_SECT {
            if visited > header.difat_count {
                Err(CfbError::SectorChainError(header.difat_start))?;
            }
            difat.extend(to_usize_iter(sectors.get(index)?));
            index = difat.pop().ok_or(CfbError::FileFormatError)?;
            visited += 1;
        }

        let mut file_allocation_table: Vec<usize> = Vec::new();
        for index in difat.into_iter().filter(|index| *index < MAX_REG_SECT) {
            file_allocation_table.extend(to_usize_iter(sectors.get(index)?));
        }
        if file_allocation_table.is_empty() {
            Err(CfbError::FileFormatError)?;
        }
        Ok(file_allocation_table)
    }

    /// Loads directory entries from the directory sector chain
    fn load_directories(file_allocation_table: &[usize], sectors: &Sectors, start: usize) -> Result<HashMap<String, Directory>, IngestError> {
        let bytes = Self::read_chain(file_allocation_table, sectors, start)?;
        let directories: HashMap<String, Directory> = bytes
            .chunks_exact(128)
            .filter_map(Directory::new)
            .map(|directory| (directory.name.to_ascii_uppercase(), directory))
            .collect();
        if directories.is_empty() {
            Err(CfbError::RootDirectoryError)?
        }
        Ok(directories)
    }

    /// Follows an allocation chain and concatenates its sectors
    fn read_chain(table: &[usize], sectors: &Sectors, start: usize) -> Result<Vec<u8>, IngestError> {
        let mut content: Vec<u8> = Vec::new();
        let mut index = start;
        let mut steps = 0usize;
        while index < MAX_REG_SECT {
            if steps > table.len() {
                Err(CfbError::SectorChainError(start))?;
            }
            content.extend_from_slice(sectors.get(index)?);
            index = *table.get(index).ok_or(CfbError::SectorChainError(start))?;
            steps += 1;
        }
        Ok(content)
    }
}

/// Sector storage: regular sectors are offset by one header-sized sector, mini sectors are not
#[derive(Debug)]
struct Sectors {
    data: Vec<u8>,
    size: usize,
    behind_header: bool,
}

impl Sectors {
    fn get(&self, index: usize) -> Result<&[u8], IngestError> {
        let offset = if self.behind_header { index + 1 } else { index };
        let source = offset.checked_mul(self.size).ok_or(CfbError::FileFormatError)?;
        let target = self.data.len().min(source + self.size);
        if source >= target {
            Err(CfbError::FileFormatError)?
        }
        Ok(&self.data[source..target])
    }
}

/// The fields of the 512-byte header this reader relies on
#[derive(Debug)]
struct Header {
    major_version: u16,
    sector_shift: u16,
    directory_start: usize,
    mini_file_allocation_table_start: usize,
    mini_file_allocation_table_count: usize,
    difat_start: usize,
    difat_count: usize,
}

impl Header {
    fn new(data: &[u8]) -> Result<Self, IngestError> {
        if u64_at(data, 0) != Some(SIGNATURE) {
            Err(CfbError::OleSignatureError)?;
        }
        let field = |at: usize| usize_at(data, at).ok_or(CfbError::FileFormatError);
        Ok(Header {
            major_version: u16_at(data, 26).ok_or(CfbError::FileFormatError)?,
            sector_shift: u16_at(data, 30).ok_or(CfbError::FileFormatError)?,
            directory_start: field(48)?,
            mini_file_allocation_table_start: field(60)?,
            mini_file_allocation_table_count: field(64)?,
            difat_start: field(68)?,
            difat_count: field(72)?,
        })
    }

    fn sector_size(&self) -> Result<usize, IngestError> {
        match (self.major_version, self.sector_shift) {
            (3, 0x0009) => Ok(512),
            (4, 0x000C) => Ok(4096),
            (version, shift) => Err(CfbError::SectorSizeError(version, shift).into()),
        }
    }
}

#[derive(Debug)]
struct Directory {
    name: String,
    kind: EntryKind,
    start: usize,
    size: usize,
}

impl Directory {
    /// Parses one 128-byte directory entry; unused slots yield `None`
    fn new(bytes: &[u8]) -> Option<Directory> {
        let kind = match bytes.get(66)? {
            1 => EntryKind::Storage,
            2 => EntryKind::Stream,
            5 => EntryKind::Root,
            _ => return None,
        };
        let length = (u16_at(bytes, 64)? as usize).min(64);
        let (name, _, _) = UTF_16LE.decode(bytes.get(..length)?);
        let name = match name.find('\0') {
            Some(position) => name[..position].to_owned(),
            None => name.to_string(),
        };
        Some(Directory {
            name,
            kind,
            start: usize_at(bytes, 116)?,
            size: u64_at(bytes, 120)? as usize,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    fn directory_entry(name: &str, kind: u8, start: u32, size: u64) -> [u8; 128] {
        let mut entry = [0u8; 128];
        let mut length = 0;
        for (index, unit) in name.encode_utf16().enumerate() {
            entry[index * 2..index * 2 + 2].copy_from_slice(&unit.to_le_bytes());
            length = (index + 1) * 2;
        }
        entry[64..66].copy_from_slice(&((length + 2) as u16).to_le_bytes());
        entry[66] = kind;
        entry[116..120].copy_from_slice(&start.to_le_bytes());
        entry[120..128].copy_from_slice(&size.to_le_bytes());
        entry
    }

    /// Builds a minimal version-3 compound file holding one large stream plus extra storages.
    pub(crate) fn build(stream_name: &str, stream: &[u8], storages: &[&str]) -> Vec<u8> {
        let stream = {
            let mut padded = stream.to_vec();
            padded.resize(padded.len().max(MINI_STREAM_CUTOFF), 0);
            padded
        };
        let stream_sectors = stream.len().div_ceil(512);
        // sector 0: FAT, sector 1: directory, sectors 2..: stream
        let mut fat = vec![0xFFFF_FFFFu32; 128];
        fat[0] = 0xFFFF_FFFD;
        fat[1] = 0xFFFF_FFFE;
        for index in 0..stream_sectors {
            fat[2 + index] = if index + 1 == stream_sectors { 0xFFFF_FFFE } else { (3 + index) as u32 };
        }

        let mut header = vec![0u8; 512];
        header[0..8].copy_from_slice(&CFB_MAGIC);
        header[26..28].copy_from_slice(&3u16.to_le_bytes());
        header[28..30].copy_from_slice(&0xFFFEu16.to_le_bytes());
        header[30..32].copy_from_slice(&9u16.to_le_bytes());
        header[32..34].copy_from_slice(&6u16.to_le_bytes());
        header[44..48].copy_from_slice(&1u32.to_le_bytes());
        header[48..52].copy_from_slice(&1u32.to_le_bytes());
        header[56..60].copy_from_slice(&4096u32.to_le_bytes());
        header[60..64].copy_from_slice(&0xFFFF_FFFEu32.to_le_bytes());
        header[68..72].copy_from_slice(&0xFFFF_FFFEu32.to_le_bytes());
        for slot in 0..109 {
            let value: u32 = if slot == 0 { 0 } else { 0xFFFF_FFFF };
            header[76 + slot * 4..80 + slot * 4].copy_from_slice(&value.to_le_bytes());
        }

        let mut directory = Vec::new();
        directory.extend_from_slice(&directory_entry("Root Entry", 5, 0xFFFF_FFFE, 0));
        directory.extend_from_slice(&directory_entry(stream_name, 2, 2, stream.len() as u64));
        for storage in storages.iter().take(2) {
            directory.extend_from_slice(&directory_entry(storage, 1, 0, 0));
        }
        directory.resize(512, 0);

        let mut file = header;
        file.extend(fat.iter().flat_map(|value| value.to_le_bytes()));
        file.extend(directory);
        let mut body = stream;
        body.resize(stream_sectors * 512, 0);
        file.extend(body);
        file
    }

    #[test]
    fn reads_stream_and_lists_storages() {
        let payload = b"hello compound file".to_vec();
        let bytes = build("Workbook", &payload, &["_VBA_PROJECT_CUR"]);
        let cfb = Cfb::new(&mut Cursor::new(bytes)).unwrap();

        assert!(cfb.exists("workbook"));
        assert!(cfb.exists("_VBA_PROJECT_CUR"));
        let stream = cfb.read("Workbook").unwrap().unwrap();
        assert!(stream.starts_with(&payload));
        assert!(cfb.read("_VBA_PROJECT_CUR").unwrap().is_none());
        assert!(cfb.entries().any(|(name, kind)| name == "_VBA_PROJECT_CUR" && kind == EntryKind::Storage));
    }

    #[test]
    fn rejects_non_compound_input() {
        let result = Cfb::new(&mut Cursor::new(vec![0u8; 1024]));
        assert!(matches!(result, Err(IngestError::Cfb(CfbError::OleSignatureError))));
        let result = Cfb::new(&mut Cursor::new(vec![0u8; 10]));
        assert!(matches!(result, Err(IngestError::Cfb(CfbError::FileFormatError))));
    }

    #[test]
    fn cyclic_chain_is_an_error_not_a_hang() {
        let mut bytes = build("Workbook", b"x", &[]);
        // point the last stream sector back at the first one
        let fat_offset = 512;
        let last = 2 + MINI_STREAM_CUTOFF.div_ceil(512) - 1;
        bytes[fat_offset + last * 4..fat_offset + last * 4 + 4].copy_from_slice(&2u32.to_le_bytes());
        let cfb = Cfb::new(&mut Cursor::new(bytes)).unwrap();
        assert!(matches!(cfb.read("Workbook"), Err(IngestError::Cfb(CfbError::SectorChainError(2)))));
    }
}
