use crate::error::IngestError;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use std::fmt::Display;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

/// SHA-256 of the file content, hex encoded.
pub fn file_fingerprint(path: &Path) -> Result<String, IngestError> {
    let mut file = File::open(path).map_err(|error| IngestError::UnreadableFile {
        path: path.display().to_string(),
        reason: error.to_string(),
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Identity of one cached computation: which file, in which state, under which options.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// `hash(absolute_path, fingerprint, options)`
    pub digest: String,
    pub path: PathBuf,
    pub fingerprint: String,
}

impl CacheKey {
    /// `options` must already be in canonical form: equal option sets give equal strings.
    pub fn new(path: &Path, fingerprint: &str, options: &str) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(fingerprint.as_bytes());
        hasher.update([0]);
        hasher.update(options.as_bytes());
        CacheKey {
            digest: format!("{:x}", hasher.finalize()),
            path: path.to_path_buf(),
            fingerprint: fingerprint.to_owned(),
        }
    }

    /// Resolves `path` to an absolute path and fingerprints its current content.
    pub fn for_file(path: &Path, options: &str) -> Result<CacheKey, IngestError> {
        let absolute = std::fs::canonicalize(path).map_err(|error| IngestError::UnreadableFile {
            path: path.display().to_string(),
            reason: error.to_string(),
        })?;
        let fingerprint = file_fingerprint(&absolute)?;
        Ok(CacheKey::new(&absolute, &fingerprint, options))
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.digest[..self.digest.len().min(12)])
    }
}
