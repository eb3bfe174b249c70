use std::fs;
use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::QuoremError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub type Archive = ZipArchive<fs::File>;

pub fn open_archive(zip_path: &Path) -> Result<Archive, QuoremError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| QuoremError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    ZipArchive::new(file).map_err(|err| QuoremError::Archive(err.to_string()))
}

/// Names of the file entries in the archive, in archive order.
pub fn archive_entries(archive: &mut Archive) -> Result<Vec<String>, QuoremError> {
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|err| QuoremError::Archive(err.to_string()))?;
        if entry.enclosed_name().is_none() {
            return Err(QuoremError::Archive(
                "zip entry path traversal detected".to_string(),
            ));
        }
        if !entry.is_dir() {
            names.push(entry.name().to_string());
        }
    }
    Ok(names)
}

pub fn read_entry(archive: &mut Archive, name: &str) -> Result<Vec<u8>, QuoremError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|err| QuoremError::Archive(format!("{name}: {err}")))?;
    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(|err| QuoremError::Archive(format!("{name}: {err}")))?;
    Ok(content)
}

pub fn read_entry_string(archive: &mut Archive, name: &str) -> Result<String, QuoremError> {
    String::from_utf8(read_entry(archive, name)?)
        .map_err(|err| QuoremError::Archive(format!("{name}: {err}")))
}

/// Reads every entry through so that a truncated or corrupt upload fails
/// before any record is written.
pub fn validate_zip(zip_path: &Path) -> Result<(), QuoremError> {
    let mut archive = open_archive(zip_path)?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| QuoremError::Archive(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| QuoremError::Archive(err.to_string()))?;
    }
    Ok(())
}

pub fn is_gzip(path: &Path, content: &[u8]) -> bool {
    path.extension().is_some_and(|ext| ext == "gz") || content.starts_with(&GZIP_MAGIC)
}

/// Reads a text file, decompressing it when it is gzipped.
pub fn read_text(path: &Path) -> Result<String, QuoremError> {
    let content = fs::read(path)
        .map_err(|err| QuoremError::Filesystem(format!("read {}: {err}", path.display())))?;
    if !is_gzip(path, &content) {
        return String::from_utf8(content)
            .map_err(|err| QuoremError::Table(format!("{}: {err}", path.display())));
    }
    let mut text = String::new();
    GzDecoder::new(content.as_slice())
        .read_to_string(&mut text)
        .map_err(|err| QuoremError::Table(format!("{}: {err}", path.display())))?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn reads_gzipped_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.tsv.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"sample_id\tph\nS1\t7.2\n").unwrap();
        fs::write(&path, encoder.finish().unwrap()).unwrap();
        assert_eq!(read_text(&path).unwrap(), "sample_id\tph\nS1\t7.2\n");
    }

    #[test]
    fn reads_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.csv");
        fs::write(&path, "sample_id,ph\n").unwrap();
        assert_eq!(read_text(&path).unwrap(), "sample_id,ph\n");
    }
}
