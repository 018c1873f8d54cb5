use log::info;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Read an image file in full.
pub fn load(path: &Path) -> Result<Vec<u8>, Error> {
    let data = std::fs::read(path).map_err(|e| Error::Open {
        path: path.to_owned(),
        source: e,
    })?;

    info!(
        "Loaded {} ({} bytes, CRC32 {:#010x})",
        path.display(),
        data.len(),
        checksum(&data)
    );
    Ok(data)
}

/// Create (or truncate) the file a device image will be read into.
pub fn create(path: &Path) -> Result<ChecksumWriter<BufWriter<File>>, Error> {
    let file = File::create(path).map_err(|e| Error::Create {
        path: path.to_owned(),
        source: e,
    })?;
    Ok(ChecksumWriter::new(BufWriter::new(file)))
}

/// CRC32 (IEEE) of an image, for logging.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Passes bytes through to `inner` while keeping a running CRC32 and byte count.
pub struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
    len: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            len: 0,
        }
    }

    /// Flush everything through and return the inner writer, the byte count and the CRC32.
    pub fn finish(mut self) -> std::io::Result<(W, u64, u32)> {
        self.inner.flush()?;
        Ok((self.inner, self.len, self.hasher.finalize()))
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Failures opening or creating image files.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("unable to open file: {}", .path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to create file: {}", .path.display())]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
}
