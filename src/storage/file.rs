//! File handles returned by [`S3Storage::open`](super::s3::S3Storage).
//!
//! The whole object is downloaded into a spooled temporary buffer so the
//! handle can seek.  Gzip-encoded objects are decoded on the fly; seeking
//! backwards in one restarts the decoder.

use flate2::read::GzDecoder;
use std::io::{self, Read, Seek, SeekFrom};
use tempfile::SpooledTempFile;

use super::s3::S3Storage;
use crate::errors::Result;

/// Local copy of a downloaded object.
pub enum FileBody {
    Plain(SpooledTempFile),
    Gzip(GzipReader),
}

impl Read for FileBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileBody::Plain(file) => file.read(buf),
            FileBody::Gzip(reader) => reader.read(buf),
        }
    }
}

impl Seek for FileBody {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            FileBody::Plain(file) => file.seek(pos),
            FileBody::Gzip(reader) => reader.seek(pos),
        }
    }
}

/// Seekable reader over gzip-compressed bytes.
pub struct GzipReader {
    // Only `None` while the decoder is being restarted.
    decoder: Option<GzDecoder<SpooledTempFile>>,
    pos: u64,
}

impl GzipReader {
    /// Decode `file` from its current position.
    pub fn new(file: SpooledTempFile) -> Self {
        Self {
            decoder: Some(GzDecoder::new(file)),
            pos: 0,
        }
    }

    fn decoder_mut(&mut self) -> io::Result<&mut GzDecoder<SpooledTempFile>> {
        self.decoder
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "gzip decoder lost"))
    }

    fn restart(&mut self) -> io::Result<()> {
        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "gzip decoder lost"))?;
        let mut file = decoder.into_inner();
        file.seek(SeekFrom::Start(0))?;
        self.decoder = Some(GzDecoder::new(file));
        self.pos = 0;
        Ok(())
    }

    /// Decode and discard up to `n` bytes.
    fn skip(&mut self, n: u64) -> io::Result<()> {
        let decoder = self.decoder_mut()?;
        let skipped = io::copy(&mut decoder.by_ref().take(n), &mut io::sink())?;
        self.pos += skipped;
        Ok(())
    }
}

impl Read for GzipReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.decoder_mut()?.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for GzipReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                self.skip(u64::MAX)?;
                self.pos.checked_add_signed(delta)
            }
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;

        if target < self.pos {
            self.restart()?;
        }
        self.skip(target - self.pos)?;
        Ok(self.pos)
    }
}

/// A read-only handle on a stored object.
///
/// Closing drops the local copy.  Reopening a closed handle downloads the
/// object again; reopening an open one rewinds it.
///
/// Seeking past the end of a gzip-encoded object stops at the end of the
/// decoded data and returns that position; a plain object reports the
/// requested position.
pub struct StorageFile {
    name: String,
    storage: S3Storage,
    body: Option<FileBody>,
}

impl StorageFile {
    pub(crate) fn new(name: &str, storage: S3Storage, body: FileBody) -> Self {
        Self {
            name: name.to_string(),
            storage,
            body: Some(body),
        }
    }

    /// Storage name this handle was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> &'static str {
        "rb"
    }

    pub fn is_closed(&self) -> bool {
        self.body.is_none()
    }

    pub fn close(&mut self) {
        self.body = None;
    }

    pub async fn open(&mut self) -> Result<()> {
        match self.body.as_mut() {
            Some(body) => {
                body.seek(SeekFrom::Start(0))?;
            }
            None => {
                self.body = Some(self.storage.download(&self.name).await?);
            }
        }
        Ok(())
    }

    fn body_mut(&mut self) -> io::Result<&mut FileBody> {
        self.body
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "I/O operation on closed file"))
    }
}

impl Read for StorageFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body_mut()?.read(buf)
    }
}

impl Seek for StorageFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.body_mut()?.seek(pos)
    }
}

// -- Tests -------------------------------------------------------------------
