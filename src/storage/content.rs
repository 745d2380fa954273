//! Upload bodies: content sources, temporary buffers and the gzip policy.
//!
//! A save hands over either a seekable byte source or a text source.
//! Text is re-encoded as UTF-8 into a spooled temporary buffer first.
//! The bytes are then gzipped into a second buffer when the content type
//! is compressible, and the compressed copy is kept only if it is
//! strictly smaller than the original.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Seek, SeekFrom, Write};
use tempfile::SpooledTempFile;

use crate::client::backend::ReadSeek;

/// Temporary buffers stay in memory up to this size, then spill to disk.
pub const SPOOL_MAX_SIZE: usize = 10 * 1024 * 1024;

/// Upper bound on the bytes of text re-encoded per chunk.
const TEXT_CHUNK_SIZE: usize = 64 * 1024;

/// Fallback when the extension gives no content type.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Subtypes compressed in addition to every `text/*` type.
const COMPRESSIBLE_SUBTYPES: &[&str] = &["xml", "json", "html", "javascript"];

/// A new spooled temporary buffer.
pub fn new_temporary_file() -> SpooledTempFile {
    tempfile::spooled_tempfile(SPOOL_MAX_SIZE)
}

/// A rewindable source of text.
pub trait TextSource: Send {
    /// Go back to the start of the text.
    fn rewind(&mut self) -> io::Result<()>;

    /// Next chunk of text, `None` at the end.
    fn next_chunk(&mut self) -> io::Result<Option<String>>;
}

/// In-memory text handed out in bounded chunks.
#[derive(Debug, Clone, Default)]
pub struct TextContent {
    text: String,
    pos: usize,
}

impl TextContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            pos: 0,
        }
    }
}

impl TextSource for TextContent {
    fn rewind(&mut self) -> io::Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn next_chunk(&mut self) -> io::Result<Option<String>> {
        if self.pos >= self.text.len() {
            return Ok(None);
        }
        let mut end = (self.pos + TEXT_CHUNK_SIZE).min(self.text.len());
        while !self.text.is_char_boundary(end) {
            end -= 1;
        }
        let chunk = self.text[self.pos..end].to_string();
        self.pos = end;
        Ok(Some(chunk))
    }
}

/// Content passed to a save.  The caller keeps ownership of the source.
pub enum Content<'a> {
    Bytes(&'a mut dyn ReadSeek),
    Text(&'a mut dyn TextSource),
}

/// The buffer an upload reads from.
pub enum UploadBody<'a> {
    /// The caller's own source, rewound.
    Borrowed(&'a mut dyn ReadSeek),
    /// A temporary buffer owned by the save; dropped when it returns.
    Owned(SpooledTempFile),
}

impl UploadBody<'_> {
    pub fn as_reader(&mut self) -> &mut dyn ReadSeek {
        match self {
            UploadBody::Borrowed(reader) => &mut **reader,
            UploadBody::Owned(file) => file,
        }
    }
}

/// A body ready to upload.
pub struct PreparedUpload<'a> {
    pub body: UploadBody<'a>,
    /// Original length when the body was gzipped.
    pub uncompressed_size: Option<u64>,
}

/// Content type for a file name, guessed from its extension.
pub fn content_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

/// Whether content of this type is worth compressing.
///
/// `text/*` always is.  Otherwise the subtype, taken after any `+`
/// (`application/ld+json` → `json`), must be in the allow-list.
pub fn is_compressible(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    let Some((family, subtype)) = essence.split_once('/') else {
        return false;
    };
    if family.eq_ignore_ascii_case("text") {
        return true;
    }
    let subtype = subtype.rsplit('+').next().unwrap_or(subtype);
    COMPRESSIBLE_SUBTYPES
        .iter()
        .any(|allowed| subtype.eq_ignore_ascii_case(allowed))
}

/// Rewind `content`, materialise text, and gzip it when `compress` is set
/// and the result is smaller.
pub fn prepare_upload(content: Content<'_>, compress: bool) -> io::Result<PreparedUpload<'_>> {
    let mut body = match content {
        Content::Bytes(reader) => {
            reader.seek(SeekFrom::Start(0))?;
            UploadBody::Borrowed(reader)
        }
        Content::Text(text) => {
            text.rewind()?;
            let mut file = new_temporary_file();
            while let Some(chunk) = text.next_chunk()? {
                file.write_all(chunk.as_bytes())?;
            }
            file.seek(SeekFrom::Start(0))?;
            UploadBody::Owned(file)
        }
    };

    if !compress {
        return Ok(PreparedUpload {
            body,
            uncompressed_size: None,
        });
    }

    let reader = body.as_reader();
    let mut encoder = GzEncoder::new(new_temporary_file(), Compression::best());
    io::copy(&mut *reader, &mut encoder)?;
    let original_size = reader.stream_position()?;
    let mut compressed = encoder.finish()?;
    let compressed_size = compressed.stream_position()?;

    if compressed_size < original_size {
        compressed.seek(SeekFrom::Start(0))?;
        Ok(PreparedUpload {
            body: UploadBody::Owned(compressed),
            uncompressed_size: Some(original_size),
        })
    } else {
        reader.seek(SeekFrom::Start(0))?;
        Ok(PreparedUpload {
            body,
            uncompressed_size: None,
        })
    }
}

// -- Tests -------------------------------------------------------------------
