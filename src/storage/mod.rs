//! The generic file-storage interface and its S3 implementation.
//!
//! [`Storage`] is the contract application code programs against: open,
//! save, delete, exists, listdir, size, url and timestamps, plus the
//! naming policies with default bodies.  [`s3::S3Storage`] implements it
//! over an object store.

pub mod content;
pub mod file;
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::io::{Read, Seek};

use crate::errors::Result;
use crate::naming;

pub use content::{Content, TextContent, TextSource};
pub use file::StorageFile;
pub use s3::S3Storage;

/// A timestamp as returned by the `get_*_time` family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    /// Timezone-aware, in UTC.
    Aware(DateTime<Utc>),
    /// Naive, in the local timezone.
    Naive(NaiveDateTime),
}

impl Timestamp {
    pub fn is_aware(&self) -> bool {
        matches!(self, Timestamp::Aware(_))
    }
}

/// Generic file storage.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Handle returned by [`Storage::open`].
    type File: Read + Seek + Send;

    async fn open(&self, name: &str, mode: &str) -> Result<Self::File>;

    /// Store `content` under exactly `name` and return the name.
    async fn save_content(&self, name: &str, content: Content<'_>) -> Result<String>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Directory names and file names directly under `path`.
    async fn listdir(&self, path: &str) -> Result<(Vec<String>, Vec<String>)>;

    async fn size(&self, name: &str) -> Result<u64>;

    async fn url(&self, name: &str) -> Result<String>;

    async fn get_modified_time(&self, name: &str) -> Result<Timestamp>;

    async fn get_accessed_time(&self, name: &str) -> Result<Timestamp>;

    async fn get_created_time(&self, name: &str) -> Result<Timestamp>;

    fn get_valid_name(&self, name: &str) -> Result<String> {
        naming::get_valid_name(name)
    }

    /// A name based on `name` that is free in this storage.
    async fn get_available_name(&self, name: &str, max_length: Option<usize>) -> Result<String> {
        naming::available_name(self, name, max_length).await
    }

    fn generate_filename(&self, filename: &str) -> Result<String> {
        naming::generate_filename(filename, |name| self.get_valid_name(name))
    }

    /// Save under an available name derived from `name`; returns the name used.
    async fn save(
        &self,
        name: &str,
        content: Content<'_>,
        max_length: Option<usize>,
    ) -> Result<String> {
        let name = self.get_available_name(name, max_length).await?;
        self.save_content(&name, content).await
    }
}
