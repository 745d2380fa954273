//! s3-file-storage: a file-storage adapter over S3-compatible object stores.
//!
//! Application code addresses files by `scheme://bucket/path` names and
//! uses the generic [`storage::Storage`] operations (open, save, delete,
//! exists, listdir, size, url, timestamps).  [`storage::S3Storage`] maps
//! them onto object-store calls, compressing eligible content on the way
//! in and routing each scheme to its own endpoint and credentials.

pub mod client;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod naming;
pub mod path;
pub mod registry;
pub mod storage;

pub use config::{Config, SettingValue, Settings, SettingsLayer};
pub use errors::{Result, StorageError};
pub use storage::{Content, S3Storage, Storage, StorageFile, TextContent, Timestamp};
