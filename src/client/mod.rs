//! Object-store clients.
//!
//! The adapter talks to S3 only through the [`backend::ObjectClient`]
//! trait.  [`aws::S3Client`] is the production client; [`memory::MemoryClient`]
//! keeps buckets in process for tests and local development.

pub mod aws;
pub mod backend;
pub mod memory;

pub use backend::ObjectClient;
