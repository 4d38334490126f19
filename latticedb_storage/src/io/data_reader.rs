//! This module defines the `DataReaderTrait` for reading byte ranges from
//! various sources.
//!
//! The read core consumes exactly this contract from the filesystem: read a
//! byte range, read everything, report a name and a size. Backends exist for
//! local files and in-memory blobs; object stores would implement the same
//! trait.

use anyhow::Result;
use async_trait::async_trait;
use latticedb_core::{Blob, ByteRange};
use std::fmt::Debug;

/// Type alias for a boxed dynamic implementation of the `DataReaderTrait`.
pub type DataReader = Box<dyn DataReaderTrait>;

/// A trait for reading byte ranges from a data source.
#[async_trait]
pub trait DataReaderTrait: Debug + Send + Sync {
	/// Reads a specific range of bytes from the data source.
	async fn read_range(&self, range: &ByteRange) -> Result<Blob>;

	/// Reads all the data from the data source.
	async fn read_all(&self) -> Result<Blob>;

	/// The name of the data source, e.g. its path.
	fn get_name(&self) -> &str;

	/// The total size of the data source in bytes.
	fn size(&self) -> u64;
}
