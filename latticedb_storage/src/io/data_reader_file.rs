//! Byte-range reads from local files.

use super::DataReaderTrait;
use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use latticedb_core::{Blob, ByteRange};
use std::{
	fs::File,
	io::{Read, Seek, SeekFrom},
	path::Path,
};

/// Reads byte ranges from a local file.
#[derive(Debug)]
pub struct DataReaderFile {
	name: String,
	file: File,
	size: u64,
}

impl DataReaderFile {
	/// Opens a file and creates a `DataReaderFile` instance.
	pub fn open(path: &Path) -> Result<Box<DataReaderFile>> {
		ensure!(path.exists(), "file {path:?} does not exist");
		ensure!(path.is_file(), "path {path:?} must be a file");

		let file = File::open(path).with_context(|| format!("failed to open {path:?}"))?;
		let size = file.metadata()?.len();

		Ok(Box::new(DataReaderFile {
			name: path.to_string_lossy().into_owned(),
			file,
			size,
		}))
	}
}

#[async_trait]
impl DataReaderTrait for DataReaderFile {
	async fn read_range(&self, range: &ByteRange) -> Result<Blob> {
		let mut buffer = vec![0; range.length as usize];
		let mut file = self
			.file
			.try_clone()
			.with_context(|| format!("failed to clone file '{}'", self.name))?;
		file
			.seek(SeekFrom::Start(range.offset))
			.with_context(|| format!("failed to seek to offset {} in file '{}'", range.offset, self.name))?;
		file.read_exact(&mut buffer).with_context(|| {
			format!(
				"failed to read {} bytes at offset {} in file '{}'",
				range.length, range.offset, self.name
			)
		})?;
		Ok(Blob::from(buffer))
	}

	async fn read_all(&self) -> Result<Blob> {
		self.read_range(&ByteRange::new(0, self.size)).await
	}

	fn get_name(&self) -> &str {
		&self.name
	}

	fn size(&self) -> u64 {
		self.size
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_read_range_and_all() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = dir.path().join("data.bin");
		std::fs::write(&path, b"hello byte range reader")?;

		let reader = DataReaderFile::open(&path)?;
		assert_eq!(reader.size(), 23);
		assert_eq!(reader.read_range(&ByteRange::new(6, 4)).await?.as_slice(), b"byte");
		assert_eq!(reader.read_all().await?.len(), 23);
		Ok(())
	}

	#[tokio::test]
	async fn test_missing_file_fails() {
		assert!(DataReaderFile::open(Path::new("/does/not/exist")).is_err());
	}

	#[tokio::test]
	async fn test_read_past_end_fails() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = dir.path().join("data.bin");
		std::fs::write(&path, b"abc")?;
		let reader = DataReaderFile::open(&path)?;
		assert!(reader.read_range(&ByteRange::new(2, 10)).await.is_err());
		Ok(())
	}
}
