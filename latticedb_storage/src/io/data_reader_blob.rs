//! Byte-range reads from an in-memory blob; mostly used in tests.

use super::DataReaderTrait;
use anyhow::{Result, ensure};
use async_trait::async_trait;
use latticedb_core::{Blob, ByteRange};

/// Serves byte ranges out of an owned in-memory blob.
#[derive(Debug)]
pub struct DataReaderBlob {
	name: String,
	data: Blob,
}

impl DataReaderBlob {
	pub fn new(name: &str, data: Blob) -> Box<DataReaderBlob> {
		Box::new(DataReaderBlob {
			name: name.to_string(),
			data,
		})
	}
}

#[async_trait]
impl DataReaderTrait for DataReaderBlob {
	async fn read_range(&self, range: &ByteRange) -> Result<Blob> {
		ensure!(
			range.end() <= self.data.len(),
			"range {range:?} exceeds blob size {} in '{}'",
			self.data.len(),
			self.name
		);
		Ok(Blob::from(self.data.read_range(range)))
	}

	async fn read_all(&self) -> Result<Blob> {
		Ok(self.data.clone())
	}

	fn get_name(&self) -> &str {
		&self.name
	}

	fn size(&self) -> u64 {
		self.data.len()
	}
}
