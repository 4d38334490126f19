//! Little-endian primitive writer producing a blob; the counterpart of
//! [`ValueReaderSlice`](super::ValueReaderSlice).

use byteorder::{LittleEndian, WriteBytesExt};
use latticedb_core::Blob;

/// Appends little-endian values to a growing buffer.
#[derive(Default)]
pub struct ValueWriterBlob {
	data: Vec<u8>,
}

impl ValueWriterBlob {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn write_u8(&mut self, value: u8) {
		self.data.push(value);
	}

	pub fn write_u32(&mut self, value: u32) {
		self.data.write_u32::<LittleEndian>(value).unwrap();
	}

	pub fn write_u64(&mut self, value: u64) {
		self.data.write_u64::<LittleEndian>(value).unwrap();
	}

	pub fn write_bytes(&mut self, bytes: &[u8]) {
		self.data.extend_from_slice(bytes);
	}

	/// Writes a `u32` length followed by the bytes.
	pub fn write_len_prefixed(&mut self, bytes: &[u8]) {
		self.write_u32(bytes.len() as u32);
		self.write_bytes(bytes);
	}

	pub fn write_string(&mut self, s: &str) {
		self.write_len_prefixed(s.as_bytes());
	}

	pub fn write_u64_slice(&mut self, values: &[u64]) {
		for v in values {
			self.write_u64(*v);
		}
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	pub fn into_blob(self) -> Blob {
		Blob::from(self.data)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::io::ValueReaderSlice;

	#[test]
	fn test_writer_reader_roundtrip() -> anyhow::Result<()> {
		let mut writer = ValueWriterBlob::new();
		writer.write_u8(9);
		writer.write_u32(77);
		writer.write_u64(123_456);
		writer.write_string("field");
		writer.write_u64_slice(&[1, 2, 3]);
		let blob = writer.into_blob();

		let mut reader = ValueReaderSlice::new(blob.as_slice());
		assert_eq!(reader.read_u8()?, 9);
		assert_eq!(reader.read_u32()?, 77);
		assert_eq!(reader.read_u64()?, 123_456);
		assert_eq!(reader.read_string()?, "field");
		assert_eq!(reader.read_u64_vec(3)?, vec![1, 2, 3]);
		assert!(reader.is_finished());
		Ok(())
	}
}
