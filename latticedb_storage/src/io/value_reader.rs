//! Little-endian primitive reader over a byte slice, used to parse fragment
//! metadata.

use anyhow::{Result, ensure};
use byteorder::{ByteOrder, LittleEndian};

/// Reads little-endian values sequentially from a slice.
pub struct ValueReaderSlice<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> ValueReaderSlice<'a> {
	pub fn new(data: &'a [u8]) -> Self {
		Self { data, pos: 0 }
	}

	pub fn position(&self) -> usize {
		self.pos
	}

	pub fn remaining(&self) -> usize {
		self.data.len() - self.pos
	}

	pub fn is_finished(&self) -> bool {
		self.remaining() == 0
	}

	fn take(&mut self, len: usize) -> Result<&'a [u8]> {
		ensure!(
			self.remaining() >= len,
			"unexpected end of data: need {len} bytes at position {}, {} remaining",
			self.pos,
			self.remaining()
		);
		let slice = &self.data[self.pos..self.pos + len];
		self.pos += len;
		Ok(slice)
	}

	pub fn read_u8(&mut self) -> Result<u8> {
		Ok(self.take(1)?[0])
	}

	pub fn read_u32(&mut self) -> Result<u32> {
		Ok(LittleEndian::read_u32(self.take(4)?))
	}

	pub fn read_u64(&mut self) -> Result<u64> {
		Ok(LittleEndian::read_u64(self.take(8)?))
	}

	pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
		self.take(len)
	}

	/// Reads a `u32` length followed by that many bytes.
	pub fn read_len_prefixed(&mut self) -> Result<&'a [u8]> {
		let len = self.read_u32()? as usize;
		self.take(len)
	}

	/// Reads a string encoded as a `u32` length and UTF-8 bytes.
	pub fn read_string(&mut self) -> Result<String> {
		let bytes = self.read_len_prefixed()?;
		Ok(String::from_utf8(bytes.to_vec())?)
	}

	/// Reads `n` consecutive `u64` values.
	pub fn read_u64_vec(&mut self, n: usize) -> Result<Vec<u64>> {
		let bytes = self.take(n * 8)?;
		let mut out = Vec::with_capacity(n);
		for i in 0..n {
			out.push(LittleEndian::read_u64(&bytes[i * 8..]));
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_sequential_reads() -> Result<()> {
		let mut data = Vec::new();
		data.push(7u8);
		data.extend_from_slice(&42u32.to_le_bytes());
		data.extend_from_slice(&1_000_000u64.to_le_bytes());
		data.extend_from_slice(&3u32.to_le_bytes());
		data.extend_from_slice(b"abc");

		let mut reader = ValueReaderSlice::new(&data);
		assert_eq!(reader.read_u8()?, 7);
		assert_eq!(reader.read_u32()?, 42);
		assert_eq!(reader.read_u64()?, 1_000_000);
		assert_eq!(reader.read_string()?, "abc");
		assert!(reader.is_finished());
		Ok(())
	}

	#[test]
	fn test_overrun_fails() {
		let mut reader = ValueReaderSlice::new(&[1, 2]);
		assert!(reader.read_u32().is_err());
	}

	#[test]
	fn test_u64_vec() -> Result<()> {
		let mut data = Vec::new();
		for v in [5u64, 6, 7] {
			data.extend_from_slice(&v.to_le_bytes());
		}
		let mut reader = ValueReaderSlice::new(&data);
		assert_eq!(reader.read_u64_vec(3)?, vec![5, 6, 7]);
		Ok(())
	}
}
