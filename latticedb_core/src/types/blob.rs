//! This module provides the [`Blob`] struct, a wrapper around [`Vec<u8>`] used for
//! tile payloads and raw I/O results.
//!
//! # Examples
//!
//! ```rust
//! use latticedb_core::Blob;
//!
//! let vec = vec![0u8, 1, 2, 3, 4, 5, 6, 7];
//! let blob = Blob::from(vec.clone());
//! assert_eq!(blob.len(), 8);
//! assert_eq!(blob.range(2..5), &vec![2, 3, 4]);
//! ```

use super::ByteRange;
use std::fmt::Debug;
use std::ops::Range;

/// A simple wrapper around [`Vec<u8>`] carrying tile bytes and I/O results.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Blob(Vec<u8>);

impl Blob {
	/// Creates an empty `Blob`.
	pub fn new_empty() -> Blob {
		Blob(Vec::new())
	}

	/// Creates a `Blob` of `length` zero bytes.
	pub fn new_sized(length: usize) -> Blob {
		Blob(vec![0u8; length])
	}

	/// Returns the bytes in the half-open `range`.
	pub fn range(&self, range: Range<usize>) -> &[u8] {
		&self.0[range]
	}

	/// Returns the bytes covered by a [`ByteRange`].
	pub fn read_range(&self, range: &ByteRange) -> &[u8] {
		&self.0[range.as_range_usize()]
	}

	/// Returns the contents as a byte slice.
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}

	/// Returns the contents as a mutable byte slice.
	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		&mut self.0
	}

	/// Consumes the blob, returning the underlying vector.
	pub fn into_vec(self) -> Vec<u8> {
		self.0
	}

	/// The number of bytes.
	pub fn len(&self) -> u64 {
		self.0.len() as u64
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl From<Vec<u8>> for Blob {
	fn from(vec: Vec<u8>) -> Self {
		Blob(vec)
	}
}

impl From<&[u8]> for Blob {
	fn from(slice: &[u8]) -> Self {
		Blob(slice.to_vec())
	}
}

impl Debug for Blob {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Blob({} bytes)", self.0.len())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_basic() {
		let blob = Blob::from(vec![1u8, 2, 3, 4, 5]);
		assert_eq!(blob.len(), 5);
		assert!(!blob.is_empty());
		assert_eq!(blob.as_slice(), &[1, 2, 3, 4, 5]);
		assert_eq!(blob.range(1..3), &[2, 3]);
		assert_eq!(blob.read_range(&ByteRange::new(2, 2)), &[3, 4]);
	}

	#[test]
	fn test_empty_and_sized() {
		assert!(Blob::new_empty().is_empty());
		let sized = Blob::new_sized(4);
		assert_eq!(sized.as_slice(), &[0, 0, 0, 0]);
	}

	#[test]
	fn test_into_vec() {
		let blob = Blob::from(vec![7u8, 8]);
		assert_eq!(blob.into_vec(), vec![7, 8]);
	}
}
