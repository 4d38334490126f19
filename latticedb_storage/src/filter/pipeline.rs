//! Chunked tile framing and the filter pipeline.
//!
//! Every tile is stored as a sequence of chunks. Each chunk carries a header
//! `{orig_len: u32, filtered_len: u32, metadata_len: u32}` followed by
//! per-filter metadata (currently empty) and the filtered bytes; the frame
//! starts with a `u64` chunk count. Unfiltering is deterministic and
//! preserves the tile's cell count.

use anyhow::{Context, Result, ensure};
use latticedb_core::{Blob, FilterKind, FilterList};

use super::{
	compress_brotli, compress_gzip, compress_zstd, decompress_brotli, decompress_gzip, decompress_zstd,
};
use crate::io::{ValueReaderSlice, ValueWriterBlob};

/// Maximum unfiltered payload of one chunk.
const CHUNK_SIZE: usize = 65_536;

/// Applies and reverses a field's filter list on tile payloads.
#[derive(Debug, Clone, Default)]
pub struct FilterPipeline {
	filters: FilterList,
}

impl FilterPipeline {
	pub fn new(filters: FilterList) -> Self {
		Self { filters }
	}

	pub fn filters(&self) -> &FilterList {
		&self.filters
	}

	fn apply_filters(&self, data: &Blob) -> Result<Blob> {
		let mut current = data.clone();
		for filter in self.filters.iter() {
			current = match filter {
				FilterKind::Gzip => compress_gzip(&current)?,
				FilterKind::Brotli => compress_brotli(&current)?,
				FilterKind::Zstd => compress_zstd(&current)?,
			};
		}
		Ok(current)
	}

	fn reverse_filters(&self, data: &Blob) -> Result<Blob> {
		let mut current = data.clone();
		for filter in self.filters.iter().rev() {
			current = match filter {
				FilterKind::Gzip => decompress_gzip(&current)?,
				FilterKind::Brotli => decompress_brotli(&current)?,
				FilterKind::Zstd => decompress_zstd(&current)?,
			};
		}
		Ok(current)
	}

	/// Frames and filters a logical tile for storage.
	pub fn filter(&self, tile: &Blob) -> Result<Blob> {
		let payload = tile.as_slice();
		let chunks: Vec<&[u8]> = if payload.is_empty() {
			Vec::new()
		} else {
			payload.chunks(CHUNK_SIZE).collect()
		};

		let mut writer = ValueWriterBlob::new();
		writer.write_u64(chunks.len() as u64);
		for chunk in chunks {
			let filtered = self.apply_filters(&Blob::from(chunk))?;
			writer.write_u32(chunk.len() as u32);
			writer.write_u32(filtered.len() as u32);
			writer.write_u32(0); // metadata_len
			writer.write_bytes(filtered.as_slice());
		}
		Ok(writer.into_blob())
	}

	/// Reverses [`FilterPipeline::filter`], returning the logical tile.
	pub fn unfilter(&self, framed: &Blob) -> Result<Blob> {
		let mut reader = ValueReaderSlice::new(framed.as_slice());
		let chunk_num = reader.read_u64().context("tile frame is truncated")?;

		let mut out = Vec::new();
		for chunk_idx in 0..chunk_num {
			let orig_len = reader.read_u32()? as usize;
			let filtered_len = reader.read_u32()? as usize;
			let metadata_len = reader.read_u32()? as usize;
			reader.read_bytes(metadata_len)?;
			let filtered = reader.read_bytes(filtered_len)?;
			let plain = self
				.reverse_filters(&Blob::from(filtered))
				.with_context(|| format!("failed to unfilter chunk {chunk_idx}"))?;
			ensure!(
				plain.len() as usize == orig_len,
				"chunk {chunk_idx} unfiltered to {} bytes, expected {orig_len}",
				plain.len()
			);
			out.extend_from_slice(plain.as_slice());
		}
		ensure!(reader.is_finished(), "trailing bytes after the last tile chunk");
		Ok(Blob::from(out))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	fn pipeline(kinds: &[FilterKind]) -> FilterPipeline {
		FilterPipeline::new(FilterList::new(kinds.to_vec()))
	}

	#[rstest]
	#[case::plain(&[])]
	#[case::gzip(&[FilterKind::Gzip])]
	#[case::zstd(&[FilterKind::Zstd])]
	#[case::stacked(&[FilterKind::Zstd, FilterKind::Gzip])]
	fn test_roundtrip(#[case] kinds: &[FilterKind]) -> Result<()> {
		let pipeline = pipeline(kinds);
		let tile = Blob::from((0..200_000u32).flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>());
		let framed = pipeline.filter(&tile)?;
		assert_eq!(pipeline.unfilter(&framed)?, tile);
		Ok(())
	}

	#[test]
	fn test_empty_tile() -> Result<()> {
		let pipeline = pipeline(&[FilterKind::Gzip]);
		let framed = pipeline.filter(&Blob::new_empty())?;
		assert_eq!(pipeline.unfilter(&framed)?, Blob::new_empty());
		Ok(())
	}

	#[test]
	fn test_corrupt_frame_fails() {
		let pipeline = pipeline(&[FilterKind::Gzip]);
		let tile = Blob::from(vec![1u8; 1000]);
		let mut framed = pipeline.filter(&tile).unwrap().into_vec();
		let last = framed.len() - 1;
		framed[last] ^= 0xff;
		assert!(pipeline.unfilter(&Blob::from(framed)).is_err());
	}

	#[test]
	fn test_truncated_frame_fails() {
		let pipeline = pipeline(&[]);
		let tile = Blob::from(vec![7u8; 100]);
		let framed = pipeline.filter(&tile).unwrap().into_vec();
		let truncated = Blob::from(&framed[..framed.len() - 10]);
		assert!(pipeline.unfilter(&truncated).is_err());
	}
}
