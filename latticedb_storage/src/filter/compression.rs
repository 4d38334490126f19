//! Compression codecs used by tile filters.

use anyhow::{Context, Result};
use brotli::{BrotliCompress, BrotliDecompress, enc::BrotliEncoderParams};
use flate2::bufread::{GzDecoder, GzEncoder};
use latticedb_core::Blob;
use std::io::{Cursor, Read};

/// Compresses data using Gzip.
pub fn compress_gzip(blob: &Blob) -> Result<Blob> {
	let mut encoder = GzEncoder::new(blob.as_slice(), flate2::Compression::default());
	let mut compressed_data = Vec::new();
	encoder
		.read_to_end(&mut compressed_data)
		.context("failed to compress data using Gzip")?;
	Ok(Blob::from(compressed_data))
}

/// Decompresses data that was compressed using Gzip.
pub fn decompress_gzip(blob: &Blob) -> Result<Blob> {
	let mut decoder = GzDecoder::new(blob.as_slice());
	let mut decompressed_data = Vec::new();
	decoder
		.read_to_end(&mut decompressed_data)
		.context("failed to decompress data using Gzip")?;
	Ok(Blob::from(decompressed_data))
}

/// Compresses data using Brotli.
pub fn compress_brotli(blob: &Blob) -> Result<Blob> {
	let params = BrotliEncoderParams {
		quality: 5,
		lgwin: 19,
		size_hint: blob.len() as usize,
		..Default::default()
	};
	let mut input = Cursor::new(blob.as_slice());
	let mut output = Vec::new();
	BrotliCompress(&mut input, &mut output, &params).context("failed to compress data using Brotli")?;
	Ok(Blob::from(output))
}

/// Decompresses data that was compressed using Brotli.
pub fn decompress_brotli(blob: &Blob) -> Result<Blob> {
	let mut cursor = Cursor::new(blob.as_slice());
	let mut decompressed_data = Vec::new();
	BrotliDecompress(&mut cursor, &mut decompressed_data).context("failed to decompress data using Brotli")?;
	Ok(Blob::from(decompressed_data))
}

/// Compresses data using Zstd.
pub fn compress_zstd(blob: &Blob) -> Result<Blob> {
	let compressed =
		zstd::encode_all(Cursor::new(blob.as_slice()), 3).context("failed to compress data using Zstd")?;
	Ok(Blob::from(compressed))
}

/// Decompresses data that was compressed using Zstd.
pub fn decompress_zstd(blob: &Blob) -> Result<Blob> {
	let decompressed =
		zstd::decode_all(Cursor::new(blob.as_slice())).context("failed to decompress data using Zstd")?;
	Ok(Blob::from(decompressed))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn generate_test_data(size: usize) -> Blob {
		let data: Vec<u8> = (0..size).map(|i| ((i * 7 + i / 13) % 251) as u8).collect();
		Blob::from(data)
	}

	#[test]
	fn test_gzip_roundtrip() -> Result<()> {
		let data = generate_test_data(10_000);
		assert_eq!(decompress_gzip(&compress_gzip(&data)?)?, data);
		Ok(())
	}

	#[test]
	fn test_brotli_roundtrip() -> Result<()> {
		let data = generate_test_data(10_000);
		assert_eq!(decompress_brotli(&compress_brotli(&data)?)?, data);
		Ok(())
	}

	#[test]
	fn test_zstd_roundtrip() -> Result<()> {
		let data = generate_test_data(10_000);
		assert_eq!(decompress_zstd(&compress_zstd(&data)?)?, data);
		Ok(())
	}

	#[test]
	fn test_garbage_fails_to_decompress() {
		let garbage = Blob::from(vec![1u8, 2, 3, 4, 5]);
		assert!(decompress_gzip(&garbage).is_err());
		assert!(decompress_zstd(&garbage).is_err());
	}
}
