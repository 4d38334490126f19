//! Fragment metadata: directory naming, binary (de)serialization and
//! fragment-catalog listing.
//!
//! A fragment is a directory named `__<t1>_<t2>_<id>_<version>` holding one
//! data file per field component plus `__fragment_metadata.ldb`. Fragments
//! are ordered by the end of their timestamp range, then by directory name;
//! a later fragment overwrites an earlier one on the same coordinates
//! (unless the array allows duplicates).

use anyhow::{Context, Result, bail, ensure};
use latticedb_core::{ArraySchema, Blob, COORDS_FIELD, MIN_READABLE_VERSION, NDRange, TypedRange};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::io::{DataReaderFile, DataReaderTrait, ValueReaderSlice, ValueWriterBlob};

/// Name of the metadata file inside a fragment directory.
pub const METADATA_FILE: &str = "__fragment_metadata.ldb";

const METADATA_MAGIC: &[u8; 4] = b"LDBF";

/// Per-tile on-disk addresses of one field component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTileAddresses {
	pub offsets: Vec<u64>,
	pub sizes: Vec<u64>,
}

impl FieldTileAddresses {
	pub fn tile_range(&self, tile_idx: u64) -> latticedb_core::ByteRange {
		latticedb_core::ByteRange::new(self.offsets[tile_idx as usize], self.sizes[tile_idx as usize])
	}
}

/// On-disk layout of one field inside a fragment.
///
/// For fixed-size fields `primary` addresses the value tiles; for var-sized
/// fields it addresses the offsets tiles and `var` the var payload tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
	pub name: String,
	pub primary: FieldTileAddresses,
	pub var: Option<FieldTileAddresses>,
	pub validity: Option<FieldTileAddresses>,
}

impl FieldMeta {
	pub fn is_var_sized(&self) -> bool {
		self.var.is_some()
	}

	/// File name of the primary component.
	pub fn primary_file(&self) -> String {
		if self.is_var_sized() {
			format!("{}_offs.dat", self.name)
		} else {
			format!("{}.dat", self.name)
		}
	}

	pub fn var_file(&self) -> String {
		format!("{}_var.dat", self.name)
	}

	pub fn validity_file(&self) -> String {
		format!("{}_validity.dat", self.name)
	}

	/// Total on-disk bytes of one tile across all components.
	pub fn tile_disk_size(&self, tile_idx: u64) -> u64 {
		let t = tile_idx as usize;
		self.primary.sizes[t]
			+ self.var.as_ref().map_or(0, |a| a.sizes[t])
			+ self.validity.as_ref().map_or(0, |a| a.sizes[t])
	}
}

/// The read-only metadata of one fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentMetadata {
	pub name: String,
	pub path: PathBuf,
	pub version: u32,
	pub dense: bool,
	pub timestamp_range: (u64, u64),
	pub tile_count: u64,
	pub cell_counts: Vec<u64>,
	pub non_empty_domain: NDRange,
	/// Per-tile minimum bounding rectangles; sparse fragments only.
	pub mbrs: Vec<NDRange>,
	fields: Vec<FieldMeta>,
}

impl FragmentMetadata {
	pub fn new(
		name: String,
		path: PathBuf,
		version: u32,
		dense: bool,
		timestamp_range: (u64, u64),
		cell_counts: Vec<u64>,
		non_empty_domain: NDRange,
		mbrs: Vec<NDRange>,
		fields: Vec<FieldMeta>,
	) -> Self {
		Self {
			name,
			path,
			version,
			dense,
			timestamp_range,
			tile_count: cell_counts.len() as u64,
			cell_counts,
			non_empty_domain,
			mbrs,
			fields,
		}
	}

	/// `true` when the fragment stores one interleaved coordinate tile
	/// instead of per-dimension tiles.
	pub fn has_zipped_coords(&self) -> bool {
		self.version < 5
	}

	pub fn fields(&self) -> &[FieldMeta] {
		&self.fields
	}

	pub fn field(&self, name: &str) -> Option<&FieldMeta> {
		self.fields.iter().find(|f| f.name == name)
	}

	pub fn cell_count(&self, tile_idx: u64) -> u64 {
		self.cell_counts[tile_idx as usize]
	}

	pub fn tile_mbr(&self, tile_idx: u64) -> &NDRange {
		&self.mbrs[tile_idx as usize]
	}

	/// Approximate resident size, used for metadata memory accounting.
	pub fn mem_size(&self) -> u64 {
		let addresses: u64 = self
			.fields
			.iter()
			.map(|f| {
				let per = (f.primary.offsets.len() * 16) as u64;
				per * (1 + u64::from(f.var.is_some()) + u64::from(f.validity.is_some()))
			})
			.sum();
		let mbrs: u64 = self
			.mbrs
			.iter()
			.flat_map(|r| r.iter())
			.map(|r| (r.start_bytes().len() + r.end_bytes().len()) as u64)
			.sum();
		addresses + mbrs + self.cell_counts.len() as u64 * 8
	}

	/// Serializes everything except the directory name (which carries the
	/// timestamps and version).
	pub fn serialize(&self) -> Blob {
		let mut w = ValueWriterBlob::new();
		w.write_bytes(METADATA_MAGIC);
		w.write_u32(self.version);
		w.write_u8(u8::from(self.dense));
		w.write_u32(self.non_empty_domain.len() as u32);
		w.write_u64(self.tile_count);
		w.write_u64_slice(&self.cell_counts);
		for range in &self.non_empty_domain {
			w.write_len_prefixed(range.start_bytes());
			w.write_len_prefixed(range.end_bytes());
		}
		w.write_u64(self.mbrs.len() as u64);
		for mbr in &self.mbrs {
			for range in mbr {
				w.write_len_prefixed(range.start_bytes());
				w.write_len_prefixed(range.end_bytes());
			}
		}
		w.write_u32(self.fields.len() as u32);
		for field in &self.fields {
			w.write_string(&field.name);
			w.write_u8(u8::from(field.var.is_some()));
			w.write_u8(u8::from(field.validity.is_some()));
			for addresses in [Some(&field.primary), field.var.as_ref(), field.validity.as_ref()]
				.into_iter()
				.flatten()
			{
				w.write_u64_slice(&addresses.offsets);
				w.write_u64_slice(&addresses.sizes);
			}
		}
		w.into_blob()
	}

	/// Parses a metadata blob; datatypes for the domain ranges come from the
	/// schema.
	pub fn deserialize(schema: &ArraySchema, name: &str, path: PathBuf, blob: &Blob) -> Result<Self> {
		let (t1, t2, _, name_version) = parse_fragment_name(name)?;
		let mut r = ValueReaderSlice::new(blob.as_slice());
		let magic = r.read_bytes(4)?;
		ensure!(magic == METADATA_MAGIC, "bad fragment metadata magic in {name}");
		let version = r.read_u32()?;
		ensure!(
			version == name_version,
			"fragment {name}: directory version {name_version} does not match metadata version {version}"
		);
		ensure!(
			version >= MIN_READABLE_VERSION,
			"fragment {name} has unreadable format version {version}"
		);
		let dense = r.read_u8()? != 0;
		let dim_num = r.read_u32()? as usize;
		ensure!(
			dim_num == schema.dim_num(),
			"fragment {name} has {dim_num} dimensions, schema has {}",
			schema.dim_num()
		);
		let tile_count = r.read_u64()?;
		let cell_counts = r.read_u64_vec(tile_count as usize)?;

		let read_ndrange = |r: &mut ValueReaderSlice| -> Result<NDRange> {
			let mut ranges = Vec::with_capacity(dim_num);
			for d in 0..dim_num {
				let datatype = schema.domain().dimension(d).datatype();
				let start = r.read_len_prefixed()?.to_vec();
				let end = r.read_len_prefixed()?.to_vec();
				ranges.push(TypedRange::from_bytes(datatype, &start, &end)?);
			}
			Ok(ranges)
		};

		let non_empty_domain = read_ndrange(&mut r)?;
		let mbr_count = r.read_u64()?;
		let mut mbrs = Vec::with_capacity(mbr_count as usize);
		for _ in 0..mbr_count {
			mbrs.push(read_ndrange(&mut r)?);
		}

		let field_count = r.read_u32()?;
		let mut fields = Vec::with_capacity(field_count as usize);
		for _ in 0..field_count {
			let field_name = r.read_string()?;
			let has_var = r.read_u8()? != 0;
			let has_validity = r.read_u8()? != 0;
			let mut read_addresses = |r: &mut ValueReaderSlice| -> Result<FieldTileAddresses> {
				Ok(FieldTileAddresses {
					offsets: r.read_u64_vec(tile_count as usize)?,
					sizes: r.read_u64_vec(tile_count as usize)?,
				})
			};
			let primary = read_addresses(&mut r)?;
			let var = if has_var { Some(read_addresses(&mut r)?) } else { None };
			let validity = if has_validity {
				Some(read_addresses(&mut r)?)
			} else {
				None
			};
			fields.push(FieldMeta {
				name: field_name,
				primary,
				var,
				validity,
			});
		}
		ensure!(r.is_finished(), "trailing bytes in fragment metadata of {name}");

		if version < 5 {
			ensure!(
				fields.iter().any(|f| f.name == COORDS_FIELD) || dense,
				"fragment {name} predates per-dimension coordinates but has no zipped coordinate field"
			);
		}

		Ok(Self::new(
			name.to_string(),
			path,
			version,
			dense,
			(t1, t2),
			cell_counts,
			non_empty_domain,
			mbrs,
			fields,
		))
	}
}

/// Formats a fragment directory name.
pub fn format_fragment_name(t1: u64, t2: u64, id: u64, version: u32) -> String {
	format!("__{t1}_{t2}_{id:016x}_{version}")
}

/// Parses `__<t1>_<t2>_<id>_<version>`.
pub fn parse_fragment_name(name: &str) -> Result<(u64, u64, String, u32)> {
	let rest = name
		.strip_prefix("__")
		.with_context(|| format!("fragment name {name} lacks the __ prefix"))?;
	let parts: Vec<&str> = rest.split('_').collect();
	if parts.len() != 4 {
		bail!("fragment name {name} does not have four parts");
	}
	let t1: u64 = parts[0].parse().with_context(|| format!("bad t1 in {name}"))?;
	let t2: u64 = parts[1].parse().with_context(|| format!("bad t2 in {name}"))?;
	let version: u32 = parts[3].parse().with_context(|| format!("bad version in {name}"))?;
	ensure!(t1 <= t2, "fragment {name} has a reversed timestamp range");
	Ok((t1, t2, parts[2].to_string(), version))
}

/// Lists and loads all fragments of an array, ordered oldest to newest
/// (`timestamp_range.1`, then directory name).
pub async fn list_fragments(schema: &ArraySchema, array_path: &Path) -> Result<Vec<Arc<FragmentMetadata>>> {
	let mut found: Vec<(u64, String, PathBuf)> = Vec::new();
	let entries =
		std::fs::read_dir(array_path).with_context(|| format!("cannot list array directory {array_path:?}"))?;
	for entry in entries {
		let entry = entry?;
		if !entry.file_type()?.is_dir() {
			continue;
		}
		let name = entry.file_name().to_string_lossy().into_owned();
		match parse_fragment_name(&name) {
			Ok((_, t2, _, _)) => found.push((t2, name, entry.path())),
			Err(_) => continue,
		}
	}
	found.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

	let mut fragments = Vec::with_capacity(found.len());
	for (_, name, path) in found {
		let reader = DataReaderFile::open(&path.join(METADATA_FILE))
			.with_context(|| format!("fragment {name} has no metadata file"))?;
		let blob = reader.read_all().await?;
		let metadata = FragmentMetadata::deserialize(schema, &name, path, &blob)
			.with_context(|| format!("failed to parse metadata of fragment {name}"))?;
		log::debug!(
			"loaded fragment {name}: {} tiles, dense={}",
			metadata.tile_count,
			metadata.dense
		);
		fragments.push(Arc::new(metadata));
	}
	Ok(fragments)
}
