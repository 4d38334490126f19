//! On-disk array schema serialization.
//!
//! An array directory holds `__schema.ldb` next to its fragment directories;
//! opening an array starts by reading it back.

use anyhow::{Context, Result, bail, ensure};
use latticedb_core::{
	ArraySchema, ArrayType, Attribute, Blob, CellOrder, CellValNum, Datatype, Dimension, Domain,
	FilterKind, FilterList, TileOrder, TimeUnit, TypedRange,
};
use std::path::Path;

use crate::io::{DataReaderFile, DataReaderTrait, ValueReaderSlice, ValueWriterBlob};

/// Name of the schema file inside an array directory.
pub const SCHEMA_FILE: &str = "__schema.ldb";

const SCHEMA_MAGIC: &[u8; 4] = b"LDBS";

fn datatype_code(datatype: Datatype) -> (u8, u8) {
	use Datatype::*;
	match datatype {
		Int8 => (0, 0),
		Int16 => (1, 0),
		Int32 => (2, 0),
		Int64 => (3, 0),
		UInt8 => (4, 0),
		UInt16 => (5, 0),
		UInt32 => (6, 0),
		UInt64 => (7, 0),
		Float32 => (8, 0),
		Float64 => (9, 0),
		DateTime(unit) => (10, time_unit_code(unit)),
		Time(unit) => (11, time_unit_code(unit)),
		Blob => (12, 0),
		StringAscii => (13, 0),
		StringUtf8 => (14, 0),
	}
}

fn datatype_from_code(code: u8, unit: u8) -> Result<Datatype> {
	use Datatype::*;
	Ok(match code {
		0 => Int8,
		1 => Int16,
		2 => Int32,
		3 => Int64,
		4 => UInt8,
		5 => UInt16,
		6 => UInt32,
		7 => UInt64,
		8 => Float32,
		9 => Float64,
		10 => DateTime(time_unit_from_code(unit)?),
		11 => Time(time_unit_from_code(unit)?),
		12 => Blob,
		13 => StringAscii,
		14 => StringUtf8,
		_ => bail!("unknown datatype code {code}"),
	})
}

fn time_unit_code(unit: TimeUnit) -> u8 {
	use TimeUnit::*;
	match unit {
		Year => 0,
		Month => 1,
		Week => 2,
		Day => 3,
		Hour => 4,
		Minute => 5,
		Second => 6,
		Millisecond => 7,
		Microsecond => 8,
		Nanosecond => 9,
		Picosecond => 10,
		Femtosecond => 11,
		Attosecond => 12,
	}
}

fn time_unit_from_code(code: u8) -> Result<TimeUnit> {
	use TimeUnit::*;
	Ok(match code {
		0 => Year,
		1 => Month,
		2 => Week,
		3 => Day,
		4 => Hour,
		5 => Minute,
		6 => Second,
		7 => Millisecond,
		8 => Microsecond,
		9 => Nanosecond,
		10 => Picosecond,
		11 => Femtosecond,
		12 => Attosecond,
		_ => bail!("unknown time unit code {code}"),
	})
}

fn write_filters(w: &mut ValueWriterBlob, filters: &FilterList) {
	w.write_u8(filters.0.len() as u8);
	for kind in filters.iter() {
		w.write_u8(kind.code());
	}
}

fn read_filters(r: &mut ValueReaderSlice) -> Result<FilterList> {
	let n = r.read_u8()? as usize;
	let mut kinds = Vec::with_capacity(n);
	for _ in 0..n {
		kinds.push(FilterKind::from_code(r.read_u8()?)?);
	}
	Ok(FilterList::new(kinds))
}

/// Serializes a schema into its on-disk form.
pub fn serialize_schema(schema: &ArraySchema) -> Blob {
	let mut w = ValueWriterBlob::new();
	w.write_bytes(SCHEMA_MAGIC);
	w.write_u32(schema.version());
	w.write_u8(match schema.array_type() {
		ArrayType::Dense => 0,
		ArrayType::Sparse => 1,
	});
	w.write_u64(schema.capacity());
	w.write_u8(u8::from(schema.allows_dups()));

	let domain = schema.domain();
	w.write_u8(match domain.tile_order() {
		TileOrder::RowMajor => 0,
		TileOrder::ColMajor => 1,
	});
	w.write_u8(match domain.cell_order() {
		CellOrder::RowMajor => 0,
		CellOrder::ColMajor => 1,
		CellOrder::Hilbert => 2,
	});

	w.write_u32(domain.dim_num() as u32);
	for dim in domain.dimensions() {
		w.write_string(dim.name());
		let (code, unit) = datatype_code(dim.datatype());
		w.write_u8(code);
		w.write_u8(unit);
		match dim.domain() {
			Some(range) => {
				w.write_u8(1);
				w.write_len_prefixed(range.start_bytes());
				w.write_len_prefixed(range.end_bytes());
			}
			None => w.write_u8(0),
		}
		match dim.tile_extent_bytes() {
			Some(extent) => {
				w.write_u8(1);
				w.write_len_prefixed(extent);
			}
			None => w.write_u8(0),
		}
		write_filters(&mut w, dim.filters());
	}

	w.write_u32(schema.attributes().len() as u32);
	for attr in schema.attributes() {
		w.write_string(attr.name());
		let (code, unit) = datatype_code(attr.datatype());
		w.write_u8(code);
		w.write_u8(unit);
		match attr.cell_val_num() {
			CellValNum::Fixed(n) => w.write_u32(n),
			CellValNum::Var => w.write_u32(u32::MAX),
		}
		w.write_u8(u8::from(attr.nullable()));
		w.write_len_prefixed(attr.fill_value());
		write_filters(&mut w, attr.filters());
	}
	w.into_blob()
}

/// Parses a schema blob.
pub fn deserialize_schema(blob: &Blob) -> Result<ArraySchema> {
	let mut r = ValueReaderSlice::new(blob.as_slice());
	ensure!(r.read_bytes(4)? == SCHEMA_MAGIC, "bad schema magic");
	let _version = r.read_u32()?;
	let array_type = match r.read_u8()? {
		0 => ArrayType::Dense,
		1 => ArrayType::Sparse,
		other => bail!("unknown array type code {other}"),
	};
	let capacity = r.read_u64()?;
	let allows_dups = r.read_u8()? != 0;
	let tile_order = match r.read_u8()? {
		0 => TileOrder::RowMajor,
		1 => TileOrder::ColMajor,
		other => bail!("unknown tile order code {other}"),
	};
	let cell_order = match r.read_u8()? {
		0 => CellOrder::RowMajor,
		1 => CellOrder::ColMajor,
		2 => CellOrder::Hilbert,
		other => bail!("unknown cell order code {other}"),
	};

	let dim_num = r.read_u32()? as usize;
	let mut dimensions = Vec::with_capacity(dim_num);
	for _ in 0..dim_num {
		let name = r.read_string()?;
		let datatype = datatype_from_code(r.read_u8()?, r.read_u8()?)?;
		let domain = if r.read_u8()? != 0 {
			let start = r.read_len_prefixed()?.to_vec();
			let end = r.read_len_prefixed()?.to_vec();
			Some(TypedRange::from_bytes(datatype, &start, &end)?)
		} else {
			None
		};
		let tile_extent = if r.read_u8()? != 0 {
			Some(r.read_len_prefixed()?.to_vec())
		} else {
			None
		};
		let filters = read_filters(&mut r)?;
		let dim = if datatype.is_string() {
			Dimension::new_string(&name)?
		} else {
			Dimension::new(
				&name,
				datatype,
				domain.with_context(|| format!("dimension {name} lacks a domain"))?,
				tile_extent,
			)?
		};
		dimensions.push(dim.with_filters(filters));
	}
	let domain = Domain::new(dimensions, tile_order, cell_order)?;

	let attr_num = r.read_u32()? as usize;
	let mut attributes = Vec::with_capacity(attr_num);
	for _ in 0..attr_num {
		let name = r.read_string()?;
		let datatype = datatype_from_code(r.read_u8()?, r.read_u8()?)?;
		let cell_val_num = match r.read_u32()? {
			u32::MAX => CellValNum::Var,
			n => CellValNum::Fixed(n),
		};
		let nullable = r.read_u8()? != 0;
		let fill = r.read_len_prefixed()?.to_vec();
		let filters = read_filters(&mut r)?;
		let mut attr = Attribute::new(&name, datatype)?;
		if attr.cell_val_num() != cell_val_num {
			attr = attr.set_cell_val_num(cell_val_num)?;
		}
		attr = attr.set_nullable(nullable).set_fill_value(fill)?.with_filters(filters);
		attributes.push(attr);
	}
	ensure!(r.is_finished(), "trailing bytes in schema file");

	let mut schema = ArraySchema::new(array_type, domain, attributes)?
		.set_capacity(capacity)?;
	if allows_dups {
		schema = schema.set_allows_dups(true)?;
	}
	Ok(schema)
}

/// Creates an array directory with its schema file.
pub fn create_array(path: &Path, schema: &ArraySchema) -> Result<()> {
	std::fs::create_dir_all(path).with_context(|| format!("cannot create array directory {path:?}"))?;
	std::fs::write(path.join(SCHEMA_FILE), serialize_schema(schema).as_slice())?;
	Ok(())
}

/// Reads the schema of an existing array directory.
pub async fn read_array_schema(path: &Path) -> Result<ArraySchema> {
	let reader = DataReaderFile::open(&path.join(SCHEMA_FILE))
		.with_context(|| format!("{path:?} is not an array: missing {SCHEMA_FILE}"))?;
	let blob = reader.read_all().await?;
	deserialize_schema(&blob).with_context(|| format!("failed to parse schema of {path:?}"))
}
