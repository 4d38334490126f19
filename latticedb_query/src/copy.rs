//! The copy engine: moves surviving cells into the caller's buffers.
//!
//! Copying is all-or-nothing per cell across every bound buffer: when any
//! buffer cannot hold the next whole cell, the engine stops, reports
//! overflow, and returns the not-yet-copied tail of the slab list so the
//! next iteration resumes exactly at the first uncopied cell.

use anyhow::{Context, Result, bail};
use latticedb_core::{ArraySchema, FieldRef, OffsetsBits, OffsetsMode};

use crate::buffers::{QueryBuffer, QueryBuffers};
use crate::result_tile::{ResultCellSlab, ResultTileArena};

/// Offsets configuration of one query.
#[derive(Debug, Clone, Copy)]
pub struct CopyConfig {
	pub offsets_mode: OffsetsMode,
	pub offsets_bits: OffsetsBits,
	pub offsets_extra_element: bool,
}

/// Result of one copy pass.
#[derive(Debug)]
pub struct CopyOutcome {
	pub overflowed: bool,
	/// Slabs (or slab tails) that did not fit; empty on full success.
	pub remaining: Vec<ResultCellSlab>,
	pub copied_cells: u64,
}

/// What one cell contributes to one buffer.
struct CellPayload {
	fixed: Vec<u8>,
	var: Option<Vec<u8>>,
	validity: Option<u8>,
}

fn cell_payload(
	schema: &ArraySchema,
	arena: &ResultTileArena,
	slab: &ResultCellSlab,
	offset: u64,
	name: &str,
) -> Result<CellPayload> {
	let field = schema
		.field(name)
		.with_context(|| format!("unknown field {name}"))?;
	let var_sized = schema.var_sized(name)?;
	let nullable = schema.nullable(name)?;

	let id = match slab.tile {
		Some(id) => id,
		None => {
			// Fill run: the attribute's fill value; nullable fills are null.
			let fill = schema.fill_value(name)?;
			return Ok(if var_sized {
				CellPayload {
					fixed: Vec::new(),
					var: Some(fill.to_vec()),
					validity: nullable.then_some(0),
				}
			} else {
				CellPayload {
					fixed: fill.to_vec(),
					var: None,
					validity: nullable.then_some(0),
				}
			});
		}
	};
	let tile = arena.get(id);
	let cell = slab.start + offset;

	match field {
		FieldRef::Attribute(_) => {
			let attr_tile = tile.attr_tile(name)?;
			let validity = nullable.then(|| u8::from(attr_tile.cell_valid(cell)));
			if var_sized {
				Ok(CellPayload {
					fixed: Vec::new(),
					var: Some(attr_tile.var_value(cell)?.to_vec()),
					validity,
				})
			} else {
				let cell_size = schema.cell_size(name)?;
				Ok(CellPayload {
					fixed: attr_tile.fixed_value(cell, cell_size).to_vec(),
					var: None,
					validity,
				})
			}
		}
		FieldRef::Dimension(d, dim) => {
			let view = tile.coords_view(schema)?;
			let coord = view.coord(cell, d)?;
			if dim.is_string() {
				Ok(CellPayload {
					fixed: Vec::new(),
					var: Some(coord.to_vec()),
					validity: None,
				})
			} else {
				Ok(CellPayload {
					fixed: coord.to_vec(),
					var: None,
					validity: None,
				})
			}
		}
		FieldRef::Coords => {
			let view = tile.coords_view(schema)?;
			let mut zipped = Vec::new();
			for d in 0..schema.dim_num() {
				zipped.extend_from_slice(view.coord(cell, d)?);
			}
			Ok(CellPayload {
				fixed: zipped,
				var: None,
				validity: None,
			})
		}
	}
}

/// The var-sized value of one cell in elements, given the offsets mode.
fn offset_entry(schema: &ArraySchema, name: &str, config: &CopyConfig, var_size: u64) -> Result<u64> {
	match config.offsets_mode {
		OffsetsMode::Bytes => Ok(var_size),
		OffsetsMode::Elements => {
			let value_size = schema.field_datatype(name)?.value_size().unwrap_or(1) as u64;
			Ok(var_size / value_size)
		}
	}
}

fn write_offset(buffer: &mut QueryBuffer, bits: OffsetsBits, value: u64) {
	let at = buffer.fixed_size as usize;
	match bits {
		OffsetsBits::Bits32 => {
			buffer.fixed[at..at + 4].copy_from_slice(&(value as u32).to_le_bytes());
			buffer.fixed_size += 4;
		}
		OffsetsBits::Bits64 => {
			buffer.fixed[at..at + 8].copy_from_slice(&value.to_le_bytes());
			buffer.fixed_size += 8;
		}
	}
}

/// `true` when the next cell fits into the buffer.
fn cell_fits(
	buffer: &QueryBuffer,
	var_sized: bool,
	payload: &CellPayload,
	config: &CopyConfig,
) -> bool {
	let offsets_width = config.offsets_bits.byte_width();
	// With the extra trailing offset enabled, one slot stays reserved.
	let reserved = if var_sized && config.offsets_extra_element {
		offsets_width
	} else {
		0
	};
	let fixed_need = if var_sized { offsets_width } else { payload.fixed.len() as u64 };
	if buffer.fixed_size + fixed_need + reserved > buffer.fixed_capacity() {
		return false;
	}
	if let Some(var) = &payload.var {
		if buffer.var_size + var.len() as u64 > buffer.var_capacity() {
			return false;
		}
	}
	if payload.validity.is_some() && buffer.validity_size + 1 > buffer.validity_capacity() {
		return false;
	}
	true
}

fn write_cell(
	buffer: &mut QueryBuffer,
	var_sized: bool,
	payload: &CellPayload,
	schema: &ArraySchema,
	name: &str,
	config: &CopyConfig,
) -> Result<()> {
	if var_sized {
		let entry = offset_entry(schema, name, config, buffer.var_size)?;
		write_offset(buffer, config.offsets_bits, entry);
		let var = payload.var.as_ref().context("var payload missing for a var-sized field")?;
		let at = buffer.var_size as usize;
		let data = buffer.var.as_mut().context("var buffer not bound")?;
		data[at..at + var.len()].copy_from_slice(var);
		buffer.var_size += var.len() as u64;
	} else {
		let at = buffer.fixed_size as usize;
		buffer.fixed[at..at + payload.fixed.len()].copy_from_slice(&payload.fixed);
		buffer.fixed_size += payload.fixed.len() as u64;
	}
	if let Some(valid) = payload.validity {
		let at = buffer.validity_size as usize;
		let validity = buffer
			.validity
			.as_mut()
			.context("validity buffer not bound for a nullable field")?;
		validity[at] = valid;
		buffer.validity_size += 1;
	}
	Ok(())
}

/// Copies as many whole cells as the buffers hold, slab by slab. An
/// optional `max_cells` cap bounds the copy further (dense reads cap at
/// what the synthesized coordinate buffers can hold).
pub fn copy_cells(
	schema: &ArraySchema,
	arena: &ResultTileArena,
	buffers: &mut QueryBuffers,
	config: &CopyConfig,
	fields: &[String],
	slabs: &[ResultCellSlab],
	max_cells: Option<u64>,
) -> Result<CopyOutcome> {
	let names = fields;
	let mut copied_cells = 0u64;

	for (slab_idx, slab) in slabs.iter().enumerate() {
		for offset in 0..slab.length {
			if max_cells.is_some_and(|cap| copied_cells >= cap) {
				let mut remaining = Vec::with_capacity(slabs.len() - slab_idx);
				remaining.push(ResultCellSlab {
					tile: slab.tile,
					start: slab.start + offset,
					length: slab.length - offset,
				});
				remaining.extend_from_slice(&slabs[slab_idx + 1..]);
				return Ok(CopyOutcome {
					overflowed: true,
					remaining,
					copied_cells,
				});
			}
			// Gather the cell's payload for every bound field, check every
			// capacity, then write; a cell is never written partially.
			let mut payloads = Vec::with_capacity(names.len());
			for name in names {
				let payload = cell_payload(schema, arena, slab, offset, name)?;
				let var_sized = schema.var_sized(name)?;
				let buffer = buffers.get(name).context("buffer disappeared")?;
				if !cell_fits(buffer, var_sized, &payload, config) {
					log::debug!("output buffer of {name} is full after {copied_cells} cells");
					let mut remaining = Vec::with_capacity(slabs.len() - slab_idx);
					remaining.push(ResultCellSlab {
						tile: slab.tile,
						start: slab.start + offset,
						length: slab.length - offset,
					});
					remaining.extend_from_slice(&slabs[slab_idx + 1..]);
					return Ok(CopyOutcome {
						overflowed: true,
						remaining,
						copied_cells,
					});
				}
				payloads.push(payload);
			}
			for (name, payload) in names.iter().zip(payloads.iter()) {
				let var_sized = schema.var_sized(name)?;
				let buffer = buffers.get_mut(name).context("buffer disappeared")?;
				write_cell(buffer, var_sized, payload, schema, name, config)?;
			}
			copied_cells += 1;
		}
	}

	Ok(CopyOutcome {
		overflowed: false,
		remaining: Vec::new(),
		copied_cells,
	})
}

/// Appends the extra trailing offset to every var-sized bound buffer: the
/// total var bytes written (bytes mode) or total element count (elements
/// mode). With zero result cells this writes a single zero offset.
pub fn add_extra_offsets(
	schema: &ArraySchema,
	buffers: &mut QueryBuffers,
	config: &CopyConfig,
) -> Result<()> {
	if !config.offsets_extra_element {
		return Ok(());
	}
	let names: Vec<String> = buffers.names().map(str::to_string).collect();
	for name in names {
		if !schema.var_sized(&name)? {
			continue;
		}
		let entry = {
			let buffer = buffers.get(&name).context("buffer disappeared")?;
			offset_entry(schema, &name, config, buffer.var_size)?
		};
		let buffer = buffers.get_mut(&name).context("buffer disappeared")?;
		if buffer.fixed_size + config.offsets_bits.byte_width() > buffer.fixed_capacity() {
			bail!("offsets buffer of {name} cannot hold the extra trailing offset");
		}
		write_offset(buffer, config.offsets_bits, entry);
	}
	Ok(())
}
