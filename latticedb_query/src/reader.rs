//! The read driver: one `dowork` iteration per partition, with overflow
//! resumption, memory-budget splitting and cancellation checkpoints.

use anyhow::{Context, Result};
use futures::{StreamExt, stream};
use latticedb_core::{
	ArraySchema, CellOrder, ConcurrencyLimits, CoreConfig, Layout, MemoryKind, MemoryTracker,
};
use latticedb_storage::{FragmentMetadata, TileStore};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::bitmap::{
	apply_overwritten, compute_count_bitmap, compute_mask_bitmap, compute_range_bitmap,
};
use crate::buffers::QueryBuffers;
use crate::cancel::CancellationToken;
use crate::cell_slab_iter::{DenseCellSlabIter, decode_sparse_cells};
use crate::condition::{ConditionMode, QueryCondition, apply_condition_to_slabs};
use crate::copy::{CopyConfig, add_extra_offsets, copy_cells};
use crate::dense_coords::{coord_cell_capacity, fill_dense_coords, has_coord_buffers};
use crate::error::{IncompleteReason, QueryError, QueryResult, QueryStatus};
use crate::merge::{
	concat_result_cell_slabs, coords_to_slabs, merge_result_cell_slabs, sort_and_dedup_result_coords,
};
use crate::partitioner::{PartitionerStatus, ResultBudget, SubarrayPartitioner, sub_partitioner};
use crate::read_state::ReadState;
use crate::result_tile::{Bitmap, ResultCellSlab, ResultCoords, ResultTileArena, ResultTileId};
use crate::selector::{select_sparse_result_tiles, sparse_tile_overwritten};
use crate::subarray::Subarray;

/// Outcome of reading one partition.
enum PartitionOutcome {
	/// Slabs were produced and copied; `overflowed` means a tail is pending.
	Copied { overflowed: bool },
	/// The memory budget rejected the working set; split and retry.
	MemoryExceeded,
}

/// Drives one read query across submits.
pub struct Reader {
	schema: Arc<ArraySchema>,
	store: Arc<TileStore>,
	fragments: Vec<Arc<FragmentMetadata>>,
	layout: Layout,
	condition: Option<(QueryCondition, ConditionMode)>,
	config: CoreConfig,
	copy_config: CopyConfig,
	memory: Arc<MemoryTracker>,
	limits: ConcurrencyLimits,
	state: ReadState,
	arena: ResultTileArena,
	/// Per-iteration tile reservations, released when the iteration's slabs
	/// are fully copied.
	reservations: Vec<(MemoryKind, u64)>,
}

impl Reader {
	pub fn new(
		schema: Arc<ArraySchema>,
		store: Arc<TileStore>,
		fragments: Vec<Arc<FragmentMetadata>>,
		subarray: Subarray,
		layout: Layout,
		condition: Option<(QueryCondition, ConditionMode)>,
		config: CoreConfig,
		memory: Arc<MemoryTracker>,
		buffers: &QueryBuffers,
	) -> QueryResult<Self> {
		if buffers.is_empty() {
			return Err(QueryError::InvalidArgument(
				"cannot initialize a read query without buffers".to_string(),
			));
		}
		config
			.validate()
			.map_err(|e| QueryError::InvalidArgument(e.to_string()))?;
		if let Some((condition, mode)) = &condition {
			condition
				.check(&schema)
				.map_err(|e| QueryError::InvalidArgument(e.to_string()))?;
			if schema.dense() && has_coord_buffers(&schema, buffers) {
				return Err(QueryError::InvalidArgument(
					"dense coordinate reads are unsupported with a query condition".to_string(),
				));
			}
			// Fill runs only exist on dense reads; every sparse result row
			// corresponds to a written cell.
			if !schema.dense() && *mode == ConditionMode::Fill {
				return Err(QueryError::InvalidArgument(
					"fill-on-mismatch conditions apply to dense reads only".to_string(),
				));
			}
		}

		let mut partitioner = SubarrayPartitioner::new(
			subarray,
			fragments.clone(),
			config.memory_budget,
			config.memory_budget_var,
			config.memory_budget_validity,
		);
		for name in buffers.names() {
			let buffer = buffers.get(name).unwrap();
			partitioner.set_result_budget(
				name,
				ResultBudget {
					fixed: buffer.fixed_capacity().max(1),
					var: buffer.var_capacity(),
					validity: buffer.validity_capacity(),
				},
			);
		}
		let fragment_num = fragments.len();

		let copy_config = CopyConfig {
			offsets_mode: config.offsets_mode,
			offsets_bits: config.offsets_bits,
			offsets_extra_element: config.offsets_extra_element,
		};

		Ok(Self {
			schema,
			store,
			fragments,
			layout,
			condition,
			config,
			copy_config,
			memory,
			limits: ConcurrencyLimits::default(),
			state: ReadState::new(partitioner, fragment_num),
			arena: ResultTileArena::new(),
			reservations: Vec::new(),
		})
	}

	pub fn state(&self) -> &ReadState {
		&self.state
	}

	fn check_cancelled(&self, cancel: &CancellationToken) -> QueryResult<()> {
		if cancel.is_cancelled() {
			Err(QueryError::Cancelled)
		} else {
			Ok(())
		}
	}

	fn reserve_loaded(&mut self, kind: MemoryKind, bytes: u64) {
		self.reservations.push((kind, bytes));
	}

	/// Releases every per-iteration tile reservation and drops the arena.
	fn release_iteration(&mut self) {
		for (kind, bytes) in self.reservations.drain(..) {
			self.memory.release(kind, bytes);
		}
		self.arena.clear();
	}

	/// One submit call: produce results, or report why none were produced.
	pub async fn dowork(
		&mut self,
		buffers: &mut QueryBuffers,
		cancel: &CancellationToken,
	) -> QueryResult<QueryStatus> {
		buffers.reset_sizes();

		if self.state.unsplittable {
			return Ok(QueryStatus::Incomplete(IncompleteReason::Unsplittable));
		}
		if !self.schema.dense() && self.fragments.is_empty() {
			return self.complete(buffers);
		}

		loop {
			// Resume slabs preserved by a previous overflow before touching
			// the partitioner.
			if !self.state.pending_slabs.is_empty() {
				let pending = std::mem::take(&mut self.state.pending_slabs);
				let overflowed = self.copy_slabs(buffers, pending, cancel)?;
				if overflowed {
					return Ok(QueryStatus::Incomplete(IncompleteReason::UserBufferSize));
				}
				self.release_iteration();
			}

			match self.state.next().map_err(QueryError::Internal)? {
				PartitionerStatus::Done => return self.complete(buffers),
				// An unsplittable estimate is still worth attempting: the
				// estimates are conservative.
				PartitionerStatus::Ready | PartitionerStatus::Unsplittable => {}
			}

			// Keep consuming partitions until the buffers overflow or the
			// cursor is done, so every call fills the buffers as far as one
			// whole cell still fits.
			loop {
				match self.read_partition(buffers, cancel).await? {
					PartitionOutcome::Copied { overflowed } => {
						if overflowed {
							if buffers.has_results() {
								self.state.unsplittable = false;
								return Ok(QueryStatus::Incomplete(IncompleteReason::UserBufferSize));
							}
							// Not even one cell fits an empty buffer.
							self.state.unsplittable = true;
							return Ok(QueryStatus::Incomplete(IncompleteReason::Unsplittable));
						}
						self.state.unsplittable = false;
						self.release_iteration();
						break;
					}
					PartitionOutcome::MemoryExceeded => {
						self.release_iteration();
						self.state.split_current().map_err(QueryError::Internal)?;
						if self.state.unsplittable {
							log::debug!("memory budget exhausted at an unsplittable partition");
							return Ok(QueryStatus::Incomplete(IncompleteReason::MemoryBudget));
						}
					}
				}
			}
		}
	}

	fn complete(&mut self, buffers: &mut QueryBuffers) -> QueryResult<QueryStatus> {
		add_extra_offsets(&self.schema, buffers, &self.copy_config)
			.map_err(|e| QueryError::BufferOverflow(e.to_string()))?;
		Ok(QueryStatus::Complete)
	}

	/// Copies slabs into the buffers; on overflow the uncopied tail is
	/// preserved in the read state. For dense reads with bound coordinate
	/// buffers, the matching coordinates are synthesized for exactly the
	/// copied cells. Returns the overflow flag.
	fn copy_slabs(
		&mut self,
		buffers: &mut QueryBuffers,
		slabs: Vec<ResultCellSlab>,
		cancel: &CancellationToken,
	) -> QueryResult<bool> {
		self.check_cancelled(cancel)?;
		let dense_coords = self.schema.dense() && has_coord_buffers(&self.schema, buffers);
		let max_cells = if dense_coords {
			coord_cell_capacity(&self.schema, buffers).map_err(QueryError::Internal)?
		} else {
			None
		};
		// Dense coordinate buffers are synthesized below, never copied from
		// tiles.
		let fields: Vec<String> = buffers
			.names()
			.filter(|name| {
				!self.schema.dense()
					|| (*name != latticedb_core::COORDS_FIELD && !self.schema.is_dim(name))
			})
			.map(str::to_string)
			.collect();
		let outcome = copy_cells(
			&self.schema,
			&self.arena,
			buffers,
			&self.copy_config,
			&fields,
			&slabs,
			max_cells,
		)
		.map_err(QueryError::Internal)?;

		if dense_coords && outcome.copied_cells > 0 {
			let partition = self
				.state
				.partitioner
				.current()
				.context("no current partition")
				.map_err(QueryError::Internal)?
				.clone();
			fill_dense_coords(
				&self.schema,
				&partition,
				buffers,
				self.state.dense_coords_done,
				outcome.copied_cells,
			)
			.map_err(QueryError::Internal)?;
			self.state.dense_coords_done += outcome.copied_cells;
		}

		let consumed = slabs.len() - outcome.remaining.len();
		self.state.record_progress(&self.arena, &slabs[..consumed]);
		for slab in &slabs[..consumed] {
			if let Some(id) = slab.tile {
				self.arena.release_ref(id);
			}
		}
		if outcome.overflowed {
			self.state.pending_slabs = outcome.remaining;
			Ok(true)
		} else {
			Ok(false)
		}
	}

	/// Registers slab references so tiles stay loaded until copied out.
	fn add_slab_refs(&mut self, slabs: &[ResultCellSlab]) {
		for slab in slabs {
			if let Some(id) = slab.tile {
				self.arena.add_ref(id);
			}
		}
	}

	async fn read_partition(
		&mut self,
		buffers: &mut QueryBuffers,
		cancel: &CancellationToken,
	) -> QueryResult<PartitionOutcome> {
		let partition = self
			.state
			.partitioner
			.current()
			.context("no current partition")
			.map_err(QueryError::Internal)?
			.clone();

		let slabs = if self.schema.dense() {
			match self.dense_partition_slabs(&partition, cancel).await? {
				Some(slabs) => slabs,
				None => return Ok(PartitionOutcome::MemoryExceeded),
			}
		} else {
			match self.sparse_partition_slabs(&partition, cancel).await? {
				Some(slabs) => slabs,
				None => return Ok(PartitionOutcome::MemoryExceeded),
			}
		};

		// Attribute payloads for the bound fields and the condition.
		if !self.load_attribute_tiles(buffers, &slabs).await? {
			return Ok(PartitionOutcome::MemoryExceeded);
		}
		if self.layout == Layout::Unordered && self.schema.allows_dups() && self.ratios_exceeded() {
			return Ok(PartitionOutcome::MemoryExceeded);
		}

		let slabs = match &self.condition {
			Some((condition, mode)) => {
				apply_condition_to_slabs(condition, *mode, &self.schema, &self.arena, slabs)
					.map_err(QueryError::Internal)?
			}
			None => slabs,
		};

		self.add_slab_refs(&slabs);
		let overflowed = self.copy_slabs(buffers, slabs, cancel)?;
		Ok(PartitionOutcome::Copied { overflowed })
	}

	// -------------------------------------------------------------------------
	// Sparse reads
	// -------------------------------------------------------------------------

	async fn sparse_partition_slabs(
		&mut self,
		partition: &Subarray,
		cancel: &CancellationToken,
	) -> QueryResult<Option<Vec<ResultCellSlab>>> {
		let selected = match self.select_and_load_sparse_tiles(partition).await? {
			Some(selected) => selected.tile_ids,
			None => return Ok(None),
		};
		if self.layout == Layout::Unordered && self.schema.allows_dups() && self.ratios_exceeded() {
			return Ok(None);
		}
		self.check_cancelled(cancel)?;

		// Per-tile bitmaps over every range of the partition.
		let use_counts = self.layout == Layout::Unordered
			&& self.schema.allows_dups()
			&& partition.has_overlapping_ranges();
		self.compute_partition_bitmaps(partition, &selected, use_counts).await?;
		self.check_cancelled(cancel)?;

		// Group the selected tiles per fragment, in tile order.
		let mut per_fragment: Vec<(usize, Vec<ResultTileId>)> = Vec::new();
		for &id in &selected {
			let frag_idx = self.arena.get(id).frag_idx;
			match per_fragment.iter_mut().find(|(f, _)| *f == frag_idx) {
				Some((_, tiles)) => tiles.push(id),
				None => per_fragment.push((frag_idx, vec![id])),
			}
		}
		for (_, tiles) in &mut per_fragment {
			tiles.sort_by_key(|&id| self.arena.get(id).tile_idx);
		}
		per_fragment.sort_by_key(|(f, _)| *f);

		let slabs = if self.layout == Layout::Unordered {
			if self.schema.allows_dups() {
				concat_result_cell_slabs(&self.arena, &per_fragment)
			} else {
				self.unordered_dedup_slabs(partition, &per_fragment)?
			}
		} else {
			merge_result_cell_slabs(
				&self.arena,
				&self.schema,
				self.layout,
				per_fragment,
				self.schema.allows_dups(),
			)
			.map_err(QueryError::Internal)?
		};
		Ok(Some(slabs))
	}

	/// The unordered-with-duplicates reader subdivides the total budget by
	/// the configured ratios; exceeding any share makes the iteration back
	/// off and split. Each ratio governs its own category: coordinate
	/// tiles, condition tiles, tile-range bookkeeping and attribute tile
	/// payloads.
	fn ratios_exceeded(&self) -> bool {
		let budget = self.memory.budget() as f64;
		let shares = [
			(MemoryKind::Coords, self.config.ratio_coords),
			(MemoryKind::QueryCondition, self.config.ratio_query_condition),
			(MemoryKind::TileRanges, self.config.ratio_tile_ranges),
			(MemoryKind::ArrayData, self.config.ratio_array_data),
		];
		shares.iter().any(|&(kind, ratio)| {
			ratio > 0.0 && (self.memory.kind_used(kind) as f64) > budget * ratio
		})
	}

	/// Unordered layout without duplicates: sort by the cell order and keep
	/// the newest fragment per coordinate. The sort working set can be
	/// bounded by the in-iteration sub-partitioner.
	fn unordered_dedup_slabs(
		&mut self,
		partition: &Subarray,
		per_fragment: &[(usize, Vec<ResultTileId>)],
	) -> QueryResult<Vec<ResultCellSlab>> {
		let sort_layout = match self.schema.domain().cell_order() {
			CellOrder::ColMajor => Layout::ColMajor,
			// Hilbert sorts row-major to avoid computing curve values here.
			_ => Layout::RowMajor,
		};

		let gather = |arena: &ResultTileArena, bounds: Option<&Subarray>| -> Result<Vec<ResultCoords>> {
			let mut coords = Vec::new();
			for (_, tiles) in per_fragment {
				for &id in tiles {
					let tile = arena.get(id);
					let view = tile.coords_view(&self.schema)?;
					for pos in 0..tile.cell_num {
						if !tile.bitmap.passes(pos) {
							continue;
						}
						if let Some(bounds) = bounds {
							let mut inside = true;
							for (d, ranges) in (0..self.schema.dim_num())
								.map(|d| (d, bounds.resolved_ranges(d)))
							{
								let ranges = ranges?;
								let coord = view.coord(pos, d)?;
								if !ranges
									.iter()
									.any(|r| r.as_ref().is_none_or(|r| r.contains(coord)))
								{
									inside = false;
									break;
								}
							}
							if !inside {
								continue;
							}
						}
						coords.push(ResultCoords::new(id, pos));
					}
				}
			}
			Ok(coords)
		};

		let sub_budget = self.config.sub_partitioner_memory_budget;
		let mut slabs = Vec::new();
		if sub_budget == 0 {
			let mut coords = gather(&self.arena, None).map_err(QueryError::Internal)?;
			sort_and_dedup_result_coords(&self.arena, &self.schema, &mut coords, sort_layout, true)
				.map_err(QueryError::Internal)?;
			slabs.extend(coords_to_slabs(&coords));
			return Ok(slabs);
		}

		// Bound the per-sort working set; double the budget (up to the
		// parent's) when it is too small to split.
		let mut budget = sub_budget;
		let (parent_budget, _, _) = self.state.partitioner.memory_budget();
		let mut inner = sub_partitioner(&self.state.partitioner, partition.clone(), budget);
		loop {
			match inner.next().map_err(QueryError::Internal)? {
				PartitionerStatus::Done => break,
				PartitionerStatus::Ready => {
					let sub = inner.current().unwrap().clone();
					let mut coords =
						gather(&self.arena, Some(&sub)).map_err(QueryError::Internal)?;
					sort_and_dedup_result_coords(
						&self.arena,
						&self.schema,
						&mut coords,
						sort_layout,
						true,
					)
					.map_err(QueryError::Internal)?;
					slabs.extend(coords_to_slabs(&coords));
				}
				PartitionerStatus::Unsplittable => {
					if budget >= parent_budget {
						return Err(QueryError::MemoryBudget(
							"sort sub-partitioner cannot split within the parent budget".to_string(),
						));
					}
					budget = (budget * 2).min(parent_budget);
					inner = sub_partitioner(&self.state.partitioner, partition.clone(), budget);
				}
			}
		}
		Ok(slabs)
	}

	/// Selects sparse result tiles and loads their coordinate tiles; `None`
	/// on budget rejection.
	async fn select_and_load_sparse_tiles(
		&mut self,
		partition: &Subarray,
	) -> QueryResult<Option<crate::selector::SelectedTiles>> {
		let mut overlaps: Vec<Option<Vec<crate::subarray::TileOverlap>>> =
			Vec::with_capacity(self.fragments.len());
		for fragment in &self.fragments {
			if fragment.dense {
				overlaps.push(None);
			} else {
				overlaps.push(Some(
					partition
						.compute_tile_overlap(fragment)
						.map_err(QueryError::Internal)?,
				));
			}
		}

		let selected = match select_sparse_result_tiles(
			&self.fragments,
			&overlaps,
			partition.flat_range_num(),
			&mut self.arena,
			&self.memory,
		)
		.map_err(QueryError::Internal)?
		{
			Some(selected) => selected,
			None => return Ok(None),
		};
		// The overlap bookkeeping reservation is per-iteration.
		let bookkeeping: u64 = overlaps
			.iter()
			.flatten()
			.flat_map(|v| v.iter())
			.map(|o| (o.tile_ranges.len() + o.partial.len()) as u64 * 16)
			.sum();
		self.reserve_loaded(MemoryKind::TileRanges, bookkeeping);

		// Tile offset tables for the coordinate fields of every fragment.
		let mut field_names: Vec<String> = vec![latticedb_core::COORDS_FIELD.to_string()];
		for dim in self.schema.domain().dimensions() {
			field_names.push(dim.name().to_string());
		}
		let name_refs: Vec<&str> = field_names.iter().map(String::as_str).collect();
		let frag_indexes: Vec<usize> = (0..self.fragments.len()).collect();
		if !self
			.store
			.load_tile_offsets(&frag_indexes, &name_refs)
			.map_err(QueryError::Internal)?
		{
			return Ok(None);
		}

		// Read and unfilter the coordinate tiles.
		let requests: Vec<(usize, u64)> = selected
			.tile_ids
			.iter()
			.map(|&id| {
				let tile = self.arena.get(id);
				(tile.frag_idx, tile.tile_idx)
			})
			.collect();
		let loaded = match self
			.store
			.read_coordinate_tiles(&requests)
			.await
			.map_err(map_io_error)?
		{
			Some(loaded) => loaded,
			None => return Ok(None),
		};
		for (&id, tiles) in selected.tile_ids.iter().zip(loaded) {
			let zipped = self.fragments[self.arena.get(id).frag_idx].has_zipped_coords();
			let bytes: u64 = tiles.iter().map(latticedb_storage::Tile::mem_size).sum();
			self.reserve_loaded(MemoryKind::Coords, bytes);
			let tile = self.arena.get_mut(id);
			tile.zipped = zipped;
			tile.coord_tiles = tiles;
		}
		Ok(Some(selected))
	}

	/// Computes every selected tile's bitmap with bounded CPU fan-out.
	async fn compute_partition_bitmaps(
		&mut self,
		partition: &Subarray,
		selected: &[ResultTileId],
		use_counts: bool,
	) -> QueryResult<()> {
		let mut ranges_per_dim = Vec::with_capacity(self.schema.dim_num());
		for d in 0..self.schema.dim_num() {
			ranges_per_dim.push(partition.resolved_ranges(d).map_err(QueryError::Internal)?);
		}
		let cell_order = self.schema.domain().cell_order();
		let arena = &self.arena;
		let schema = &self.schema;
		let fragments = &self.fragments;
		let ranges = &ranges_per_dim;

		let bitmaps: Vec<Result<(ResultTileId, Bitmap)>> = stream::iter(selected.iter().copied())
			.map(|id| async move {
				let tile = arena.get(id);
				let view = tile.coords_view(schema)?;
				if sparse_tile_overwritten(fragments, tile.frag_idx, fragments[tile.frag_idx].tile_mbr(tile.tile_idx))
				{
					return Ok((id, Bitmap::Mask(vec![0; tile.cell_num as usize])));
				}
				let mut bitmap = if use_counts {
					Bitmap::Counts(compute_count_bitmap(&view, ranges)?)
				} else {
					Bitmap::Mask(compute_mask_bitmap(&view, ranges, cell_order)?)
				};
				if schema.dense() {
					if let Bitmap::Mask(mask) = &mut bitmap {
						apply_overwritten(&view, tile.frag_idx, fragments, mask)?;
					}
				}
				Ok((id, bitmap))
			})
			.buffered(self.limits.cpu_bound)
			.collect()
			.await;

		for result in bitmaps {
			let (id, bitmap) = result.map_err(QueryError::Internal)?;
			self.arena.get_mut(id).bitmap = bitmap;
		}
		Ok(())
	}

	// -------------------------------------------------------------------------
	// Dense reads
	// -------------------------------------------------------------------------

	async fn dense_partition_slabs(
		&mut self,
		partition: &Subarray,
		cancel: &CancellationToken,
	) -> QueryResult<Option<Vec<ResultCellSlab>>> {
		// Result coordinates contributed by sparse fragments, gathered per
		// flat range: the cell-slab walk revisits cells shared by
		// overlapping ranges, so the coordinate stream must too.
		let selected = match self.select_and_load_sparse_tiles(partition).await? {
			Some(selected) => selected,
			None => return Ok(None),
		};
		self.check_cancelled(cancel)?;

		let sort_layout = match self.layout {
			Layout::ColMajor => Layout::ColMajor,
			Layout::GlobalOrder => Layout::GlobalOrder,
			_ => Layout::RowMajor,
		};
		let cell_order = self.schema.domain().cell_order();
		// Each range gathers and sorts its own coordinates; ranges fan out
		// in parallel and concatenate in flat-range order.
		let arena = &self.arena;
		let schema = &self.schema;
		let fragments = &self.fragments;
		let per_range: Vec<Result<Vec<ResultCoords>>> =
			stream::iter(selected.per_range.iter().enumerate())
				.map(|(r, range_tiles)| async move {
					let mut range_coords: Vec<ResultCoords> = Vec::new();
					if range_tiles.is_empty() {
						return Ok(range_coords);
					}
					let nd = partition.flat_range(r as u64)?;
					for &(id, full) in range_tiles {
						let tile = arena.get(id);
						if sparse_tile_overwritten(
							fragments,
							tile.frag_idx,
							fragments[tile.frag_idx].tile_mbr(tile.tile_idx),
						) {
							continue;
						}
						let view = tile.coords_view(schema)?;
						let mut mask = if full {
							vec![1u8; tile.cell_num as usize]
						} else {
							compute_range_bitmap(&view, &nd, cell_order)?
						};
						apply_overwritten(&view, tile.frag_idx, fragments, &mut mask)?;
						for pos in 0..tile.cell_num {
							if mask[pos as usize] != 0 {
								range_coords.push(ResultCoords::new(id, pos));
							}
						}
					}
					// Within one range, duplicates across fragments collapse
					// to the newest fragment (dense arrays never allow
					// duplicates).
					sort_and_dedup_result_coords(arena, schema, &mut range_coords, sort_layout, true)?;
					Ok(range_coords)
				})
				.buffered(self.limits.cpu_bound)
				.collect()
				.await;
		let mut result_coords: Vec<ResultCoords> = Vec::new();
		for range_coords in per_range {
			result_coords.extend(range_coords.map_err(QueryError::Internal)?);
		}
		self.check_cancelled(cancel)?;

		// Space tiles and the slab walk.
		let tile_coords = partition.tile_coords().map_err(QueryError::Internal)?;
		let space_tiles = crate::space_tiles::compute_result_space_tiles(
			&self.schema,
			&self.fragments,
			&tile_coords,
			&mut self.arena,
		)
		.map_err(QueryError::Internal)?;
		let sparse_cells = decode_sparse_cells(&self.arena, &self.schema, &result_coords)
			.map_err(QueryError::Internal)?;

		let mut slabs = Vec::new();
		if self.layout == Layout::GlobalOrder {
			let mut sparse_pos = 0;
			for coords in &tile_coords {
				let cropped = partition.crop_to_tile(coords).map_err(QueryError::Internal)?;
				let mut iter =
					DenseCellSlabIter::new(&cropped, &self.schema, &space_tiles, &sparse_cells, sparse_pos)
						.map_err(QueryError::Internal)?;
				for slab in iter.by_ref() {
					slabs.push(slab.map_err(QueryError::Internal)?);
				}
				sparse_pos = iter.sparse_pos();
			}
		} else {
			let iter =
				DenseCellSlabIter::new(partition, &self.schema, &space_tiles, &sparse_cells, 0)
					.map_err(QueryError::Internal)?;
			for slab in iter {
				slabs.push(slab.map_err(QueryError::Internal)?);
			}
		}
		Ok(Some(slabs))
	}

	// -------------------------------------------------------------------------
	// Attribute loading
	// -------------------------------------------------------------------------

	/// Loads the attribute tiles the slabs and the condition reference.
	/// Returns `false` on budget rejection.
	async fn load_attribute_tiles(
		&mut self,
		buffers: &QueryBuffers,
		slabs: &[ResultCellSlab],
	) -> QueryResult<bool> {
		let mut fields: BTreeSet<String> = buffers
			.names()
			.filter(|n| self.schema.is_attr(n))
			.map(str::to_string)
			.collect();
		let mut condition_fields = BTreeSet::new();
		if let Some((condition, _)) = &self.condition {
			condition_fields = condition.field_names();
			fields.extend(condition_fields.iter().cloned());
		}
		if fields.is_empty() {
			return Ok(true);
		}

		// Distinct tiles referenced by the slabs, missing their payloads.
		let mut tile_ids: Vec<ResultTileId> = Vec::new();
		for slab in slabs {
			if let Some(id) = slab.tile {
				if !tile_ids.contains(&id) {
					tile_ids.push(id);
				}
			}
		}
		if tile_ids.is_empty() {
			return Ok(true);
		}

		let frag_indexes: Vec<usize> =
			tile_ids.iter().map(|&id| self.arena.get(id).frag_idx).collect();
		let name_refs: Vec<&str> = fields.iter().map(String::as_str).collect();
		if !self
			.store
			.load_tile_offsets(&frag_indexes, &name_refs)
			.map_err(QueryError::Internal)?
		{
			return Ok(false);
		}

		for field in &fields {
			let requests: Vec<(usize, u64)> = tile_ids
				.iter()
				.filter(|&&id| {
					let tile = self.arena.get(id);
					!tile.attr_tiles.contains_key(field)
						&& self.fragments[tile.frag_idx].field(field).is_some()
				})
				.map(|&id| {
					let tile = self.arena.get(id);
					(tile.frag_idx, tile.tile_idx)
				})
				.collect();
			if requests.is_empty() {
				continue;
			}
			let kind = if condition_fields.contains(field) {
				MemoryKind::QueryCondition
			} else {
				MemoryKind::ArrayData
			};
			let loaded = match self
				.store
				.read_attribute_tiles(field, &requests, kind)
				.await
				.map_err(map_io_error)?
			{
				Some(loaded) => loaded,
				None => return Ok(false),
			};
			let mut loaded_iter = loaded.into_iter();
			let filtered_ids: Vec<_> = tile_ids
				.iter()
				.copied()
				.filter(|&id| {
					let tile = self.arena.get(id);
					!tile.attr_tiles.contains_key(field)
						&& self.fragments[tile.frag_idx].field(field).is_some()
				})
				.collect();
			for id in filtered_ids {
				let tile_data = loaded_iter
					.next()
					.context("attribute tile count mismatch")
					.map_err(QueryError::Internal)?;
				self.reserve_loaded(kind, tile_data.mem_size());
				self.arena.get_mut(id).attr_tiles.insert(field.clone(), tile_data);
			}
		}
		Ok(true)
	}
}

/// Maps storage-layer failures onto the I/O or filter error kinds.
fn map_io_error(error: anyhow::Error) -> QueryError {
	let message = format!("{error:#}");
	if message.contains("filter pipeline") {
		QueryError::Filter(error)
	} else if message.contains("I/O error") {
		QueryError::Io(error)
	} else {
		QueryError::Internal(error)
	}
}

impl std::fmt::Debug for Reader {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Reader")
			.field("layout", &self.layout)
			.field("fragments", &self.fragments.len())
			.field("initialized", &self.state.initialized)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use anyhow::anyhow;

	#[test]
	fn test_map_io_error_classifies() {
		let filter = anyhow!("filter pipeline rejected a tile of a.dat in fragment 0");
		assert!(matches!(map_io_error(filter), QueryError::Filter(_)));
		let io = anyhow!("I/O error reading a.dat of fragment 0");
		assert!(matches!(map_io_error(io), QueryError::Io(_)));
		let other = anyhow!("something else");
		assert!(matches!(map_io_error(other), QueryError::Internal(_)));
	}
}
