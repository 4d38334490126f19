//! The query region: per-dimension range lists, flat-range arithmetic,
//! fragment tile overlap and partition splitting.
//!
//! The Cartesian product of the per-dimension range lists is the logical set
//! of interest. A dimension with no explicit range is unconstrained, which
//! resolves to the full domain for numeric dimensions and to "no constraint"
//! for unbounded string dimensions.

use anyhow::{Context, Result, ensure};
use itertools::Itertools;
use latticedb_core::{
	ArraySchema, Layout, NDRange, TileOrder, TypedRange, value_to_i128,
};
use latticedb_storage::FragmentMetadata;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Overlap of one subarray range with one sparse fragment's tiles: runs of
/// fully covered tiles plus partially covered tiles with a coverage estimate
/// in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileOverlap {
	pub tile_ranges: Vec<(u64, u64)>,
	pub partial: Vec<(u64, f64)>,
}

impl TileOverlap {
	/// Expected number of result cells under this overlap.
	pub fn expected_cells(&self, fragment: &FragmentMetadata) -> f64 {
		let mut cells = 0.0;
		for &(first, last) in &self.tile_ranges {
			for t in first..=last {
				cells += fragment.cell_count(t) as f64;
			}
		}
		for &(t, fraction) in &self.partial {
			cells += fragment.cell_count(t) as f64 * fraction;
		}
		cells
	}

	pub fn is_empty(&self) -> bool {
		self.tile_ranges.is_empty() && self.partial.is_empty()
	}
}

/// The user-specified query region.
#[derive(Debug, Clone)]
pub struct Subarray {
	schema: Arc<ArraySchema>,
	layout: Layout,
	ranges: Vec<Vec<TypedRange>>,
}

impl Subarray {
	pub fn new(schema: Arc<ArraySchema>, layout: Layout) -> Self {
		let dim_num = schema.dim_num();
		Self {
			schema,
			layout,
			ranges: vec![Vec::new(); dim_num],
		}
	}

	pub fn schema(&self) -> &Arc<ArraySchema> {
		&self.schema
	}

	pub fn layout(&self) -> Layout {
		self.layout
	}

	pub fn dim_num(&self) -> usize {
		self.ranges.len()
	}

	/// Adds a range on one dimension. Global order admits at most one range
	/// per dimension.
	pub fn add_range(&mut self, dim: usize, range: TypedRange) -> Result<()> {
		ensure!(dim < self.dim_num(), "dimension index {dim} out of bounds");
		let dimension = self.schema.domain().dimension(dim);
		ensure!(
			range.datatype() == dimension.datatype(),
			"range datatype {} does not match dimension {} ({})",
			range.datatype(),
			dimension.name(),
			dimension.datatype()
		);
		if let Some(domain) = dimension.domain() {
			ensure!(
				domain.intersection(&range).as_ref() == Some(&range),
				"range {range:?} leaves the domain of dimension {}",
				dimension.name()
			);
		}
		if self.layout == Layout::GlobalOrder {
			ensure!(
				self.ranges[dim].is_empty(),
				"global order supports a single range per dimension"
			);
		}
		self.ranges[dim].push(range);
		Ok(())
	}

	/// Explicit ranges of one dimension; empty means unconstrained.
	pub fn ranges_for_dim(&self, dim: usize) -> &[TypedRange] {
		&self.ranges[dim]
	}

	/// The resolved range list of a dimension: explicit ranges, or the full
	/// domain (`None` for an unconstrained string dimension).
	pub fn resolved_ranges(&self, dim: usize) -> Result<Vec<Option<TypedRange>>> {
		if !self.ranges[dim].is_empty() {
			return Ok(self.ranges[dim].iter().cloned().map(Some).collect());
		}
		let dimension = self.schema.domain().dimension(dim);
		match dimension.domain() {
			Some(full) => Ok(vec![Some(full.clone())]),
			None => Ok(vec![None]),
		}
	}

	/// Number of per-dimension ranges, counting unconstrained dimensions as
	/// one range.
	pub fn range_count(&self, dim: usize) -> u64 {
		self.ranges[dim].len().max(1) as u64
	}

	/// Total number of flat range combinations.
	pub fn flat_range_num(&self) -> u64 {
		(0..self.dim_num()).map(|d| self.range_count(d)).product()
	}

	/// Decomposes a flat range index into per-dimension range indexes,
	/// honoring the layout (col-major iterates the first dimension fastest).
	pub fn range_coords(&self, mut flat: u64) -> Vec<usize> {
		let dim_num = self.dim_num();
		let mut coords = vec![0usize; dim_num];
		match self.layout {
			Layout::ColMajor => {
				for d in 0..dim_num {
					let n = self.range_count(d);
					coords[d] = (flat % n) as usize;
					flat /= n;
				}
			}
			_ => {
				for d in (0..dim_num).rev() {
					let n = self.range_count(d);
					coords[d] = (flat % n) as usize;
					flat /= n;
				}
			}
		}
		coords
	}

	/// The resolved per-dimension ranges of one flat range combination.
	pub fn flat_range(&self, flat: u64) -> Result<Vec<Option<TypedRange>>> {
		let coords = self.range_coords(flat);
		let mut out = Vec::with_capacity(self.dim_num());
		for (d, &idx) in coords.iter().enumerate() {
			out.push(self.resolved_ranges(d)?.into_iter().nth(idx).context("range index out of bounds")?);
		}
		Ok(out)
	}

	/// `true` when some dimension carries ranges that overlap each other, in
	/// which case duplicate-materializing reads need count bitmaps.
	pub fn has_overlapping_ranges(&self) -> bool {
		for dim_ranges in &self.ranges {
			let mut sorted: Vec<&TypedRange> = dim_ranges.iter().collect();
			sorted.sort_by(|a, b| {
				latticedb_core::compare_values(a.datatype(), a.start_bytes(), b.start_bytes())
			});
			for pair in sorted.windows(2) {
				if pair[0].intersects(pair[1]) {
					return true;
				}
			}
		}
		false
	}

	// -------------------------------------------------------------------------
	// Fragment overlap
	// -------------------------------------------------------------------------

	/// Computes the tile overlap of every flat range with a sparse fragment.
	pub fn compute_tile_overlap(&self, fragment: &FragmentMetadata) -> Result<Vec<TileOverlap>> {
		ensure!(!fragment.dense, "tile overlap is only defined for sparse fragments");
		let range_num = self.flat_range_num();
		let mut overlaps = Vec::with_capacity(range_num as usize);
		for flat in 0..range_num {
			let nd = self.flat_range(flat)?;
			let mut overlap = TileOverlap::default();
			let mut run: Option<(u64, u64)> = None;
			for t in 0..fragment.tile_count {
				let mbr = fragment.tile_mbr(t);
				match classify_overlap(&nd, mbr) {
					Coverage::Full => {
						run = match run {
							Some((first, last)) if last + 1 == t => Some((first, t)),
							Some(done) => {
								overlap.tile_ranges.push(done);
								Some((t, t))
							}
							None => Some((t, t)),
						};
					}
					Coverage::Partial(fraction) => {
						if let Some(done) = run.take() {
							overlap.tile_ranges.push(done);
						}
						overlap.partial.push((t, fraction));
					}
					Coverage::None => {
						if let Some(done) = run.take() {
							overlap.tile_ranges.push(done);
						}
					}
				}
			}
			if let Some(done) = run.take() {
				overlap.tile_ranges.push(done);
			}
			overlaps.push(overlap);
		}
		Ok(overlaps)
	}

	/// Expected number of cells a dense fragment contributes: the size of
	/// the intersection of the subarray with its non-empty domain.
	pub fn dense_intersection_cells(&self, non_empty_domain: &NDRange) -> Result<f64> {
		let mut total = 1.0;
		for d in 0..self.dim_num() {
			let ned = &non_empty_domain[d];
			let mut dim_cells = 0.0;
			for range in self.resolved_ranges(d)? {
				let covered = match range {
					Some(range) => range.intersection(ned).and_then(|i| i.count()).unwrap_or(0),
					None => ned.count().unwrap_or(0),
				};
				dim_cells += covered as f64;
			}
			total *= dim_cells;
		}
		Ok(total)
	}

	// -------------------------------------------------------------------------
	// Dense space tiles
	// -------------------------------------------------------------------------

	/// The unique array tile coordinates the subarray touches, in tile
	/// order. Dense domains only.
	pub fn tile_coords(&self) -> Result<Vec<Vec<u64>>> {
		let domain = self.schema.domain();
		domain.ensure_dense_compatible()?;
		let dim_num = self.dim_num();

		let mut per_dim: Vec<Vec<u64>> = Vec::with_capacity(dim_num);
		for d in 0..dim_num {
			let datatype = domain.dimension(d).datatype();
			let mut tiles = BTreeSet::new();
			for range in self.resolved_ranges(d)? {
				let range = range.context("dense subarrays have bounded dimensions")?;
				let start = value_to_i128(datatype, range.start_bytes())?;
				let end = value_to_i128(datatype, range.end_bytes())?;
				let first = domain.tile_index(d, start)?;
				let last = domain.tile_index(d, end)?;
				tiles.extend(first..=last);
			}
			per_dim.push(tiles.into_iter().collect());
		}

		// Cartesian product in tile order: the fastest dimension is the last
		// one for row-major tiles and the first one for col-major.
		let iteration: Vec<Vec<u64>> = match domain.tile_order() {
			TileOrder::RowMajor => per_dim.clone(),
			TileOrder::ColMajor => per_dim.iter().rev().cloned().collect(),
		};
		let mut out = Vec::new();
		for combo in iteration.into_iter().multi_cartesian_product() {
			let coords = match domain.tile_order() {
				TileOrder::RowMajor => combo,
				TileOrder::ColMajor => combo.into_iter().rev().collect(),
			};
			out.push(coords);
		}
		Ok(out)
	}

	/// Restricts the subarray to one space tile; the result's layout is the
	/// domain's cell order. Used by global-order dense reads.
	pub fn crop_to_tile(&self, tile_coords: &[u64]) -> Result<Subarray> {
		let domain = self.schema.domain();
		let tile_nd = domain.tile_ndrange(tile_coords)?;
		let layout = match domain.cell_order() {
			latticedb_core::CellOrder::ColMajor => Layout::ColMajor,
			_ => Layout::RowMajor,
		};
		let mut cropped = Subarray::new(self.schema.clone(), layout);
		for d in 0..self.dim_num() {
			for range in self.resolved_ranges(d)? {
				let range = range.context("dense subarrays have bounded dimensions")?;
				if let Some(intersection) = range.intersection(&tile_nd[d]) {
					cropped.ranges[d].push(intersection);
				}
			}
		}
		Ok(cropped)
	}

	// -------------------------------------------------------------------------
	// Splitting
	// -------------------------------------------------------------------------

	/// `true` when the subarray addresses exactly one cell.
	pub fn is_single_cell(&self) -> bool {
		(0..self.dim_num()).all(|d| {
			self.ranges[d].len() == 1 && self.ranges[d][0].is_unary()
		})
	}

	/// Splits along `dim`: halves the range list when it holds several
	/// ranges, bisects the single range otherwise.
	pub fn split_along(&self, dim: usize) -> Option<(Subarray, Subarray)> {
		let mut left = self.clone();
		let mut right = self.clone();
		let dim_ranges = &self.ranges[dim];
		if dim_ranges.len() > 1 {
			let mid = dim_ranges.len() / 2;
			left.ranges[dim] = dim_ranges[..mid].to_vec();
			right.ranges[dim] = dim_ranges[mid..].to_vec();
			return Some((left, right));
		}
		let range = if dim_ranges.len() == 1 {
			dim_ranges[0].clone()
		} else {
			// Unconstrained: materialize the full domain if there is one.
			self.schema.domain().dimension(dim).domain()?.clone()
		};
		let (a, b) = range.split()?;
		left.ranges[dim] = vec![a];
		right.ranges[dim] = vec![b];
		Some((left, right))
	}

	/// The dimensions a partitioner may split, in preference order: most
	/// ranges first, then the widest single range. Global order only allows
	/// the leading dimension of the tile order.
	pub fn splittable_dims(&self) -> Vec<usize> {
		let candidates: Vec<usize> = if self.layout == Layout::GlobalOrder {
			let lead = match self.schema.domain().tile_order() {
				TileOrder::RowMajor => 0,
				TileOrder::ColMajor => self.dim_num() - 1,
			};
			vec![lead]
		} else {
			(0..self.dim_num()).collect()
		};
		let mut ordered = candidates;
		ordered.sort_by(|&a, &b| {
			let ranges = self.ranges[b].len().cmp(&self.ranges[a].len());
			if ranges != std::cmp::Ordering::Equal {
				return ranges;
			}
			self
				.span_metric(b)
				.partial_cmp(&self.span_metric(a))
				.unwrap_or(std::cmp::Ordering::Equal)
		});
		ordered
	}

	fn span_metric(&self, dim: usize) -> f64 {
		let range = match self.ranges[dim].first() {
			Some(range) => range.clone(),
			None => match self.schema.domain().dimension(dim).domain() {
				Some(full) => full.clone(),
				None => return 0.0,
			},
		};
		match range.count() {
			Some(count) => count as f64,
			None => {
				if range.is_unary() {
					0.0
				} else {
					1.0
				}
			}
		}
	}
}

enum Coverage {
	None,
	Partial(f64),
	Full,
}

/// Classifies how a flat range covers one MBR.
fn classify_overlap(nd: &[Option<TypedRange>], mbr: &NDRange) -> Coverage {
	let mut fraction = 1.0;
	let mut full = true;
	for (d, range) in nd.iter().enumerate() {
		let range = match range {
			Some(range) => range,
			None => continue,
		};
		if !range.intersects(&mbr[d]) {
			return Coverage::None;
		}
		let coverage = range.coverage_of(&mbr[d]);
		if coverage < 1.0 {
			full = false;
		}
		fraction *= coverage;
	}
	if full {
		Coverage::Full
	} else {
		Coverage::Partial(fraction)
	}
}
