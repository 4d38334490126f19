//! The subarray partitioner: memory-budgeted sub-partitioning of the query
//! region.
//!
//! A partition is acceptable when its estimated result size fits every
//! registered per-field budget. Estimation sums, over the intersected tiles
//! of every fragment, `min(tile_size, overlap_fraction * tile_size)` -
//! expressed in cells and multiplied by the per-field cell cost.

use anyhow::{Context, Result};
use latticedb_core::OffsetsBits;
use latticedb_storage::FragmentMetadata;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::subarray::Subarray;

/// Per-field output budgets in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultBudget {
	pub fixed: u64,
	pub var: u64,
	pub validity: u64,
}

/// Outcome of advancing the partitioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionerStatus {
	/// A partition that fits the budgets is current.
	Ready,
	/// The current partition exceeds a budget and cannot be split further.
	Unsplittable,
	/// All partitions were consumed.
	Done,
}

/// Splits the subarray into budget-sized partitions, on demand.
#[derive(Debug)]
pub struct SubarrayPartitioner {
	fragments: Vec<Arc<FragmentMetadata>>,
	budgets: BTreeMap<String, ResultBudget>,
	memory_budget: u64,
	memory_budget_var: u64,
	memory_budget_validity: u64,
	pending: VecDeque<Subarray>,
	current: Option<Subarray>,
	done: bool,
}

impl SubarrayPartitioner {
	pub fn new(
		subarray: Subarray,
		fragments: Vec<Arc<FragmentMetadata>>,
		memory_budget: u64,
		memory_budget_var: u64,
		memory_budget_validity: u64,
	) -> Self {
		let mut pending = VecDeque::new();
		pending.push_back(subarray);
		Self {
			fragments,
			budgets: BTreeMap::new(),
			memory_budget,
			memory_budget_var,
			memory_budget_validity,
			pending,
			current: None,
			done: false,
		}
	}

	/// Registers the output budget of one field; preserved across
	/// `next`/`split_current`.
	pub fn set_result_budget(&mut self, name: &str, budget: ResultBudget) {
		self.budgets.insert(name.to_string(), budget);
	}

	pub fn result_budgets(&self) -> &BTreeMap<String, ResultBudget> {
		&self.budgets
	}

	pub fn set_memory_budget(&mut self, fixed: u64, var: u64, validity: u64) {
		self.memory_budget = fixed;
		self.memory_budget_var = var;
		self.memory_budget_validity = validity;
	}

	pub fn memory_budget(&self) -> (u64, u64, u64) {
		(self.memory_budget, self.memory_budget_var, self.memory_budget_validity)
	}

	pub fn current(&self) -> Option<&Subarray> {
		self.current.as_ref()
	}

	pub fn done(&self) -> bool {
		self.done && self.current.is_none()
	}

	/// Advances to the next sub-partition, splitting candidates until one
	/// fits the budgets.
	pub fn next(&mut self) -> Result<PartitionerStatus> {
		self.current = None;
		loop {
			let candidate = match self.pending.pop_front() {
				Some(candidate) => candidate,
				None => {
					self.done = true;
					return Ok(PartitionerStatus::Done);
				}
			};
			if self.fits(&candidate)? {
				self.current = Some(candidate);
				return Ok(PartitionerStatus::Ready);
			}
			match split(&candidate) {
				Some((left, right)) => {
					self.pending.push_front(right);
					self.pending.push_front(left);
				}
				None => {
					log::debug!("partition cannot be split further; reporting unsplittable");
					self.current = Some(candidate);
					return Ok(PartitionerStatus::Unsplittable);
				}
			}
		}
	}

	/// Splits the current partition after an output overflow; the first half
	/// stays current. Returns `false` (leaving the state untouched) when no
	/// dimension can be split.
	pub fn split_current(&mut self) -> Result<bool> {
		let current = self
			.current
			.take()
			.context("split_current called without a current partition")?;
		match split(&current) {
			Some((left, right)) => {
				self.pending.push_front(right);
				self.current = Some(left);
				Ok(true)
			}
			None => {
				self.current = Some(current);
				Ok(false)
			}
		}
	}

	/// `true` when the candidate's estimated result fits every budget.
	fn fits(&self, candidate: &Subarray) -> Result<bool> {
		for (name, budget) in &self.budgets {
			let estimate = self.estimate(candidate, name)?;
			if estimate.fixed > budget.fixed.min(self.memory_budget)
				|| estimate.var > budget.var.min(self.memory_budget_var)
				|| estimate.validity > budget.validity.min(self.memory_budget_validity)
			{
				log::trace!(
					"partition estimate for {name} ({estimate:?}) exceeds its budget ({budget:?})"
				);
				return Ok(false);
			}
		}
		Ok(true)
	}

	/// Estimated output bytes of one field over the candidate region.
	fn estimate(&self, candidate: &Subarray, name: &str) -> Result<ResultBudget> {
		let schema = candidate.schema().clone();
		let var_sized = schema.var_sized(name)?;
		let nullable = schema.nullable(name)?;

		let mut cells = 0.0f64;
		let mut var_bytes = 0.0f64;
		for fragment in &self.fragments {
			let frag_cells = if fragment.dense {
				candidate.dense_intersection_cells(&fragment.non_empty_domain)?
			} else {
				let overlaps = candidate.compute_tile_overlap(fragment)?;
				overlaps.iter().map(|o| o.expected_cells(fragment)).sum()
			};
			cells += frag_cells;
			if var_sized {
				var_bytes += frag_cells * avg_var_cell_bytes(fragment, name);
			}
		}

		let fixed_cell_cost = if var_sized {
			OffsetsBits::Bits64.byte_width() as f64
		} else {
			schema.cell_size(name)? as f64
		};
		Ok(ResultBudget {
			fixed: (cells * fixed_cell_cost).ceil() as u64,
			var: var_bytes.ceil() as u64,
			validity: if nullable { cells.ceil() as u64 } else { 0 },
		})
	}
}

/// Splits a subarray along the best splittable dimension, honoring the
/// global-order restriction.
fn split(subarray: &Subarray) -> Option<(Subarray, Subarray)> {
	for dim in subarray.splittable_dims() {
		if let Some(pair) = subarray.split_along(dim) {
			return Some(pair);
		}
	}
	None
}

/// Average var-cell size of a field in one fragment, from the persisted tile
/// sizes.
fn avg_var_cell_bytes(fragment: &FragmentMetadata, name: &str) -> f64 {
	let field = match fragment.field(name) {
		Some(field) => field,
		None => return 0.0,
	};
	let var_bytes: u64 = match &field.var {
		Some(addresses) => addresses.sizes.iter().sum(),
		None => return 0.0,
	};
	let cells: u64 = fragment.cell_counts.iter().sum();
	if cells == 0 {
		0.0
	} else {
		var_bytes as f64 / cells as f64
	}
}

/// The in-iteration sort-bounding partitioner: same split algorithm over the
/// parent's current partition with a smaller byte budget.
pub fn sub_partitioner(
	parent: &SubarrayPartitioner,
	partition: Subarray,
	budget: u64,
) -> SubarrayPartitioner {
	let mut inner = SubarrayPartitioner::new(
		partition,
		parent.fragments.clone(),
		budget,
		budget,
		budget,
	);
	for (name, parent_budget) in parent.result_budgets() {
		inner.set_result_budget(name, *parent_budget);
	}
	inner
}

#[cfg(test)]
mod tests {
	use super::*;
	use latticedb_core::{
		ArraySchema, ArrayType, Attribute, CellOrder, Datatype, Dimension, Domain, Layout,
		TileOrder, TypedRange,
	};
	use std::path::PathBuf;

	fn int_range(lo: i32, hi: i32) -> TypedRange {
		TypedRange::from_typed(Datatype::Int32, lo, hi).unwrap()
	}

	fn schema_1d() -> Arc<ArraySchema> {
		let dim = Dimension::new(
			"d",
			Datatype::Int32,
			int_range(1, 100),
			Some(10i32.to_le_bytes().to_vec()),
		)
		.unwrap();
		let domain = Domain::new(vec![dim], TileOrder::RowMajor, CellOrder::RowMajor).unwrap();
		Arc::new(
			ArraySchema::new(
				ArrayType::Sparse,
				domain,
				vec![Attribute::new("a", Datatype::Int32).unwrap()],
			)
			.unwrap(),
		)
	}

	fn sparse_fragment() -> Arc<FragmentMetadata> {
		// Ten tiles of ten cells covering the whole domain.
		let mbrs: Vec<_> = (0..10)
			.map(|t| vec![int_range(t * 10 + 1, t * 10 + 10)])
			.collect();
		Arc::new(FragmentMetadata::new(
			latticedb_storage::format_fragment_name(1, 1, 1, 5),
			PathBuf::from("/tmp"),
			5,
			false,
			(1, 1),
			vec![10; 10],
			vec![int_range(1, 100)],
			mbrs,
			Vec::new(),
		))
	}

	fn partitioner(fixed_budget: u64) -> SubarrayPartitioner {
		let schema = schema_1d();
		let mut subarray = Subarray::new(schema, Layout::RowMajor);
		subarray.add_range(0, int_range(1, 100)).unwrap();
		let mut partitioner = SubarrayPartitioner::new(
			subarray,
			vec![sparse_fragment()],
			u64::MAX,
			u64::MAX,
			u64::MAX,
		);
		partitioner.set_result_budget(
			"a",
			ResultBudget {
				fixed: fixed_budget,
				var: 0,
				validity: 0,
			},
		);
		partitioner
	}

	#[test]
	fn test_whole_subarray_fits() -> Result<()> {
		let mut partitioner = partitioner(100 * 4);
		assert_eq!(partitioner.next()?, PartitionerStatus::Ready);
		assert!(partitioner.current().is_some());
		assert_eq!(partitioner.next()?, PartitionerStatus::Done);
		assert!(partitioner.done());
		Ok(())
	}

	#[test]
	fn test_partitions_cover_everything_in_order() -> Result<()> {
		// Budget of 30 cells forces splits; the partitions must tile the
		// full range in order.
		let mut partitioner = partitioner(30 * 4);
		let mut covered: Vec<(i128, i128)> = Vec::new();
		while partitioner.next()? == PartitionerStatus::Ready {
			let current = partitioner.current().unwrap();
			let ranges = current.ranges_for_dim(0);
			assert_eq!(ranges.len(), 1);
			let (lo, hi) = ranges[0].typed::<i32>();
			covered.push((lo as i128, hi as i128));
		}
		assert!(covered.len() >= 2);
		assert_eq!(covered[0].0, 1);
		assert_eq!(covered.last().unwrap().1, 100);
		for pair in covered.windows(2) {
			assert_eq!(pair[0].1 + 1, pair[1].0, "partitions must be contiguous");
		}
		Ok(())
	}

	#[test]
	fn test_split_current_keeps_first_half() -> Result<()> {
		let mut partitioner = partitioner(100 * 4);
		partitioner.next()?;
		assert!(partitioner.split_current()?);
		let (lo, hi) = partitioner.current().unwrap().ranges_for_dim(0)[0].typed::<i32>();
		assert_eq!((lo, hi), (1, 50));
		// The second half comes back on the next advance.
		assert_eq!(partitioner.next()?, PartitionerStatus::Ready);
		let (lo, hi) = partitioner.current().unwrap().ranges_for_dim(0)[0].typed::<i32>();
		assert_eq!((lo, hi), (51, 100));
		Ok(())
	}

	#[test]
	fn test_split_current_at_single_cell_is_idempotent() -> Result<()> {
		let schema = schema_1d();
		let mut subarray = Subarray::new(schema, Layout::RowMajor);
		subarray.add_range(0, int_range(7, 7)).unwrap();
		let mut partitioner =
			SubarrayPartitioner::new(subarray, vec![sparse_fragment()], u64::MAX, u64::MAX, u64::MAX);
		assert_eq!(partitioner.next()?, PartitionerStatus::Ready);
		let before = format!("{:?}", partitioner.current().unwrap().ranges_for_dim(0));
		assert!(!partitioner.split_current()?);
		assert!(!partitioner.split_current()?);
		let after = format!("{:?}", partitioner.current().unwrap().ranges_for_dim(0));
		assert_eq!(before, after);
		Ok(())
	}

	#[test]
	fn test_unsplittable_single_cell_over_budget() -> Result<()> {
		// A one-byte budget cannot even fit a single cell.
		let mut partitioner = partitioner(1);
		assert_eq!(partitioner.next()?, PartitionerStatus::Unsplittable);
		Ok(())
	}
}
