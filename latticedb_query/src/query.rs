//! The query handle: buffer binding, region and condition setup, and the
//! submit/finalize lifecycle.

use latticedb_core::{CoreConfig, Layout, MemoryTracker, OffsetsMode, TypedRange};
use latticedb_storage::TileStore;
use std::sync::Arc;

use crate::array::Array;
use crate::buffers::{BufferSpec, QueryBuffers, ResultBufferView};
use crate::cancel::CancellationToken;
use crate::condition::{ConditionMode, QueryCondition};
use crate::error::{QueryError, QueryResult, QueryStatus};
use crate::reader::Reader;
use crate::subarray::Subarray;

/// A read query over an open array.
///
/// Submit repeatedly until [`QueryStatus::Complete`]: an incomplete status
/// means the output buffers hold a prefix of the result; drain them (and
/// optionally rebind larger ones) and submit again.
pub struct Query {
	array: Arc<Array>,
	config: CoreConfig,
	layout: Layout,
	subarray: Option<Subarray>,
	pending_ranges: Vec<(usize, TypedRange)>,
	condition: Option<(QueryCondition, ConditionMode)>,
	buffers: QueryBuffers,
	cancel: CancellationToken,
	reader: Option<Reader>,
	poisoned: bool,
	finalized: bool,
}

impl Query {
	pub fn new(array: Arc<Array>) -> Self {
		Self {
			array,
			config: CoreConfig::default(),
			layout: Layout::RowMajor,
			subarray: None,
			pending_ranges: Vec::new(),
			condition: None,
			buffers: QueryBuffers::default(),
			cancel: CancellationToken::new(),
			reader: None,
			poisoned: false,
			finalized: false,
		}
	}

	fn ensure_unsubmitted(&self) -> QueryResult<()> {
		if self.reader.is_some() {
			return Err(QueryError::InvalidArgument(
				"query setup cannot change after the first submit".to_string(),
			));
		}
		Ok(())
	}

	/// Sets the result layout.
	pub fn set_layout(&mut self, layout: Layout) -> QueryResult<&mut Self> {
		self.ensure_unsubmitted()?;
		if self.array.schema().dense() && layout == Layout::Unordered {
			return Err(QueryError::InvalidArgument(
				"dense reads do not support the unordered layout".to_string(),
			));
		}
		self.layout = layout;
		Ok(self)
	}

	/// Sets the whole query region at once.
	pub fn set_subarray(&mut self, subarray: Subarray) -> QueryResult<&mut Self> {
		self.ensure_unsubmitted()?;
		if subarray.layout() != self.layout {
			return Err(QueryError::InvalidArgument(format!(
				"subarray layout {} does not match the query layout {}",
				subarray.layout(),
				self.layout
			)));
		}
		self.subarray = Some(subarray);
		Ok(self)
	}

	/// Adds one range on a dimension; combined with earlier ranges into the
	/// query region at submit time.
	pub fn add_range(&mut self, dim: usize, range: TypedRange) -> QueryResult<&mut Self> {
		self.ensure_unsubmitted()?;
		self.pending_ranges.push((dim, range));
		Ok(self)
	}

	/// Sets (or clears) the query condition and its application mode.
	/// Fill-on-mismatch exists to preserve dense stride semantics; sparse
	/// results hold only written cells, so sparse reads must subtract.
	pub fn set_condition(
		&mut self,
		condition: Option<QueryCondition>,
		mode: ConditionMode,
	) -> QueryResult<&mut Self> {
		self.ensure_unsubmitted()?;
		if condition.is_some() && mode == ConditionMode::Fill && !self.array.schema().dense() {
			return Err(QueryError::InvalidArgument(
				"fill-on-mismatch conditions apply to dense reads only".to_string(),
			));
		}
		self.condition = condition.map(|c| (c, mode));
		Ok(self)
	}

	/// Replaces the engine configuration.
	pub fn set_config(&mut self, config: CoreConfig) -> QueryResult<&mut Self> {
		self.ensure_unsubmitted()?;
		config
			.validate()
			.map_err(|e| QueryError::InvalidArgument(e.to_string()))?;
		self.config = config;
		Ok(self)
	}

	/// Configures how var-sized offsets are reported.
	pub fn set_offsets_config(
		&mut self,
		mode: OffsetsMode,
		bits: u32,
		extra_element: bool,
	) -> QueryResult<&mut Self> {
		self.ensure_unsubmitted()?;
		self.config.offsets_mode = mode;
		self
			.config
			.set_offsets_bits(bits)
			.map_err(|e| QueryError::InvalidArgument(e.to_string()))?;
		self.config.offsets_extra_element = extra_element;
		Ok(self)
	}

	/// Binds (or rebinds) an output buffer for a field. Rebinding with a
	/// larger capacity between submits is the way out of a
	/// `UserBufferSize`-incomplete loop.
	pub fn set_buffer(&mut self, name: &str, spec: BufferSpec) -> QueryResult<&mut Self> {
		let schema = self.array.schema();
		if schema.field(name).is_none() {
			return Err(QueryError::InvalidArgument(format!("unknown field {name}")));
		}
		let var_sized = schema.var_sized(name).map_err(QueryError::Internal)?;
		let nullable = schema.nullable(name).map_err(QueryError::Internal)?;
		if var_sized && spec.var_capacity.is_none() {
			return Err(QueryError::InvalidArgument(format!(
				"field {name} is var-sized and needs a var buffer"
			)));
		}
		if !var_sized && spec.var_capacity.is_some() {
			return Err(QueryError::InvalidArgument(format!(
				"field {name} is fixed-size; a var buffer makes no sense"
			)));
		}
		if nullable && spec.validity_capacity.is_none() {
			return Err(QueryError::InvalidArgument(format!(
				"field {name} is nullable and needs a validity buffer"
			)));
		}
		if !nullable && spec.validity_capacity.is_some() {
			return Err(QueryError::InvalidArgument(format!(
				"field {name} is not nullable; a validity buffer makes no sense"
			)));
		}
		self.buffers.set(name, spec);
		Ok(self)
	}

	/// A token that cancels this query from another task.
	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Runs one read iteration.
	pub async fn submit(&mut self) -> QueryResult<QueryStatus> {
		if self.finalized {
			return Err(QueryError::InvalidArgument(
				"query was finalized".to_string(),
			));
		}
		if self.poisoned {
			return Err(QueryError::Cancelled);
		}
		if self.reader.is_none() {
			self.init_reader()?;
		}
		let reader = self.reader.as_mut().unwrap();
		let result = reader.dowork(&mut self.buffers, &self.cancel).await;
		if matches!(result, Err(QueryError::Cancelled)) {
			self.poisoned = true;
		}
		result
	}

	fn init_reader(&mut self) -> QueryResult<()> {
		let schema = self.array.schema().clone();
		let mut subarray = match self.subarray.take() {
			Some(subarray) => subarray,
			None => Subarray::new(schema.clone(), self.layout),
		};
		for (dim, range) in self.pending_ranges.drain(..) {
			subarray
				.add_range(dim, range)
				.map_err(|e| QueryError::InvalidArgument(e.to_string()))?;
		}

		let memory = Arc::new(MemoryTracker::new(self.config.memory_budget));
		let fragments = self.array.fragments().to_vec();
		let store = Arc::new(TileStore::new(schema.clone(), fragments.clone(), memory.clone()));
		let reader = Reader::new(
			schema,
			store,
			fragments,
			subarray,
			self.layout,
			self.condition.clone(),
			self.config.clone(),
			memory,
			&self.buffers,
		)?;
		self.reader = Some(reader);
		Ok(())
	}

	/// The written portion of a bound buffer after the last submit.
	pub fn result(&self, name: &str) -> Option<ResultBufferView<'_>> {
		self.buffers.get(name).map(|b| b.view())
	}

	/// Bytes written per buffer component after the last submit.
	pub fn buffer_sizes(&self, name: &str) -> Option<(u64, Option<u64>, Option<u64>)> {
		self.buffers.get(name).map(|b| b.sizes())
	}

	/// Releases the per-query state. Further submits fail.
	pub fn finalize(&mut self) {
		self.reader = None;
		self.finalized = true;
	}
}

impl std::fmt::Debug for Query {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Query")
			.field("layout", &self.layout)
			.field("submitted", &self.reader.is_some())
			.field("finalized", &self.finalized)
			.finish()
	}
}
