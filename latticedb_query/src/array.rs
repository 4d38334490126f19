//! Opening arrays for reading.

use latticedb_core::ArraySchema;
use latticedb_storage::{FragmentMetadata, list_fragments, read_array_schema};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{QueryError, QueryResult};

/// How an array is opened. Only reading is supported here; the write paths
/// live outside the read engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
	Read,
	Write,
	Delete,
	Update,
	ModifyExclusive,
}

/// An open array: its schema and the fragments visible at open time,
/// ordered oldest to newest.
#[derive(Debug)]
pub struct Array {
	path: PathBuf,
	schema: Arc<ArraySchema>,
	fragments: Vec<Arc<FragmentMetadata>>,
}

impl Array {
	/// Opens an array directory. Modes other than [`AccessMode::Read`] are
	/// rejected.
	pub async fn open(path: &Path, mode: AccessMode) -> QueryResult<Arc<Array>> {
		if mode != AccessMode::Read {
			return Err(QueryError::InvalidArgument(format!(
				"only read mode is supported by the read engine, got {mode:?}"
			)));
		}
		let schema = Arc::new(read_array_schema(path).await.map_err(QueryError::Io)?);
		let fragments = list_fragments(&schema, path).await.map_err(QueryError::Io)?;
		log::debug!(
			"opened array {path:?}: {} fragment(s), {} dimension(s)",
			fragments.len(),
			schema.dim_num()
		);
		Ok(Arc::new(Array {
			path: path.to_path_buf(),
			schema,
			fragments,
		}))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn schema(&self) -> &Arc<ArraySchema> {
		&self.schema
	}

	pub fn fragments(&self) -> &[Arc<FragmentMetadata>] {
		&self.fragments
	}
}
