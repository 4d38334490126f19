//! LatticeDB: a storage engine for dense and sparse multi-dimensional
//! arrays.
//!
//! The crate re-exports the full public surface of the engine:
//!
//! - [`latticedb_core`]: datatypes, typed ranges, domains, schemas,
//!   configuration and memory accounting;
//! - [`latticedb_storage`]: byte-range I/O, the tile filter pipeline,
//!   fragments and the tile store;
//! - [`latticedb_query`]: arrays, queries, subarrays, conditions and the
//!   read state machine.
//!
//! # Example
//!
//! ```no_run
//! use latticedb::{AccessMode, Array, BufferSpec, Layout, Query};
//! use std::path::Path;
//!
//! # async fn demo() -> Result<(), latticedb::QueryError> {
//! let array = Array::open(Path::new("/data/temperatures"), AccessMode::Read).await?;
//! let mut query = Query::new(array);
//! query.set_layout(Layout::RowMajor)?;
//! query.set_buffer("celsius", BufferSpec::fixed(1 << 20))?;
//! let status = query.submit().await?;
//! assert!(status.is_complete());
//! let values = query.result("celsius").unwrap();
//! # let _ = values;
//! # Ok(())
//! # }
//! ```

pub use latticedb_core::*;
pub use latticedb_query::*;
pub use latticedb_storage::{
	CoordTileView, FilterPipeline, FragmentMetadata, Tile, TileStore, create_array, list_fragments,
	read_array_schema,
};
