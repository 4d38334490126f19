//! Query error kinds and status codes.
//!
//! Only a few kinds drive control flow: a buffer overflow triggers a
//! partition split, a memory-budget rejection makes the call return
//! incomplete, and everything else terminates the query.

use thiserror::Error;

/// Errors a query can surface to the caller.
#[derive(Debug, Error)]
pub enum QueryError {
	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	#[error("storage I/O failed")]
	Io(#[source] anyhow::Error),

	#[error("filter pipeline rejected a tile")]
	Filter(#[source] anyhow::Error),

	#[error("memory budget cannot fit the minimum working set: {0}")]
	MemoryBudget(String),

	#[error("user buffer too small for field {0}")]
	BufferOverflow(String),

	#[error("buffer overflow persists at a single-cell partition")]
	Unsplittable,

	#[error("query was cancelled")]
	Cancelled,

	#[error("internal invariant violated: {0:#}")]
	Internal(anyhow::Error),
}

impl From<anyhow::Error> for QueryError {
	fn from(error: anyhow::Error) -> Self {
		QueryError::Internal(error)
	}
}

pub type QueryResult<T> = Result<T, QueryError>;

/// Why an incomplete query stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteReason {
	/// Output buffers filled up; drain them and submit again.
	UserBufferSize,
	/// The memory budget stopped tile loading; submit again.
	MemoryBudget,
	/// A single-cell partition still overflows; the query cannot finish.
	Unsplittable,
}

/// Result of one `submit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
	Complete,
	Incomplete(IncompleteReason),
}

impl QueryStatus {
	pub fn is_complete(&self) -> bool {
		matches!(self, QueryStatus::Complete)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_from_anyhow_is_internal() {
		let error: QueryError = anyhow::anyhow!("boom").into();
		assert!(matches!(error, QueryError::Internal(_)));
	}

	#[test]
	fn test_status() {
		assert!(QueryStatus::Complete.is_complete());
		assert!(!QueryStatus::Incomplete(IncompleteReason::UserBufferSize).is_complete());
	}
}
