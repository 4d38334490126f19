//! Cooperative cancellation.
//!
//! The token is polled at three checkpoints per iteration: after the initial
//! tile loads, before the merge, and between slab copies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A shareable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::Relaxed);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_cancel_is_shared() {
		let token = CancellationToken::new();
		let clone = token.clone();
		assert!(!clone.is_cancelled());
		token.cancel();
		assert!(clone.is_cancelled());
	}
}
