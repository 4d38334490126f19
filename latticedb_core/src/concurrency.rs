//! Concurrency limits for the engine's bounded fan-out.
//!
//! Tile reads are I/O-bound, bitmap computation is CPU-bound; both fan out
//! through `buffer_unordered` with the limits below.

use num_cpus;

/// Concurrency limits per workload type.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimits {
	/// I/O-bound operations (tile reads): waiting dominates, so run well
	/// above the CPU count.
	pub io_bound: usize,
	/// CPU-bound operations (bitmaps, unfiltering, sorting).
	pub cpu_bound: usize,
}

impl ConcurrencyLimits {
	pub fn new(io_bound: usize, cpu_bound: usize) -> Self {
		Self {
			io_bound: io_bound.max(1),
			cpu_bound: cpu_bound.max(1),
		}
	}
}

impl Default for ConcurrencyLimits {
	fn default() -> Self {
		let cpus = num_cpus::get();
		Self {
			io_bound: (cpus * 3).max(1),
			cpu_bound: cpus.max(1),
		}
	}
}
