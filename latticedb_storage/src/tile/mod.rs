//! Logical tiles and coordinate tile views.

mod coords;
pub use coords::*;

mod tile_impl;
pub use tile_impl::*;
