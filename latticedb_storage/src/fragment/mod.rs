//! Fragment metadata: the read-only description of one immutable write unit.

mod metadata;
pub use metadata::*;
