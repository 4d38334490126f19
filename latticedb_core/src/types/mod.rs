//! Fundamental value types: byte buffers, byte ranges, datatypes, typed
//! ranges and the size-limited cache.

mod blob;
pub use blob::*;

mod byte_range;
pub use byte_range::*;

mod datatype;
pub use datatype::*;

mod limited_cache;
pub use limited_cache::*;

mod range;
pub use range::*;

mod value;
pub use value::*;
