//! The tile filter pipeline: compression codecs and the chunked tile
//! framing.

mod compression;
pub use compression::*;

mod pipeline;
pub use pipeline::*;
